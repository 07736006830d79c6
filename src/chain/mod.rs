//! Chain state engine: block admission, startup re-verification, genesis
//! bootstrap and the quorum-gated signatory ledger.
//!
//! The engine is the sole writer of the chain index and the accepted-key
//! ledger. Admissions are serialized by an engine-level lock and every
//! main-store mutation of one admission happens in a single transaction,
//! so a rejected block leaves no trace.

pub mod index;
pub mod keyring;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::block::{self, Block, BlockError, KEY_OP_ADD, KEY_OP_REVOKE};
use crate::chainparams::ChainParams;
use crate::crypto::{self, CryptoError};
use crate::db::models::BlockRecord;
use crate::db::{self, DbPool, StoreError};

/// Stand-in "previous block" hash of the genesis block.
pub const GENESIS_PREVIOUS_BLOCK_HASH: &str =
    "1000000000000000000000000000000000000000000000000000000000000001";

/// Subdirectory of the data dir holding the block files.
pub const BLOCKS_SUBDIRECTORY: &str = "blocks";

/// Config-table key pinning the chain this data directory belongs to.
const CONFIG_GENESIS_HASH: &str = "genesis_block_hash";

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("unsupported block version: {0}")]
    UnsupportedVersion(i64),

    #[error("cannot find previous block {0}")]
    OrphanBlock(String),

    #[error("a block already exists at height {0} and replacement is unsupported")]
    ReplacementUnsupported(i64),

    #[error("block signer {0} is not an accepted public key")]
    UnknownSigner(String),

    #[error("block signer {0} is revoked")]
    RevokedSigner(String),

    #[error("quorum not met for key ops on {target}: {got} signatures, {required} required")]
    QuorumNotMet {
        target: String,
        got: usize,
        required: usize,
    },

    #[error("signer {signer} appears more than once in key ops for {target}")]
    DuplicateOpSigner { target: String, signer: String },

    #[error("key op signer {signer} is not active at height {height}")]
    InactiveOpSigner { signer: String, height: i64 },

    #[error("attempt to add an already accepted key {0}")]
    DuplicateAdd(String),

    #[error("attempt to revoke a key that is not active: {0}")]
    RevokeMissing(String),

    #[error("invalid key op {op:?} on {target}")]
    InvalidKeyOp { op: String, target: String },

    #[error("hash mismatch at height {height}: {reason}")]
    HashMismatch { height: i64, reason: String },

    #[error("no block record at height {0}")]
    MissingRecord(i64),

    #[error("block {hash} at height {actual} referenced as previous of height {expected}")]
    LinkMismatch {
        hash: String,
        actual: i64,
        expected: i64,
    },

    #[error("no genesis block file; create a chain with `newchain` or fetch one with `pull`")]
    GenesisMissing,

    #[error("data directory belongs to chain {found}, not {expected}")]
    WrongChain { found: String, expected: String },

    #[error("cannot parse chain timestamp {0:?}")]
    BadTimestamp(String),

    #[error("signature verification failed for {context}: {source}")]
    Signature {
        context: String,
        source: CryptoError,
    },

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Required count of distinct active-signatory signatures on each key
/// operation in a block at the given height.
pub fn quorum_for_height(height: i64) -> usize {
    if height < 149 {
        1
    } else {
        ((height as f64).ln() * 2.0) as usize
    }
}

pub struct Chain {
    pub main_db: DbPool,
    pub private_db: DbPool,
    pub params: ChainParams,
    blocks_dir: PathBuf,
    accept_lock: Mutex<()>,
}

impl Chain {
    pub fn new(main_db: DbPool, private_db: DbPool, params: ChainParams, data_dir: &str) -> Self {
        Chain {
            main_db,
            private_db,
            params,
            blocks_dir: Path::new(data_dir).join(BLOCKS_SUBDIRECTORY),
            accept_lock: Mutex::new(()),
        }
    }

    /// Filename of the block at the given height inside the chain directory.
    pub fn block_filename(&self, height: i64) -> PathBuf {
        self.blocks_dir.join(format!("block_{:08x}.db", height))
    }

    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }

    pub fn height(&self) -> Result<i64, ChainError> {
        let conn = db::lock(&self.main_db)?;
        Ok(index::height(&conn)?)
    }

    /// Initialize the chain: create the block directory, bootstrap the
    /// genesis block on first run, pin the chain identity, then re-verify
    /// the whole chain. Any failure here is fatal to the node.
    pub fn init(&self) -> Result<(), ChainError> {
        std::fs::create_dir_all(&self.blocks_dir)?;

        match db::get_config_value(&self.main_db, CONFIG_GENESIS_HASH)? {
            Some(found) if found != self.params.genesis_block_hash => {
                return Err(ChainError::WrongChain {
                    found,
                    expected: self.params.genesis_block_hash.clone(),
                })
            }
            Some(_) => {}
            None => db::set_config_value(
                &self.main_db,
                CONFIG_GENESIS_HASH,
                &self.params.genesis_block_hash,
            )?,
        }

        if self.height()? == -1 {
            tracing::info!("Noticing the existence of the genesis block. Let there be light.");
            crypto::ensure_default_keypair(&self.main_db, &self.private_db)?;
            self.bootstrap_genesis()?;
        }
        self.verify_everything()
    }

    /// Ingest the genesis block found at blocks/block_00000000.db: check
    /// its hash against the chain parameters, record its key additions at
    /// height 0, verify the genesis signature under the creator key, and
    /// insert the index row.
    fn bootstrap_genesis(&self) -> Result<(), ChainError> {
        let path = self.block_filename(0);
        if !path.exists() {
            return Err(ChainError::GenesisMissing);
        }

        let blk = Block::open(&path)?;
        if blk.hash != self.params.genesis_block_hash {
            return Err(ChainError::HashMismatch {
                height: 0,
                reason: format!(
                    "genesis file hashes to {}, chain parameters say {}",
                    blk.hash, self.params.genesis_block_hash
                ),
            });
        }

        let time_accepted = chrono::DateTime::parse_from_rfc2822(
            &self.params.genesis_block_timestamp,
        )
        .map_err(|_| ChainError::BadTimestamp(self.params.genesis_block_timestamp.clone()))?
        .timestamp();

        let mut conn = db::lock(&self.main_db)?;
        let tx = conn.transaction().map_err(StoreError::from)?;

        for (target, ops) in blk.key_ops()? {
            for op in &ops {
                if op.op != KEY_OP_ADD || keyring::public_key_exists(&tx, &target)? {
                    continue;
                }
                let metadata = op
                    .metadata
                    .as_ref()
                    .and_then(|m| serde_json::to_string(m).ok());
                keyring::write_public_key(&tx, &op.public_key, &target, 0, metadata.as_deref())?;
            }
        }

        // The chain-params signature must verify under the creator key
        // carried inside the genesis block itself.
        let creator = keyring::get_public_key(&tx, &self.params.creator_public_key)?
            .ok_or_else(|| ChainError::UnknownSigner(self.params.creator_public_key.clone()))?;
        let creator_key = crypto::decode_public_key(&creator.public_key)?;
        crypto::verify_hex(
            &creator_key,
            &self.params.genesis_block_hash,
            &self.params.genesis_block_hash_signature,
        )
        .map_err(|source| ChainError::Signature {
            context: "genesis block hash".to_string(),
            source,
        })?;

        let hash_signature = hex::decode(&self.params.genesis_block_hash_signature)
            .map_err(|e| CryptoError::BadFormat(format!("genesis signature hex: {}", e)))?;
        index::insert_block(
            &tx,
            &BlockRecord {
                hash: blk.hash.clone(),
                height: 0,
                previous_block_hash: blk.previous_block_hash.clone(),
                signatory_key_hash: blk.creator_public_key_hash.clone(),
                hash_signature,
                previous_hash_signature: blk.previous_block_hash_signature.clone(),
                time_accepted,
                version: blk.version,
            },
        )?;
        tx.commit().map_err(StoreError::from)?;
        tracing::info!(hash = %blk.hash, "Genesis block recorded");
        Ok(())
    }

    /// Walk the whole chain from height 0 and re-apply every verification
    /// step against the as-of-height key ledger. Pure: nothing is written.
    pub fn verify_everything(&self) -> Result<(), ChainError> {
        let max_height = self.height()?;
        for height in 0..=max_height {
            if height > 0 && height % 1000 == 0 {
                tracing::info!(height, "Verifying block");
            }
            self.verify_block_at(height)?;
        }
        Ok(())
    }

    fn verify_block_at(&self, height: i64) -> Result<(), ChainError> {
        let path = self.block_filename(height);
        let file_hash = block::hash_file_hex(&path)?;

        let conn = db::lock(&self.main_db)?;
        let record =
            index::block_by_height(&conn, height)?.ok_or(ChainError::MissingRecord(height))?;
        if file_hash != record.hash {
            return Err(ChainError::HashMismatch {
                height,
                reason: format!("file hash {} vs recorded {}", file_hash, record.hash),
            });
        }
        if height == 0 && file_hash != self.params.genesis_block_hash {
            return Err(ChainError::HashMismatch {
                height,
                reason: "genesis hash doesn't match chain parameters".to_string(),
            });
        }
        if height > 0 {
            let prev = index::block_by_hash(&conn, &record.previous_block_hash)?
                .ok_or_else(|| ChainError::OrphanBlock(record.previous_block_hash.clone()))?;
            if prev.height != height - 1 {
                return Err(ChainError::LinkMismatch {
                    hash: prev.hash,
                    actual: prev.height,
                    expected: height,
                });
            }
        }

        let signatory = keyring::get_public_key(&conn, &record.signatory_key_hash)?
            .ok_or_else(|| ChainError::UnknownSigner(record.signatory_key_hash.clone()))?;
        if !signatory.is_active_at(height) {
            return Err(ChainError::RevokedSigner(record.signatory_key_hash.clone()));
        }
        let signatory_key = crypto::decode_public_key(&signatory.public_key)?;
        crypto::verify_hex_bytes(&signatory_key, &record.hash, &record.hash_signature).map_err(
            |source| ChainError::Signature {
                context: format!("block hash at height {}", height),
                source,
            },
        )?;
        crypto::verify_hex_bytes(
            &signatory_key,
            &record.previous_block_hash,
            &record.previous_hash_signature,
        )
        .map_err(|source| ChainError::Signature {
            context: format!("previous block hash at height {}", height),
            source,
        })?;

        let blk = Block::open(&path)?;
        self.verify_key_ops(&conn, &blk, height)?;
        Ok(())
    }

    /// Shared key-op rules: each group needs >= Q distinct signatures from
    /// signers that are accepted and active as of this height.
    fn verify_key_ops(
        &self,
        conn: &rusqlite::Connection,
        blk: &Block,
        height: i64,
    ) -> Result<std::collections::BTreeMap<String, Vec<block::KeyOp>>, ChainError> {
        let groups = blk.key_ops()?;
        let required = quorum_for_height(height);
        for (target, ops) in &groups {
            if ops.len() < required {
                return Err(ChainError::QuorumNotMet {
                    target: target.clone(),
                    got: ops.len(),
                    required,
                });
            }
            let mut seen = HashSet::new();
            for op in ops {
                if !seen.insert(op.signer_hash.clone()) {
                    return Err(ChainError::DuplicateOpSigner {
                        target: target.clone(),
                        signer: op.signer_hash.clone(),
                    });
                }
                let signer = keyring::get_public_key(conn, &op.signer_hash)?
                    .ok_or_else(|| ChainError::UnknownSigner(op.signer_hash.clone()))?;
                if !signer.is_active_at(height) {
                    return Err(ChainError::InactiveOpSigner {
                        signer: op.signer_hash.clone(),
                        height,
                    });
                }
                let signer_key = crypto::decode_public_key(&signer.public_key)?;
                crypto::verify_key_hash_signature(&signer_key, target, &op.signature).map_err(
                    |source| ChainError::Signature {
                        context: format!("key op for {} by {}", target, op.signer_hash),
                        source,
                    },
                )?;
            }
        }
        Ok(groups)
    }

    /// Admit a newly received block file with its claimed hash signature.
    /// On success the file has been copied into the chain directory and
    /// the index updated; the new height is returned. On failure nothing
    /// has changed.
    pub fn accept_block(&self, file: &Path, hash_signature: &[u8]) -> Result<i64, ChainError> {
        let _admission = self.accept_lock.lock().map_err(|_| StoreError::Lock)?;

        let blk = Block::open(file)?;
        if blk.version != block::CURRENT_BLOCK_VERSION {
            return Err(ChainError::UnsupportedVersion(blk.version));
        }

        let mut conn = db::lock(&self.main_db)?;
        let tx = conn.transaction().map_err(StoreError::from)?;

        let prev = index::block_by_hash(&tx, &blk.previous_block_hash)?
            .ok_or_else(|| ChainError::OrphanBlock(blk.previous_block_hash.clone()))?;
        let height = prev.height + 1;
        if index::height_exists(&tx, height)? {
            return Err(ChainError::ReplacementUnsupported(height));
        }

        let signatory = keyring::get_public_key(&tx, &blk.creator_public_key_hash)?
            .ok_or_else(|| ChainError::UnknownSigner(blk.creator_public_key_hash.clone()))?;
        if signatory.is_revoked() {
            return Err(ChainError::RevokedSigner(blk.creator_public_key_hash.clone()));
        }
        let signatory_key = crypto::decode_public_key(&signatory.public_key)?;
        crypto::verify_hex_bytes(
            &signatory_key,
            &blk.previous_block_hash,
            &blk.previous_block_hash_signature,
        )
        .map_err(|source| ChainError::Signature {
            context: "previous block hash".to_string(),
            source,
        })?;
        crypto::verify_hex_bytes(&signatory_key, &blk.hash, hash_signature).map_err(|source| {
            ChainError::Signature {
                context: "block hash".to_string(),
                source,
            }
        })?;

        let groups = self.verify_key_ops(&tx, &blk, height)?;
        for (target, ops) in &groups {
            match ops[0].op.as_str() {
                KEY_OP_ADD => {
                    if keyring::public_key_exists(&tx, target)? {
                        return Err(ChainError::DuplicateAdd(target.clone()));
                    }
                    let metadata = ops[0]
                        .metadata
                        .as_ref()
                        .and_then(|m| serde_json::to_string(m).ok());
                    keyring::write_public_key(
                        &tx,
                        &ops[0].public_key,
                        target,
                        height,
                        metadata.as_deref(),
                    )?;
                }
                KEY_OP_REVOKE => {
                    let existing = keyring::get_public_key(&tx, target)?
                        .ok_or_else(|| ChainError::RevokeMissing(target.clone()))?;
                    if existing.is_revoked() {
                        return Err(ChainError::RevokeMissing(target.clone()));
                    }
                    keyring::revoke_public_key(&tx, target, height)?;
                }
                other => {
                    return Err(ChainError::InvalidKeyOp {
                        op: other.to_string(),
                        target: target.clone(),
                    })
                }
            }
        }

        index::insert_block(
            &tx,
            &BlockRecord {
                hash: blk.hash.clone(),
                height,
                previous_block_hash: blk.previous_block_hash.clone(),
                signatory_key_hash: blk.creator_public_key_hash.clone(),
                hash_signature: hash_signature.to_vec(),
                previous_hash_signature: blk.previous_block_hash_signature.clone(),
                time_accepted: chrono::Utc::now().timestamp(),
                version: blk.version,
            },
        )?;

        let destination = self.block_filename(height);
        copy_block_file(file, &destination)?;
        if let Err(e) = tx.commit() {
            let _ = std::fs::remove_file(&destination);
            return Err(StoreError::from(e).into());
        }

        tracing::info!(hash = %blk.hash, height, "Accepted block");
        Ok(height)
    }
}

/// Copy a block file into place with world-readable permissions.
fn copy_block_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dst)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}
