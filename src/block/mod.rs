//! The block container: one block is a self-contained SQLite database with
//! two reserved tables next to the payload.
//!
//! `_meta` is a key/value string table carrying the block metadata:
//!
//! ```text
//! PreviousBlockHash|1000000000000000000000000000000000000000000000000000000000000001
//! PreviousBlockHashSignature|3046022100db03...
//! CreatorPublicKey|1:a3c07ef6cbee246f231a61ff36bbcd8e8563723e3703eb345ecdd933d7709ae2
//! Version|1
//! ```
//!
//! `_keys` holds the signatory key operations, one row per (target, signer).

use rusqlite::{Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use crate::crypto;

/// Version of the block metadata this node understands.
pub const CURRENT_BLOCK_VERSION: i64 = 1;

/// Key-op adding a new signatory.
pub const KEY_OP_ADD: &str = "A";
/// Key-op revoking a signatory.
pub const KEY_OP_REVOKE: &str = "R";

pub const META_VERSION: &str = "Version";
pub const META_PREVIOUS_BLOCK_HASH: &str = "PreviousBlockHash";
pub const META_PREVIOUS_BLOCK_HASH_SIGNATURE: &str = "PreviousBlockHashSignature";
pub const META_CREATOR_PUBLIC_KEY: &str = "CreatorPublicKey";
pub const META_CREATOR: &str = "Creator";
pub const META_TIMESTAMP: &str = "Timestamp";
pub const META_DESCRIPTION: &str = "Description";

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("missing block metadata: {0}")]
    MissingMeta(&'static str),

    #[error("bad block metadata {key}: {reason}")]
    BadMeta { key: &'static str, reason: String },

    #[error("block file uses write-ahead journaling")]
    WalJournal,

    #[error("mixed key ops for a single public key {0}")]
    MixedKeyOps(String),

    #[error("public key hash doesn't match its key bytes for {0}")]
    KeyHashMismatch(String),

    #[error("bad key op row: {0}")]
    BadKeyOp(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),
}

/// One row of the `_keys` table, hex fields decoded.
#[derive(Debug, Clone)]
pub struct KeyOp {
    /// "A" or "R".
    pub op: String,
    /// Canonical hash of the key being added or revoked.
    pub public_key_hash: String,
    /// DER-SPKI bytes of that key.
    pub public_key: Vec<u8>,
    /// Canonical hash of the signing (vouching) key.
    pub signer_hash: String,
    /// DER signature over the target hash digest.
    pub signature: Vec<u8>,
    pub metadata: Option<HashMap<String, String>>,
}

/// An opened block file, read-only, with its metadata parsed and its
/// file hash computed.
pub struct Block {
    conn: Connection,
    pub path: PathBuf,
    /// Hex SHA-256 of the file bytes as found on disk.
    pub hash: String,
    pub version: i64,
    pub previous_block_hash: String,
    pub previous_block_hash_signature: Vec<u8>,
    pub creator_public_key_hash: String,
}

impl Block {
    /// Open a block file for verification or serving. The file is hashed
    /// first, then opened read-only; the container invariants (required
    /// `_meta` entries, rollback journaling) are enforced here.
    pub fn open(path: &Path) -> Result<Self, BlockError> {
        let hash = hash_file_hex(path)?;
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.eq_ignore_ascii_case("wal") {
            return Err(BlockError::WalJournal);
        }

        let version = meta_int(&conn, META_VERSION)?;
        let previous_block_hash = meta_string(&conn, META_PREVIOUS_BLOCK_HASH)?;
        let previous_block_hash_signature =
            meta_hex_bytes(&conn, META_PREVIOUS_BLOCK_HASH_SIGNATURE)?;
        let creator_public_key_hash = meta_string(&conn, META_CREATOR_PUBLIC_KEY)?;

        Ok(Block {
            conn,
            path: path.to_path_buf(),
            hash,
            version,
            previous_block_hash,
            previous_block_hash_signature,
            creator_public_key_hash,
        })
    }

    pub fn meta_string(&self, key: &'static str) -> Result<String, BlockError> {
        meta_string(&self.conn, key)
    }

    pub fn meta_int(&self, key: &'static str) -> Result<i64, BlockError> {
        meta_int(&self.conn, key)
    }

    pub fn meta_hex_bytes(&self, key: &'static str) -> Result<Vec<u8>, BlockError> {
        meta_hex_bytes(&self.conn, key)
    }

    /// All key operations in the block, grouped by target key hash. Each
    /// row's embedded public key must hash back to its declared target,
    /// and all rows of one group must carry the same op.
    pub fn key_ops(&self) -> Result<BTreeMap<String, Vec<KeyOp>>, BlockError> {
        let mut stmt = self.conn.prepare(
            "SELECT op, pubkey_hash, pubkey, sigkey_hash, signature, COALESCE(metadata, '')
             FROM _keys",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut groups: BTreeMap<String, Vec<KeyOp>> = BTreeMap::new();
        for row in rows {
            let (op, public_key_hash, public_key_hex, signer_hash, signature_hex, metadata_json) =
                row?;

            let public_key = hex::decode(&public_key_hex)
                .map_err(|e| BlockError::BadKeyOp(format!("pubkey hex: {}", e)))?;
            crypto::decode_public_key(&public_key)?;
            if crypto::public_key_hash(&public_key) != public_key_hash {
                return Err(BlockError::KeyHashMismatch(public_key_hash));
            }
            let signature = hex::decode(&signature_hex)
                .map_err(|e| BlockError::BadKeyOp(format!("signature hex: {}", e)))?;
            let metadata = if metadata_json.is_empty() {
                None
            } else {
                Some(serde_json::from_str(&metadata_json).map_err(|e| {
                    BlockError::BadKeyOp(format!("metadata JSON: {}", e))
                })?)
            };

            groups.entry(public_key_hash.clone()).or_default().push(KeyOp {
                op,
                public_key_hash,
                public_key,
                signer_hash,
                signature,
                metadata,
            });
        }

        for (hash, ops) in &groups {
            if ops.iter().any(|op| op.op != ops[0].op) {
                return Err(BlockError::MixedKeyOps(hash.clone()));
            }
        }
        Ok(groups)
    }
}

fn meta_string(conn: &Connection, key: &'static str) -> Result<String, BlockError> {
    let mut stmt = conn.prepare("SELECT value FROM _meta WHERE key = ?1")?;
    let mut rows = stmt.query(rusqlite::params![key])?;
    match rows.next()? {
        Some(row) => Ok(row.get(0)?),
        None => Err(BlockError::MissingMeta(key)),
    }
}

fn meta_int(conn: &Connection, key: &'static str) -> Result<i64, BlockError> {
    let value = meta_string(conn, key)?;
    value.parse().map_err(|_| BlockError::BadMeta {
        key,
        reason: format!("not an integer: {:?}", value),
    })
}

fn meta_hex_bytes(conn: &Connection, key: &'static str) -> Result<Vec<u8>, BlockError> {
    let value = meta_string(conn, key)?;
    hex::decode(&value).map_err(|e| BlockError::BadMeta {
        key,
        reason: format!("hex: {}", e),
    })
}

/// Open a block file read-write for authoring (signing, importing).
pub fn open_for_authoring(path: &Path) -> Result<Connection, BlockError> {
    Ok(Connection::open(path)?)
}

/// Make sure the reserved `_meta` and `_keys` tables exist in a block
/// being authored, and pin rollback journaling so the payload stays a
/// single self-contained file.
pub fn ensure_block_tables(conn: &Connection) -> Result<(), BlockError> {
    let _mode: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _meta (
             key   TEXT NOT NULL PRIMARY KEY,
             value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS _keys (
             op          TEXT NOT NULL,
             pubkey_hash TEXT NOT NULL,
             pubkey      TEXT NOT NULL,
             sigkey_hash TEXT NOT NULL,
             signature   TEXT NOT NULL,
             metadata    TEXT,
             PRIMARY KEY (pubkey_hash, sigkey_hash)
         );",
    )?;
    Ok(())
}

/// Store a metadata value in a block being authored.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), BlockError> {
    conn.execute(
        "INSERT OR REPLACE INTO _meta (key, value) VALUES (?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

/// Record a key operation row in a block being authored.
pub fn insert_key_op(
    conn: &Connection,
    op: &str,
    public_key_hash: &str,
    public_key: &[u8],
    signer_hash: &str,
    signature: &[u8],
    metadata: Option<&str>,
) -> Result<(), BlockError> {
    conn.execute(
        "INSERT INTO _keys (op, pubkey_hash, pubkey, sigkey_hash, signature, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            op,
            public_key_hash,
            hex::encode(public_key),
            signer_hash,
            hex::encode(signature),
            metadata,
        ],
    )?;
    Ok(())
}

/// Streaming hex SHA-256 of a file.
pub fn hash_file_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::db;

    fn author_minimal_block(path: &Path) {
        let conn = open_for_authoring(path).unwrap();
        ensure_block_tables(&conn).unwrap();
        set_meta(&conn, META_VERSION, "1").unwrap();
        set_meta(&conn, META_PREVIOUS_BLOCK_HASH, &"0".repeat(64)).unwrap();
        set_meta(&conn, META_PREVIOUS_BLOCK_HASH_SIGNATURE, "3006020101020101").unwrap();
        set_meta(&conn, META_CREATOR_PUBLIC_KEY, &format!("1:{}", "a".repeat(64))).unwrap();
    }

    #[test]
    fn open_reads_meta_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        author_minimal_block(&path);

        let block = Block::open(&path).unwrap();
        assert_eq!(block.version, 1);
        assert_eq!(block.previous_block_hash, "0".repeat(64));
        assert_eq!(block.hash, hash_file_hex(&path).unwrap());
        assert!(block.key_ops().unwrap().is_empty());
    }

    #[test]
    fn missing_meta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        let conn = open_for_authoring(&path).unwrap();
        ensure_block_tables(&conn).unwrap();
        set_meta(&conn, META_VERSION, "1").unwrap();
        drop(conn);

        assert!(matches!(
            Block::open(&path),
            Err(BlockError::MissingMeta(META_PREVIOUS_BLOCK_HASH))
        ));
    }

    #[test]
    fn non_integer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        author_minimal_block(&path);
        let conn = open_for_authoring(&path).unwrap();
        set_meta(&conn, META_VERSION, "not-a-number").unwrap();
        drop(conn);

        assert!(matches!(
            Block::open(&path),
            Err(BlockError::BadMeta { key: META_VERSION, .. })
        ));
    }

    #[test]
    fn wal_block_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        let conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "journal_mode", "WAL").unwrap();
        conn.execute_batch(
            "CREATE TABLE _meta (key TEXT NOT NULL PRIMARY KEY, value TEXT NOT NULL);",
        )
        .unwrap();
        drop(conn);

        assert!(matches!(Block::open(&path), Err(BlockError::WalJournal)));
    }

    #[test]
    fn key_ops_group_by_target() {
        let main = db::open_memory().unwrap();
        let private = db::open_memory_private().unwrap();
        let signer_a = crypto::generate_keypair(&main, &private, -1).unwrap();
        let signer_b = crypto::generate_keypair(&main, &private, -1).unwrap();
        let target = crypto::generate_keypair(&main, &private, -1).unwrap();
        let target_der = target.public_key_der().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        author_minimal_block(&path);
        let conn = open_for_authoring(&path).unwrap();
        for signer in [&signer_a, &signer_b] {
            let sig = signer.sign_key_hash(&target.public_key_hash).unwrap();
            insert_key_op(
                &conn,
                KEY_OP_ADD,
                &target.public_key_hash,
                &target_der,
                &signer.public_key_hash,
                &sig,
                Some(r#"{"BlockCreator":"someone"}"#),
            )
            .unwrap();
        }
        drop(conn);

        let block = Block::open(&path).unwrap();
        let groups = block.key_ops().unwrap();
        assert_eq!(groups.len(), 1);
        let ops = &groups[&target.public_key_hash];
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.op == KEY_OP_ADD));
        assert_eq!(
            ops[0].metadata.as_ref().unwrap()["BlockCreator"],
            "someone"
        );
    }

    #[test]
    fn mixed_ops_for_one_target_are_rejected() {
        let main = db::open_memory().unwrap();
        let private = db::open_memory_private().unwrap();
        let signer_a = crypto::generate_keypair(&main, &private, -1).unwrap();
        let signer_b = crypto::generate_keypair(&main, &private, -1).unwrap();
        let target = crypto::generate_keypair(&main, &private, -1).unwrap();
        let target_der = target.public_key_der().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        author_minimal_block(&path);
        let conn = open_for_authoring(&path).unwrap();
        let sig_a = signer_a.sign_key_hash(&target.public_key_hash).unwrap();
        let sig_b = signer_b.sign_key_hash(&target.public_key_hash).unwrap();
        insert_key_op(&conn, KEY_OP_ADD, &target.public_key_hash, &target_der,
            &signer_a.public_key_hash, &sig_a, None).unwrap();
        insert_key_op(&conn, KEY_OP_REVOKE, &target.public_key_hash, &target_der,
            &signer_b.public_key_hash, &sig_b, None).unwrap();
        drop(conn);

        let block = Block::open(&path).unwrap();
        assert!(matches!(block.key_ops(), Err(BlockError::MixedKeyOps(_))));
    }

    #[test]
    fn forged_target_hash_is_rejected() {
        let main = db::open_memory().unwrap();
        let private = db::open_memory_private().unwrap();
        let signer = crypto::generate_keypair(&main, &private, -1).unwrap();
        let target = crypto::generate_keypair(&main, &private, -1).unwrap();
        let target_der = target.public_key_der().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.db");
        author_minimal_block(&path);
        let conn = open_for_authoring(&path).unwrap();
        let forged_hash = format!("1:{}", "f".repeat(64));
        let sig = signer.sign_key_hash(&target.public_key_hash).unwrap();
        insert_key_op(&conn, KEY_OP_ADD, &forged_hash, &target_der,
            &signer.public_key_hash, &sig, None).unwrap();
        drop(conn);

        let block = Block::open(&path).unwrap();
        assert!(matches!(
            block.key_ops(),
            Err(BlockError::KeyHashMismatch(_))
        ));
    }
}
