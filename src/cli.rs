//! Operational commands: key listing, the chain-wide SQL query runner,
//! offline block authoring, chain creation and HTTP bootstrapping.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use crate::block::{
    self, CURRENT_BLOCK_VERSION, KEY_OP_ADD, META_CREATOR, META_CREATOR_PUBLIC_KEY,
    META_DESCRIPTION, META_PREVIOUS_BLOCK_HASH, META_PREVIOUS_BLOCK_HASH_SIGNATURE,
    META_TIMESTAMP, META_VERSION,
};
use crate::chain::{self, keyring, Chain, GENESIS_PREVIOUS_BLOCK_HASH};
use crate::chainparams::{ChainParams, NewChainParams, CHAIN_PARAMS_BASENAME};
use crate::config::Config;
use crate::crypto;
use crate::db::{self, DbPool};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Chain(#[from] chain::ChainError),

    #[error(transparent)]
    Block(#[from] block::BlockError),

    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),

    #[error(transparent)]
    Store(#[from] db::StoreError),

    #[error(transparent)]
    ChainParams(#[from] crate::chainparams::ChainParamsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// `mykeys`: print the public key hashes backed by local private keys.
pub fn my_keys(private_db: &DbPool) -> Result<(), CliError> {
    let conn = db::lock(private_db)?;
    for hash in keyring::my_public_key_hashes(&conn)? {
        println!("{}", hash);
    }
    Ok(())
}

/// `query <sql>`: run a read-only query over every block from the tip
/// down, printing each row as a JSON object. Blocks whose payload doesn't
/// match the query are counted, not fatal.
pub fn query(chain: &Chain, sql: &str) -> Result<(), CliError> {
    tracing::info!(sql, "Running query");
    let mut error_count = 0usize;
    for height in (1..=chain.height()?).rev() {
        let filename = chain.block_filename(height);
        let conn = Connection::open_with_flags(&filename, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(block::BlockError::from)?;
        let mut stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(_) => {
                error_count += 1;
                continue;
            }
        };
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = match stmt.query([]) {
            Ok(rows) => rows,
            Err(_) => {
                error_count += 1;
                continue;
            }
        };
        while let Some(row) = rows.next().map_err(block::BlockError::from)? {
            let mut object = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value = match row.get_ref(i).map_err(block::BlockError::from)? {
                    ValueRef::Null => serde_json::Value::Null,
                    ValueRef::Integer(v) => serde_json::Value::from(v),
                    ValueRef::Real(v) => serde_json::Value::from(v),
                    ValueRef::Text(v) => {
                        serde_json::Value::from(String::from_utf8_lossy(v).into_owned())
                    }
                    ValueRef::Blob(v) => {
                        serde_json::Value::from(String::from_utf8_lossy(v).into_owned())
                    }
                };
                object.insert(name.clone(), value);
            }
            println!("{}", serde_json::Value::Object(object));
        }
    }
    if error_count != 0 {
        tracing::warn!(error_count, "Some blocks could not run the query");
    }
    Ok(())
}

/// `signimportblock <file>`: turn a prepared SQLite database into the next
/// block: write its metadata, sign the previous hash and the finished
/// file hash with a local key, then run normal admission.
pub fn sign_import_block(chain: &Chain, file: &str) -> Result<i64, CliError> {
    let keypair = crypto::load_keypair(&chain.main_db, &chain.private_db)?;

    let tip = chain.height()?;
    if tip < 0 {
        return Err(CliError::Invalid(
            "the chain is empty; create one with `newchain` first".to_string(),
        ));
    }
    let prev = {
        let conn = db::lock(&chain.main_db)?;
        chain::index::block_by_height(&conn, tip)?
            .ok_or(chain::ChainError::MissingRecord(tip))?
    };

    let conn = block::open_for_authoring(Path::new(file))?;
    block::ensure_block_tables(&conn)?;
    block::set_meta(&conn, META_VERSION, &CURRENT_BLOCK_VERSION.to_string())?;
    block::set_meta(&conn, META_PREVIOUS_BLOCK_HASH, &prev.hash)?;
    let prev_signature_hex = keypair.sign_hex(&prev.hash)?;
    block::set_meta(&conn, META_PREVIOUS_BLOCK_HASH_SIGNATURE, &prev_signature_hex)?;
    block::set_meta(&conn, META_TIMESTAMP, &chrono::Utc::now().to_rfc2822())?;

    let my_record = {
        let main = db::lock(&chain.main_db)?;
        keyring::get_public_key(&main, &keypair.public_key_hash)?
    };
    if let Some(creator) = my_record
        .and_then(|record| record.metadata)
        .and_then(|metadata| metadata.get("BlockCreator").cloned())
    {
        block::set_meta(&conn, META_CREATOR, &creator)?;
    }
    block::set_meta(&conn, META_CREATOR_PUBLIC_KEY, &keypair.public_key_hash)?;
    drop(conn);

    let hash = block::hash_file_hex(Path::new(file))?;
    let hash_signature = hex::decode(keypair.sign_hex(&hash)?)
        .map_err(|e| crypto::CryptoError::BadFormat(format!("hex: {}", e)))?;

    let height = chain.accept_block(Path::new(file), &hash_signature)?;
    tracing::info!(height, %hash, "Signed and imported block");
    Ok(height)
}

/// `newchain <chainparams.json>`: author a genesis block and a complete
/// chainparams.json in an empty data directory.
pub fn new_chain(cfg: &Config, params_file: &str) -> Result<(), CliError> {
    let mut ncp = NewChainParams::load(Path::new(params_file))?;
    if !ncp.params.genesis_block_hash.is_empty()
        || !ncp.params.genesis_block_hash_signature.is_empty()
        || !ncp.params.creator_public_key.is_empty()
    {
        return Err(CliError::Invalid(
            "chainparams.json must not contain cryptographic properties".to_string(),
        ));
    }
    if ncp.params.genesis_block_timestamp.is_empty() {
        ncp.params.genesis_block_timestamp = chrono::Utc::now().to_rfc2822();
    }
    ensure_empty_data_dir(&cfg.data_dir)?;
    tracing::info!(params_file, "Creating a new blockchain");

    let blocks_dir = Path::new(&cfg.data_dir).join(chain::BLOCKS_SUBDIRECTORY);
    std::fs::create_dir_all(&blocks_dir)?;
    let genesis_file = blocks_dir.join("block_00000000.db");

    let fresh = ncp.genesis_db.is_empty() || !Path::new(&ncp.genesis_db).exists();
    if !fresh {
        std::fs::copy(&ncp.genesis_db, &genesis_file)?;
    }

    tracing::info!(file = %genesis_file.display(), "Creating the genesis block");
    let conn = block::open_for_authoring(&genesis_file)?;
    if fresh {
        conn.execute_batch("PRAGMA page_size=512")
            .map_err(block::BlockError::from)?;
    }
    block::ensure_block_tables(&conn)?;
    block::set_meta(&conn, META_VERSION, &CURRENT_BLOCK_VERSION.to_string())?;
    block::set_meta(&conn, META_PREVIOUS_BLOCK_HASH, GENESIS_PREVIOUS_BLOCK_HASH)?;
    block::set_meta(&conn, META_CREATOR, &ncp.params.creator)?;
    block::set_meta(&conn, META_TIMESTAMP, &ncp.params.genesis_block_timestamp)?;
    if let Some(description) = &ncp.params.description {
        block::set_meta(&conn, META_DESCRIPTION, description)?;
    }

    let (main_db, private_db) = db::init(&cfg.data_dir, &ncp.params.bootstrap_peers)?;
    crypto::ensure_default_keypair(&main_db, &private_db)?;
    let my_hashes = {
        let conn = db::lock(&private_db)?;
        keyring::my_public_key_hashes(&conn)?
    };
    if my_hashes.len() != 1 {
        return Err(CliError::Invalid(format!(
            "expected exactly one genesis keypair, found {}",
            my_hashes.len()
        )));
    }
    let keypair = crypto::load_keypair(&main_db, &private_db)?;
    tracing::info!(key = %keypair.public_key_hash, "Genesis public key");

    block::set_meta(&conn, META_CREATOR_PUBLIC_KEY, &keypair.public_key_hash)?;
    let prev_signature_hex = keypair.sign_hex(GENESIS_PREVIOUS_BLOCK_HASH)?;
    block::set_meta(&conn, META_PREVIOUS_BLOCK_HASH_SIGNATURE, &prev_signature_hex)?;

    // The genesis key vouches for itself.
    let public_der = keypair.public_key_der()?;
    let self_signature = keypair.sign_key_hash(&keypair.public_key_hash)?;
    block::insert_key_op(
        &conn,
        KEY_OP_ADD,
        &keypair.public_key_hash,
        &public_der,
        &keypair.public_key_hash,
        &self_signature,
        None,
    )?;
    drop(conn);

    let genesis_hash = block::hash_file_hex(&genesis_file)?;
    tracing::info!(hash = %genesis_hash, "Genesis block hash");
    ncp.params.genesis_block_hash = genesis_hash.clone();
    ncp.params.genesis_block_hash_signature = keypair.sign_hex(&genesis_hash)?;
    ncp.params.creator_public_key = keypair.public_key_hash.clone();
    ncp.params
        .save(&Path::new(&cfg.data_dir).join(CHAIN_PARAMS_BASENAME))?;

    // Reload through the normal path to record and verify the new chain.
    tracing::info!("Reloading to verify");
    let chain = Chain::new(main_db, private_db, ncp.params, &cfg.data_dir);
    chain.init()?;
    tracing::info!("All done");
    Ok(())
}

/// `pull <base-url>`: bootstrap from another node's block web server.
pub async fn pull(cfg: &Config, base_url: &str) -> Result<(), CliError> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };

    let params: ChainParams = reqwest::get(format!("{}chainparams.json", base))
        .await?
        .error_for_status()?
        .json()
        .await?;
    params.check_complete()?;

    let genesis_bytes = reqwest::get(format!("{}block/0", base))
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    ensure_empty_data_dir(&cfg.data_dir)?;
    let blocks_dir = Path::new(&cfg.data_dir).join(chain::BLOCKS_SUBDIRECTORY);
    std::fs::create_dir_all(&blocks_dir)?;
    let genesis_file = blocks_dir.join("block_00000000.db");
    std::fs::write(&genesis_file, &genesis_bytes)?;

    let genesis_hash = block::hash_file_hex(&genesis_file)?;
    if genesis_hash != params.genesis_block_hash {
        return Err(CliError::Invalid(format!(
            "mismatching genesis block hash: {} fetched vs {} declared",
            genesis_hash, params.genesis_block_hash
        )));
    }

    let (main_db, private_db) = db::init(&cfg.data_dir, &params.bootstrap_peers)?;
    crypto::ensure_default_keypair(&main_db, &private_db)?;
    params.save(&Path::new(&cfg.data_dir).join(CHAIN_PARAMS_BASENAME))?;

    // init() ingests the genesis key ops, checks the genesis signature
    // against the embedded creator key, and re-verifies the chain.
    tracing::info!("Reloading to verify");
    let chain = Chain::new(main_db, private_db, params, &cfg.data_dir);
    tokio::task::spawn_blocking(move || chain.init())
        .await
        .map_err(|e| CliError::Invalid(format!("join error: {}", e)))??;
    tracing::info!("All done");
    Ok(())
}

fn ensure_empty_data_dir(data_dir: &str) -> Result<(), CliError> {
    let path = Path::new(data_dir);
    if path.exists() {
        if std::fs::read_dir(path)?.next().is_some() {
            return Err(CliError::Invalid(format!(
                "data directory must be empty: {}",
                data_dir
            )));
        }
    } else {
        std::fs::create_dir_all(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}
