pub mod migrations;
pub mod models;
pub mod peers;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Filename of the main store (chain index, accepted keys, peers, config).
pub const MAIN_DB_FILENAME: &str = "daisy.db";

/// Filename of the private store (private keys only). Mode 0600.
pub const PRIVATE_DB_FILENAME: &str = "private.db";

/// Shared store handle. rusqlite is synchronous, so we wrap in Arc<Mutex>
/// and run store work through tokio::task::spawn_blocking on async paths.
pub type DbPool = Arc<Mutex<Connection>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Lock,
}

/// Lock a store handle, mapping a poisoned mutex to a store error.
pub fn lock(pool: &DbPool) -> Result<MutexGuard<'_, Connection>, StoreError> {
    pool.lock().map_err(|_| StoreError::Lock)
}

/// Initialize both system stores inside the data directory, creating the
/// directory (mode 0700) and the schemas on first use. Bootstrap peers are
/// seeded as permanent entries when the peers table is created empty.
pub fn init(data_dir: &str, bootstrap_peers: &[String]) -> Result<(DbPool, DbPool), StoreError> {
    std::fs::create_dir_all(data_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let main_path = Path::new(data_dir).join(MAIN_DB_FILENAME);
    let mut main = Connection::open(&main_path)?;
    migrations::main_migrations().to_latest(&mut main)?;

    let private_path = Path::new(data_dir).join(PRIVATE_DB_FILENAME);
    let mut private = Connection::open(&private_path)?;
    migrations::private_migrations().to_latest(&mut private)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let main = Arc::new(Mutex::new(main));
    peers::seed_bootstrap_peers(&main, bootstrap_peers)?;

    tracing::info!("Stores initialized at {}", data_dir);
    Ok((main, Arc::new(Mutex::new(private))))
}

/// In-memory main store (tests).
pub fn open_memory() -> Result<DbPool, StoreError> {
    let mut conn = Connection::open_in_memory()?;
    migrations::main_migrations().to_latest(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory private store (tests).
pub fn open_memory_private() -> Result<DbPool, StoreError> {
    let mut conn = Connection::open_in_memory()?;
    migrations::private_migrations().to_latest(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Read a value from the main store's config table.
pub fn get_config_value(pool: &DbPool, key: &str) -> Result<Option<String>, StoreError> {
    let conn = lock(pool)?;
    let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
    let mut rows = stmt.query(rusqlite::params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Write a value into the main store's config table.
pub fn set_config_value(pool: &DbPool, key: &str, value: &str) -> Result<(), StoreError> {
    let conn = lock(pool)?;
    conn.execute(
        "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(())
}
