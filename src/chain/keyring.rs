//! The accepted-key ledger (main store) and private key records (private
//! store). Accepted keys are never deleted; revocation flips state and
//! records the height so activity can be reconstructed as of any height.

use rusqlite::Connection;
use std::collections::HashMap;

use crate::db::models::PublicKeyRecord;
use crate::db::StoreError;

/// Record an accepted public key, active from the given height (-1 marks a
/// locally generated key that is not part of any block yet).
pub fn write_public_key(
    conn: &Connection,
    public_key_der: &[u8],
    public_key_hash: &str,
    height: i64,
    metadata: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO pubkeys (pubkey_hash, pubkey, state, time_added, added_at_height, metadata)
         VALUES (?1, ?2, 'A', ?3, ?4, ?5)",
        rusqlite::params![
            public_key_hash,
            hex::encode(public_key_der),
            chrono::Utc::now().timestamp(),
            height,
            metadata,
        ],
    )?;
    Ok(())
}

/// Mark a key revoked as of the given height. The row stays.
pub fn revoke_public_key(
    conn: &Connection,
    public_key_hash: &str,
    height: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE pubkeys SET state = 'R', time_revoked = ?2, revoked_at_height = ?3
         WHERE pubkey_hash = ?1",
        rusqlite::params![
            public_key_hash,
            chrono::Utc::now().timestamp(),
            height,
        ],
    )?;
    Ok(())
}

pub fn get_public_key(
    conn: &Connection,
    public_key_hash: &str,
) -> Result<Option<PublicKeyRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT pubkey_hash, pubkey, state, time_added, time_revoked,
                added_at_height, revoked_at_height, COALESCE(metadata, '')
         FROM pubkeys WHERE pubkey_hash = ?1",
    )?;
    let mut rows = stmt.query(rusqlite::params![public_key_hash])?;
    let row = match rows.next()? {
        Some(row) => row,
        None => return Ok(None),
    };

    let public_key_hex: String = row.get(1)?;
    let metadata_json: String = row.get(7)?;
    let metadata: Option<HashMap<String, String>> = if metadata_json.is_empty() {
        None
    } else {
        serde_json::from_str(&metadata_json).ok()
    };

    Ok(Some(PublicKeyRecord {
        public_key_hash: row.get(0)?,
        public_key: hex::decode(&public_key_hex).map_err(|_| {
            StoreError::Sqlite(rusqlite::Error::InvalidColumnType(
                1,
                "pubkey".to_string(),
                rusqlite::types::Type::Text,
            ))
        })?,
        state: row.get(2)?,
        time_added: row.get(3)?,
        time_revoked: row.get(4)?,
        added_at_height: row.get(5)?,
        revoked_at_height: row.get(6)?,
        metadata,
    }))
}

pub fn public_key_exists(conn: &Connection, public_key_hash: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pubkeys WHERE pubkey_hash = ?1",
        rusqlite::params![public_key_hash],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Store a private key (SEC1 DER) in the private store.
pub fn write_private_key(
    conn: &Connection,
    private_key_der: &[u8],
    public_key_hash: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO privkeys (pubkey_hash, privkey, time_added) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            public_key_hash,
            hex::encode(private_key_der),
            chrono::Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

/// One private key from the private store, with its public hash.
pub fn get_a_private_key(conn: &Connection) -> Result<Option<(Vec<u8>, String)>, StoreError> {
    let mut stmt = conn.prepare("SELECT privkey, pubkey_hash FROM privkeys LIMIT 1")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let privkey_hex: String = row.get(0)?;
            let hash: String = row.get(1)?;
            let der = hex::decode(&privkey_hex).map_err(|_| {
                StoreError::Sqlite(rusqlite::Error::InvalidColumnType(
                    0,
                    "privkey".to_string(),
                    rusqlite::types::Type::Text,
                ))
            })?;
            Ok(Some((der, hash)))
        }
        None => Ok(None),
    }
}

pub fn num_private_keys(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM privkeys", [], |row| row.get(0))?)
}

/// Hashes of the public keys backed by local private keys.
pub fn my_public_key_hashes(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT pubkey_hash FROM privkeys ORDER BY time_added")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut hashes = Vec::new();
    for row in rows {
        hashes.push(row?);
    }
    Ok(hashes)
}
