//! Chain index queries over the main store's blockchain table.
//!
//! All functions take a raw connection so the engine can run several of
//! them inside one transaction; callers outside the engine lock the pool
//! with [`crate::db::lock`] first.

use rusqlite::Connection;
use std::collections::BTreeMap;

use crate::db::models::BlockRecord;
use crate::db::StoreError;

/// Current chain height: the maximum recorded height, -1 when empty.
pub fn height(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(height), -1) FROM blockchain",
        [],
        |row| row.get(0),
    )?)
}

pub fn block_by_hash(conn: &Connection, hash: &str) -> Result<Option<BlockRecord>, StoreError> {
    query_one(
        conn,
        "SELECT hash, height, prev_hash, sigkey_hash, signature, prevhash_signature,
                time_accepted, version
         FROM blockchain WHERE hash = ?1",
        rusqlite::params![hash],
    )
}

pub fn block_by_height(conn: &Connection, height: i64) -> Result<Option<BlockRecord>, StoreError> {
    query_one(
        conn,
        "SELECT hash, height, prev_hash, sigkey_hash, signature, prevhash_signature,
                time_accepted, version
         FROM blockchain WHERE height = ?1",
        rusqlite::params![height],
    )
}

pub fn height_exists(conn: &Connection, height: i64) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blockchain WHERE height = ?1",
        rusqlite::params![height],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn hash_exists(conn: &Connection, hash: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blockchain WHERE hash = ?1",
        rusqlite::params![hash],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn hash_by_height(conn: &Connection, height: i64) -> Result<Option<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT hash FROM blockchain WHERE height = ?1")?;
    let mut rows = stmt.query(rusqlite::params![height])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Height→hash map over the inclusive range [min, max].
pub fn height_hashes(
    conn: &Connection,
    min: i64,
    max: i64,
) -> Result<BTreeMap<i64, String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT height, hash FROM blockchain WHERE height >= ?1 AND height <= ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![min, max], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut hashes = BTreeMap::new();
    for row in rows {
        let (height, hash) = row?;
        hashes.insert(height, hash);
    }
    Ok(hashes)
}

/// Insert a chain index record. No validation happens here; the engine is
/// the only caller.
pub fn insert_block(conn: &Connection, record: &BlockRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO blockchain (hash, height, prev_hash, sigkey_hash, signature,
                                 prevhash_signature, time_accepted, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            record.hash,
            record.height,
            record.previous_block_hash,
            record.signatory_key_hash,
            hex::encode(&record.hash_signature),
            hex::encode(&record.previous_hash_signature),
            record.time_accepted,
            record.version,
        ],
    )?;
    Ok(())
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<BlockRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => {
            let signature_hex: String = row.get(4)?;
            let prevhash_signature_hex: String = row.get(5)?;
            Ok(Some(BlockRecord {
                hash: row.get(0)?,
                height: row.get(1)?,
                previous_block_hash: row.get(2)?,
                signatory_key_hash: row.get(3)?,
                hash_signature: hex::decode(&signature_hex).map_err(|_| {
                    StoreError::Sqlite(rusqlite::Error::InvalidColumnType(
                        4,
                        "signature".to_string(),
                        rusqlite::types::Type::Text,
                    ))
                })?,
                previous_hash_signature: hex::decode(&prevhash_signature_hex).map_err(|_| {
                    StoreError::Sqlite(rusqlite::Error::InvalidColumnType(
                        5,
                        "prevhash_signature".to_string(),
                        rusqlite::types::Type::Text,
                    ))
                })?,
                time_accepted: row.get(6)?,
                version: row.get(7)?,
            }))
        }
        None => Ok(None),
    }
}
