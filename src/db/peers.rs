//! Persistence of known peers. Only addresses verified reachable on the
//! default p2p port are ever saved; bootstrap peers are permanent.

use std::collections::HashMap;

use super::{lock, DbPool, StoreError};
use crate::db::models::PeerRecord;

/// Insert the chain's bootstrap peers as permanent rows. Runs on every
/// startup; existing rows keep their last-seen time.
pub fn seed_bootstrap_peers(pool: &DbPool, bootstrap: &[String]) -> Result<(), StoreError> {
    let conn = lock(pool)?;
    let now = chrono::Utc::now().timestamp();
    for address in bootstrap {
        conn.execute(
            "INSERT OR IGNORE INTO peers (address, time_last_seen, permanent) VALUES (?1, ?2, 1)",
            rusqlite::params![address.to_lowercase(), now],
        )?;
    }
    Ok(())
}

/// Record a peer as reachable, refreshing its last-seen time.
pub fn save_peer(pool: &DbPool, address: &str) -> Result<(), StoreError> {
    let conn = lock(pool)?;
    conn.execute(
        "INSERT INTO peers (address, time_last_seen, permanent) VALUES (?1, ?2, 0)
         ON CONFLICT(address) DO UPDATE SET time_last_seen = ?2",
        rusqlite::params![address.to_lowercase(), chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}

/// All saved peers, keyed by address.
pub fn saved_peers(pool: &DbPool) -> Result<HashMap<String, PeerRecord>, StoreError> {
    let conn = lock(pool)?;
    let mut stmt = conn.prepare("SELECT address, time_last_seen, permanent FROM peers")?;
    let rows = stmt.query_map([], |row| {
        Ok(PeerRecord {
            address: row.get(0)?,
            time_last_seen: row.get(1)?,
            permanent: row.get::<_, i64>(2)? != 0,
        })
    })?;
    let mut peers = HashMap::new();
    for row in rows {
        let peer = row?;
        peers.insert(peer.address.clone(), peer);
    }
    Ok(peers)
}

/// Drop all non-permanent peers (used when re-bootstrapping from scratch).
pub fn clear_saved_peers(pool: &DbPool) -> Result<(), StoreError> {
    let conn = lock(pool)?;
    conn.execute("DELETE FROM peers WHERE permanent = 0", [])?;
    Ok(())
}
