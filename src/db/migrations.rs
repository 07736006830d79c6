use rusqlite_migration::{Migrations, M};

/// Schema migrations for the main store.
/// Uses the SQLite user_version pragma for tracking, no migration table.
pub fn main_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: chain index, accepted keys, peers, config

-- All times are Unix timestamps in the UTC zone.

CREATE TABLE blockchain (
    hash               TEXT NOT NULL PRIMARY KEY,
    height             INTEGER NOT NULL UNIQUE,
    prev_hash          TEXT NOT NULL,
    sigkey_hash        TEXT NOT NULL,
    signature          TEXT NOT NULL,
    prevhash_signature TEXT NOT NULL,
    time_accepted      INTEGER NOT NULL,
    version            INTEGER NOT NULL
);
CREATE INDEX idx_blockchain_sigkey ON blockchain(sigkey_hash);

CREATE TABLE pubkeys (
    pubkey_hash       TEXT NOT NULL PRIMARY KEY,
    pubkey            TEXT NOT NULL,
    state             TEXT NOT NULL,
    time_added        INTEGER NOT NULL,
    time_revoked      INTEGER,
    added_at_height   INTEGER NOT NULL,
    revoked_at_height INTEGER,
    metadata          TEXT
);

CREATE TABLE peers (
    address        TEXT NOT NULL PRIMARY KEY,
    time_last_seen INTEGER NOT NULL,
    permanent      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE config (
    key   TEXT NOT NULL PRIMARY KEY,
    value TEXT NOT NULL
);
",
    )])
}

/// Schema migrations for the private store.
pub fn private_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: private keys

CREATE TABLE privkeys (
    pubkey_hash TEXT NOT NULL PRIMARY KEY,
    privkey     TEXT NOT NULL,
    time_added  INTEGER NOT NULL
);
",
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        main_migrations().validate().unwrap();
        private_migrations().validate().unwrap();
    }
}
