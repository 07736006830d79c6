//! Row types for the main store tables.
//! These correspond 1:1 to the schema defined in migrations.rs.

use std::collections::HashMap;

/// Chain index entry from the blockchain table.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    /// Hex SHA-256 of the block file bytes.
    pub hash: String,
    pub height: i64,
    pub previous_block_hash: String,
    /// Canonical hash of the signatory's public key.
    pub signatory_key_hash: String,
    /// DER signature over the block hash.
    pub hash_signature: Vec<u8>,
    /// DER signature over the previous block hash.
    pub previous_hash_signature: Vec<u8>,
    /// UTC Unix seconds.
    pub time_accepted: i64,
    pub version: i64,
}

/// Accepted public key from the pubkeys table. Rows are never deleted;
/// revocation flips the state and records when and at which height.
#[derive(Debug, Clone)]
pub struct PublicKeyRecord {
    pub public_key_hash: String,
    /// DER-SPKI bytes.
    pub public_key: Vec<u8>,
    pub state: String,
    pub time_added: i64,
    pub time_revoked: Option<i64>,
    /// Chain height that introduced the key; -1 for local-only keys.
    pub added_at_height: i64,
    pub revoked_at_height: Option<i64>,
    pub metadata: Option<HashMap<String, String>>,
}

impl PublicKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.state == "R"
    }

    /// Whether this key may vouch for a block at the given height.
    /// A key added at height H signs from H+1 onward (the genesis key
    /// self-signs block 0); a key revoked at height R signs through R.
    pub fn is_active_at(&self, height: i64) -> bool {
        let added_ok = self.added_at_height < height
            || (height == 0 && self.added_at_height <= 0);
        let not_revoked = match self.revoked_at_height {
            Some(revoked_at) => height <= revoked_at,
            None => !self.is_revoked(),
        };
        added_ok && not_revoked
    }
}

/// Known peer from the peers table. Permanent rows are the chain's
/// bootstrap peers and survive clears.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// "host:port", lowercase.
    pub address: String,
    pub time_last_seen: i64,
    pub permanent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_at(added: i64, revoked: Option<i64>) -> PublicKeyRecord {
        PublicKeyRecord {
            public_key_hash: "1:00".to_string(),
            public_key: vec![],
            state: if revoked.is_some() { "R" } else { "A" }.to_string(),
            time_added: 0,
            time_revoked: revoked.map(|_| 1),
            added_at_height: added,
            revoked_at_height: revoked,
            metadata: None,
        }
    }

    #[test]
    fn key_signs_from_the_block_after_its_addition() {
        let k = key_at(5, None);
        assert!(!k.is_active_at(5));
        assert!(k.is_active_at(6));
        assert!(k.is_active_at(100));
    }

    #[test]
    fn genesis_key_self_signs_block_zero() {
        let k = key_at(0, None);
        assert!(k.is_active_at(0));
        assert!(k.is_active_at(1));

        let local = key_at(-1, None);
        assert!(local.is_active_at(0));
        assert!(local.is_active_at(1));
    }

    #[test]
    fn revoked_key_stops_signing_after_its_revocation() {
        let k = key_at(0, Some(10));
        assert!(k.is_active_at(10));
        assert!(!k.is_active_at(11));
    }
}
