//! Chain parameters: the small immutable record that identifies a chain.
//!
//! Shipped as `chainparams.json` in the data directory, served verbatim by
//! the block web server, and embedded in every p2p message header as the
//! `root` (genesis hash).

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Filename of the chain parameters inside the data directory.
pub const CHAIN_PARAMS_BASENAME: &str = "chainparams.json";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChainParams {
    /// SHA256 hash of the genesis block payload, hex.
    pub genesis_block_hash: String,

    /// Signature of the genesis block's hash, by the key carried in the
    /// genesis block itself. Hex-encoded DER.
    pub genesis_block_hash_signature: String,

    /// Genesis block timestamp, RFC 1123Z (e.g. "Sat, 06 May 2017 10:38:50 +0200").
    pub genesis_block_timestamp: String,

    /// Display name of the chain creator.
    pub creator: String,

    /// Canonical hash of the creator's public key.
    pub creator_public_key: String,

    /// host:port seed peers for this chain. Inserted as permanent peer
    /// records when the stores are first created.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Extension of [`ChainParams`] accepted by the `newchain` command: the
/// cryptographic fields must be empty and an optional seed database may be
/// named; the completed parameters are written back out once the genesis
/// block has been authored and signed.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewChainParams {
    #[serde(flatten)]
    pub params: ChainParams,

    /// Optional path to an existing SQLite database to use as the genesis
    /// payload. A fresh minimal database is created when absent.
    #[serde(default)]
    pub genesis_db: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainParamsError {
    #[error("cannot read chain parameters: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode chain parameters: {0}")]
    Json(#[from] serde_json::Error),
    #[error("incomplete chain parameters: {0} is empty")]
    Incomplete(&'static str),
}

impl ChainParams {
    pub fn load(path: &Path) -> Result<Self, ChainParamsError> {
        let data = std::fs::read(path)?;
        let params: ChainParams = serde_json::from_slice(&data)?;
        params.check_complete()?;
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<(), ChainParamsError> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// A usable chain must at least name its genesis hash, signature and
    /// creator key; everything else is informational.
    pub fn check_complete(&self) -> Result<(), ChainParamsError> {
        if self.genesis_block_hash.is_empty() {
            return Err(ChainParamsError::Incomplete("genesis_block_hash"));
        }
        if self.genesis_block_hash_signature.is_empty() {
            return Err(ChainParamsError::Incomplete("genesis_block_hash_signature"));
        }
        if self.creator_public_key.is_empty() {
            return Err(ChainParamsError::Incomplete("creator_public_key"));
        }
        Ok(())
    }
}

impl NewChainParams {
    pub fn load(path: &Path) -> Result<Self, ChainParamsError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}
