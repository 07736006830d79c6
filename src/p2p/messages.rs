//! The p2p wire protocol: newline-delimited JSON objects over TCP.
//!
//! Every message carries `root` (the chain genesis hash; messages for a
//! different chain are ignored), `msg` (the type tag) and `p2p_id` (the
//! sender's ephemeral id). Anything that doesn't decode into one of the
//! known shapes terminates the session at the parse boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version string sent in hello messages.
pub const P2P_VERSION_STRING: &str = "daisy-node/0.2";

/// Inline block transfer: zlib-compressed, base64-encoded file bytes.
pub const ENCODING_ZLIB_BASE64: &str = "zlib-base64";

/// Out-of-band block transfer: `data` is an HTTP URL to fetch the file from.
pub const ENCODING_HTTP: &str = "http";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("cannot parse message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg")]
pub enum WireMessage {
    /// Opening message of every session, both directions.
    #[serde(rename = "hello")]
    Hello {
        root: String,
        p2p_id: i64,
        version: String,
        chain_height: i64,
        my_peers: Vec<String>,
    },

    /// Ask for the height→hash map over an inclusive range.
    #[serde(rename = "getblockhashes")]
    GetBlockHashes {
        root: String,
        p2p_id: i64,
        min_block_height: i64,
        max_block_height: i64,
    },

    /// Report block hashes a node has. Also used unsolicited to announce
    /// newly accepted blocks.
    #[serde(rename = "blockhashes")]
    BlockHashes {
        root: String,
        p2p_id: i64,
        hashes: BTreeMap<i64, String>,
    },

    /// Ask for one block's data by hash.
    #[serde(rename = "getblock")]
    GetBlock {
        root: String,
        p2p_id: i64,
        hash: String,
    },

    /// One block's data. `size` is the decompressed file size; `encoding`
    /// selects how `data` is to be interpreted.
    #[serde(rename = "block")]
    Block {
        root: String,
        p2p_id: i64,
        hash: String,
        hash_signature: String,
        size: i64,
        encoding: String,
        data: String,
    },
}

impl WireMessage {
    pub fn root(&self) -> &str {
        match self {
            WireMessage::Hello { root, .. }
            | WireMessage::GetBlockHashes { root, .. }
            | WireMessage::BlockHashes { root, .. }
            | WireMessage::GetBlock { root, .. }
            | WireMessage::Block { root, .. } => root,
        }
    }

    pub fn p2p_id(&self) -> i64 {
        match self {
            WireMessage::Hello { p2p_id, .. }
            | WireMessage::GetBlockHashes { p2p_id, .. }
            | WireMessage::BlockHashes { p2p_id, .. }
            | WireMessage::GetBlock { p2p_id, .. }
            | WireMessage::Block { p2p_id, .. } => *p2p_id,
        }
    }

    /// One newline-terminated JSON line, ready for the socket.
    pub fn encode_line(&self) -> Result<String, WireError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(line)?)
    }
}
