//! The process-wide context. Everything that is conceptually a singleton
//! (stores, chain engine, peer set, coordinator channel, ephemeral id)
//! lives here and is passed explicitly to the listener, the connector and
//! the handler entry points.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chain::Chain;
use crate::chainparams::ChainParams;
use crate::config::Config;
use crate::db::DbPool;
use crate::p2p::coordinator::CtrlMessage;
use crate::p2p::peers::{ExpiringSet, Peers};

/// TTL of the recently-requested block hash set.
pub const RECENTLY_REQUESTED_TTL: std::time::Duration = std::time::Duration::from_secs(5);

/// TTL of the bad-peer set.
pub const BAD_PEER_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

pub struct Node {
    pub cfg: Config,
    pub params: ChainParams,
    pub main_db: DbPool,
    pub private_db: DbPool,
    pub chain: Chain,
    pub peers: Peers,
    /// Random 48-bit id chosen once per process; detects loopback and
    /// duplicate sessions, nothing else.
    pub p2p_id: i64,
    /// Block hashes requested within the last few seconds, so several
    /// peers announcing the same block trigger one download.
    pub recently_requested: ExpiringSet,
    /// Addresses to leave alone for a while (loopbacks, duplicates).
    pub bad_peers: ExpiringSet,
    /// Control channel into the coordinator.
    pub ctrl_tx: mpsc::Sender<CtrlMessage>,
    /// Local interface addresses, for refusing to dial ourselves.
    pub local_addrs: HashSet<IpAddr>,
}

impl Node {
    pub fn new(
        cfg: Config,
        params: ChainParams,
        main_db: DbPool,
        private_db: DbPool,
        chain: Chain,
        ctrl_tx: mpsc::Sender<CtrlMessage>,
    ) -> Arc<Self> {
        Arc::new(Node {
            cfg,
            params,
            main_db,
            private_db,
            chain,
            peers: Peers::new(),
            p2p_id: crate::p2p::ephemeral_id(),
            recently_requested: ExpiringSet::new(RECENTLY_REQUESTED_TTL),
            bad_peers: ExpiringSet::new(BAD_PEER_TTL),
            ctrl_tx,
            local_addrs: crate::p2p::local_addresses(),
        })
    }

    /// Current chain height; call from blocking context.
    pub fn chain_height(&self) -> i64 {
        self.chain.height().unwrap_or(-1)
    }
}
