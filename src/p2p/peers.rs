//! The live peer set and the small time-bounded string sets.
//!
//! The peer set is protected by a single mutex used only around set
//! operations; never do I/O or send on a channel while holding it.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::messages::WireMessage;

/// Capacity of each session's outbound queue. A full queue means the peer
/// is not draining its socket and the session is torn down.
pub const OUTBOUND_QUEUE: usize = 5;

/// One live p2p connection as seen by the rest of the node.
pub struct PeerEntry {
    /// Resolved "ip:port" of the remote.
    pub address: String,
    /// The peer's ephemeral id, known after its hello.
    pub peer_id: Option<i64>,
    /// Chain height the peer reported in its hello.
    pub chain_height: i64,
    /// Reachable on the default p2p port.
    pub is_connectable: bool,
    /// Whether a connect-back probe has already been attempted.
    pub tested_connectable: bool,
    pub refresh_time: Instant,
    sender: mpsc::Sender<WireMessage>,
}

pub enum HelloOutcome {
    Ok,
    /// Another session already carries this peer id.
    Duplicate,
}

pub struct Peers {
    inner: Mutex<HashMap<u64, PeerEntry>>,
    next_token: AtomicU64,
}

impl Peers {
    pub fn new() -> Self {
        Peers {
            inner: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Add a connection to the set. Returns the session token and the
    /// receiving end of its outbound queue; the stored sender is how the
    /// coordinator and other sessions reach this peer.
    pub fn register(
        &self,
        address: &str,
        is_connectable: bool,
    ) -> (u64, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = PeerEntry {
            address: address.to_string(),
            peer_id: None,
            chain_height: -1,
            is_connectable,
            tested_connectable: is_connectable,
            refresh_time: Instant::now(),
            sender: tx,
        };
        self.inner.lock().expect("peer set lock").insert(token, entry);
        (token, rx)
    }

    pub fn remove(&self, token: u64) {
        self.inner.lock().expect("peer set lock").remove(&token);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("peer set lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.inner
            .lock()
            .expect("peer set lock")
            .values()
            .any(|entry| entry.address == address)
    }

    /// Record the peer's hello. Fails as Duplicate when another live
    /// session already carries the same peer id.
    pub fn record_hello(&self, token: u64, peer_id: i64, chain_height: i64) -> HelloOutcome {
        let mut inner = self.inner.lock().expect("peer set lock");
        let duplicate = inner
            .iter()
            .any(|(other, entry)| *other != token && entry.peer_id == Some(peer_id));
        if duplicate {
            return HelloOutcome::Duplicate;
        }
        if let Some(entry) = inner.get_mut(&token) {
            entry.peer_id = Some(peer_id);
            entry.chain_height = chain_height;
            entry.refresh_time = Instant::now();
        }
        HelloOutcome::Ok
    }

    /// Addresses of live peers, optionally restricted to the ones known
    /// reachable on the default port.
    pub fn addresses(&self, only_connectable: bool) -> Vec<String> {
        self.inner
            .lock()
            .expect("peer set lock")
            .values()
            .filter(|entry| !only_connectable || entry.is_connectable)
            .map(|entry| entry.address.clone())
            .collect()
    }

    /// Snapshot of every live session's outbound sender.
    pub fn senders(&self) -> Vec<(u64, mpsc::Sender<WireMessage>)> {
        self.inner
            .lock()
            .expect("peer set lock")
            .iter()
            .map(|(token, entry)| (*token, entry.sender.clone()))
            .collect()
    }

    /// Sender and reported height for one session.
    pub fn peer_handle(&self, token: u64) -> Option<(mpsc::Sender<WireMessage>, i64)> {
        self.inner
            .lock()
            .expect("peer set lock")
            .get(&token)
            .map(|entry| (entry.sender.clone(), entry.chain_height))
    }

    /// Untested peers to probe on the default port. Marks them tested so
    /// each address is probed once.
    pub fn take_probe_candidates(&self) -> Vec<(u64, String)> {
        let mut inner = self.inner.lock().expect("peer set lock");
        let mut candidates = Vec::new();
        for (token, entry) in inner.iter_mut() {
            if entry.tested_connectable || entry.is_connectable {
                continue;
            }
            entry.tested_connectable = true;
            candidates.push((*token, entry.address.clone()));
        }
        candidates
    }

    pub fn mark_connectable(&self, token: u64) {
        if let Some(entry) = self.inner.lock().expect("peer set lock").get_mut(&token) {
            entry.is_connectable = true;
        }
    }

    /// Addresses currently marked connectable, for persistence.
    pub fn connectable_addresses(&self) -> Vec<String> {
        self.addresses(true)
    }
}

impl Default for Peers {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of strings whose entries expire after a fixed TTL. Used for the
/// recently-requested block hashes and the bad-peer list.
pub struct ExpiringSet {
    data: DashMap<String, Instant>,
    ttl: Duration,
}

impl ExpiringSet {
    pub fn new(ttl: Duration) -> Self {
        ExpiringSet {
            data: DashMap::new(),
            ttl,
        }
    }

    pub fn add(&self, value: &str) {
        self.data.insert(value.to_string(), Instant::now());
        self.purge_expired();
    }

    /// Present and not expired.
    pub fn has(&self, value: &str) -> bool {
        match self.data.get(value) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Atomically test for the value and insert it if absent or expired.
    /// Returns true iff it was already present (and fresh).
    pub fn test_and_set(&self, value: &str) -> bool {
        let mut present = false;
        self.data
            .entry(value.to_string())
            .and_modify(|at| {
                if at.elapsed() < self.ttl {
                    present = true;
                } else {
                    *at = Instant::now();
                }
            })
            .or_insert_with(Instant::now);
        present
    }

    /// Drop entries past their TTL; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.data.len();
        let ttl = self.ttl;
        self.data.retain(|_, at| at.elapsed() < ttl);
        before - self.data.len()
    }
}
