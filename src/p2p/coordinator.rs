//! The p2p coordinator: one serial loop owning every cross-peer decision:
//! block search, gossip flooding, peer discovery, reconnects and
//! connectability probes. Sessions talk to it over a bounded control
//! channel; it talks back through each session's outbound queue.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::messages::WireMessage;
use crate::config::DEFAULT_P2P_PORT;
use crate::db;
use crate::node::Node;

/// Capacity of the coordinator's control channel.
pub const CTRL_CHANNEL_CAPACITY: usize = 8;

/// Coordinator tick period.
const TICK_PERIOD: Duration = Duration::from_secs(10);

/// How often saved peers are persisted and redialed.
const RECONNECT_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Timeout of a connect-back probe on the default port.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum CtrlMessage {
    /// A peer reported a taller chain; ask it for block hashes.
    SearchForBlocks { peer: u64 },
    /// A peer advertised addresses; try connecting to the new ones.
    ConnectPeers(Vec<String>),
}

pub fn ctrl_channel() -> (mpsc::Sender<CtrlMessage>, mpsc::Receiver<CtrlMessage>) {
    mpsc::channel(CTRL_CHANNEL_CAPACITY)
}

/// Run the coordinator loop until the control channel closes.
pub async fn run(node: Arc<Node>, mut ctrl_rx: mpsc::Receiver<CtrlMessage>) {
    let mut last_height = chain_height(&node).await;
    let mut last_reconnect = Instant::now();
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = ctrl_rx.recv() => match msg {
                None => break,
                Some(CtrlMessage::SearchForBlocks { peer }) => {
                    handle_search_for_blocks(&node, peer).await;
                }
                Some(CtrlMessage::ConnectPeers(addresses)) => {
                    handle_connect_peers(&node, addresses).await;
                }
            },
            _ = ticker.tick() => {
                last_height = handle_time_tick(&node, last_height, &mut last_reconnect).await;
            }
        }
    }
}

async fn chain_height(node: &Arc<Node>) -> i64 {
    let node = node.clone();
    tokio::task::spawn_blocking(move || node.chain_height())
        .await
        .unwrap_or(-1)
}

/// Ask one peer for the block hashes between our height and its reported
/// height.
async fn handle_search_for_blocks(node: &Arc<Node>, peer: u64) {
    let (sender, peer_height) = match node.peers.peer_handle(peer) {
        Some(handle) => handle,
        None => return,
    };
    let our_height = chain_height(node).await;
    tracing::info!(
        from = our_height,
        to = peer_height,
        "Searching for blocks"
    );
    let msg = WireMessage::GetBlockHashes {
        root: node.params.genesis_block_hash.clone(),
        p2p_id: node.p2p_id,
        min_block_height: our_height,
        max_block_height: peer_height,
    };
    send_or_drop(node, peer, &sender, msg);
}

/// Connect to newly advertised peers: canonicalize to the default port,
/// skip anything connected, bad or local, then dial and persist.
async fn handle_connect_peers(node: &Arc<Node>, addresses: Vec<String>) {
    for address in addresses {
        let canonical = super::canonical_address(&address);
        if node.peers.has_address(&canonical) || node.bad_peers.has(&canonical) {
            continue;
        }
        let resolved = match super::resolve(&canonical).await {
            Ok(resolved) => resolved,
            Err(_) => continue,
        };
        if node.local_addrs.contains(&resolved.ip()) {
            continue;
        }
        if node.peers.has_address(&resolved.to_string()) {
            continue;
        }
        match super::connect_peer(node, &canonical).await {
            Ok(()) => {
                tracing::info!(%canonical, "Detected canonical peer");
                save_peer(node, canonical).await;
            }
            Err(e) => tracing::debug!(%canonical, "Cannot connect advertised peer: {}", e),
        }
    }
}

/// Periodic work: flood newly accepted blocks, occasionally persist and
/// redial saved peers, probe untested peers for connectability.
async fn handle_time_tick(
    node: &Arc<Node>,
    last_height: i64,
    last_reconnect: &mut Instant,
) -> i64 {
    let new_height = chain_height(node).await;
    if new_height > last_height {
        tracing::info!(height = new_height, "New blocks detected, announcing");
        flood_peers_with_new_blocks(node, last_height, new_height).await;
    }
    if last_reconnect.elapsed() >= RECONNECT_PERIOD {
        *last_reconnect = Instant::now();
        save_connectable_peers(node).await;
        super::connect_saved_peers(node.clone()).await;
    }
    probe_untested_peers(node);
    new_height
}

/// Announce a height range to every connected peer.
async fn flood_peers_with_new_blocks(node: &Arc<Node>, min_height: i64, max_height: i64) {
    let main_db = node.main_db.clone();
    let hashes = tokio::task::spawn_blocking(move || {
        let conn = db::lock(&main_db)?;
        crate::chain::index::height_hashes(&conn, min_height.max(0), max_height)
    })
    .await;
    let hashes = match hashes {
        Ok(Ok(hashes)) => hashes,
        Ok(Err(e)) => {
            tracing::error!("Cannot read block hashes to flood: {}", e);
            return;
        }
        Err(e) => {
            tracing::error!("Join error flooding blocks: {}", e);
            return;
        }
    };

    let msg = WireMessage::BlockHashes {
        root: node.params.genesis_block_hash.clone(),
        p2p_id: node.p2p_id,
        hashes,
    };
    for (token, sender) in node.peers.senders() {
        send_or_drop(node, token, &sender, msg.clone());
    }
}

/// Queue a message on a session's outbound channel. A full queue means the
/// peer stopped draining; it gets dropped from the set, which ends its
/// session.
fn send_or_drop(
    node: &Arc<Node>,
    token: u64,
    sender: &mpsc::Sender<WireMessage>,
    msg: WireMessage,
) {
    match sender.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(token, "Peer outbound queue is stuck, dropping the peer");
            node.peers.remove(token);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Persist every connectable peer under its canonical address, unless it
/// is already saved or resolves to ourselves.
async fn save_connectable_peers(node: &Arc<Node>) {
    let main_db = node.main_db.clone();
    let saved = tokio::task::spawn_blocking(move || db::peers::saved_peers(&main_db)).await;
    let saved = match saved {
        Ok(Ok(saved)) => saved,
        _ => return,
    };

    for address in node.peers.connectable_addresses() {
        let canonical = super::canonical_address(&address);
        if saved.contains_key(&canonical) {
            continue;
        }
        let resolved = match super::resolve(&canonical).await {
            Ok(resolved) => resolved,
            Err(_) => continue,
        };
        if node.local_addrs.contains(&resolved.ip()) {
            continue;
        }
        tracing::info!(%canonical, "Detected canonical peer");
        save_peer(node, canonical).await;
    }
}

async fn save_peer(node: &Arc<Node>, address: String) {
    let main_db = node.main_db.clone();
    let result =
        tokio::task::spawn_blocking(move || db::peers::save_peer(&main_db, &address)).await;
    if let Ok(Err(e)) = result {
        tracing::error!("Cannot save peer: {}", e);
    }
}

/// Probe peers that connected from ephemeral ports: if their host accepts
/// a connection on the default p2p port, they are connectable and worth
/// persisting.
fn probe_untested_peers(node: &Arc<Node>) {
    for (token, address) in node.peers.take_probe_candidates() {
        let (host, port) = super::split_address(&address);
        if port == Some(DEFAULT_P2P_PORT) {
            continue;
        }
        let node = node.clone();
        tokio::spawn(async move {
            let target = format!("{}:{}", host, DEFAULT_P2P_PORT);
            match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await {
                Ok(Ok(_stream)) => node.peers.mark_connectable(token),
                _ => {}
            }
        });
    }
}
