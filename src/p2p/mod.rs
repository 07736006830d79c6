//! P2P subsystem: listener, outbound connector, per-peer sessions and the
//! coordinator that owns all cross-peer decisions.

pub mod coordinator;
pub mod messages;
pub mod peers;
pub mod session;

use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use crate::config::DEFAULT_P2P_PORT;
use crate::node::Node;

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} already exists")]
    AlreadyConnected(String),

    #[error("refusing to connect to myself at {0}")]
    LocalAddress(IpAddr),

    #[error("cannot resolve {0}")]
    Unresolvable(String),
}

/// The temporary id of this node: a random positive 48-bit integer.
pub fn ephemeral_id() -> i64 {
    (rand::thread_rng().gen::<u64>() & 0xffff_ffff_ffff) as i64
}

/// Addresses considered "this machine" for loopback detection: the
/// loopback interfaces plus the default-route source address.
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut addresses = HashSet::new();
    addresses.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    addresses.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
    if let Ok(socket) = std::net::UdpSocket::bind(("0.0.0.0", 0)) {
        // No packets are sent; connect() just selects the outbound address.
        if socket.connect(("8.8.8.8", 53)).is_ok() {
            if let Ok(addr) = socket.local_addr() {
                addresses.insert(addr.ip());
            }
        }
    }
    addresses
}

/// Split "host:port" into host and optional port. The split is on the last
/// colon so bracketless IPv6 hosts keep their groups.
pub fn split_address(address: &str) -> (String, Option<u16>) {
    match address.rfind(':') {
        Some(i) => {
            let (host, port) = (address[..i].to_string(), address[i + 1..].parse().ok());
            (host, port)
        }
        None => (address.to_string(), None),
    }
}

/// Canonical form of a peer address: its host on the default p2p port.
/// Ephemeral source ports of inbound connections never survive this.
pub fn canonical_address(address: &str) -> String {
    let (host, _) = split_address(address);
    format!("{}:{}", host.to_lowercase(), DEFAULT_P2P_PORT)
}

/// Accept loop of the p2p listener. Each accepted connection gets its own
/// session; addresses in the bad-peer set are dropped on the floor.
pub async fn serve(node: Arc<Node>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Error accepting p2p socket: {}", e);
                return;
            }
        };
        let address = remote.to_string();
        if node.bad_peers.has(&address) {
            tracing::debug!(%address, "Ignoring bad peer");
            continue;
        }
        tokio::spawn(session::run_session(node.clone(), stream, address, false));
    }
}

/// Resolve an address to its first socket address.
pub async fn resolve(address: &str) -> Result<SocketAddr, P2pError> {
    let mut candidates = tokio::net::lookup_host(address)
        .await
        .map_err(|_| P2pError::Unresolvable(address.to_string()))?;
    candidates
        .next()
        .ok_or_else(|| P2pError::Unresolvable(address.to_string()))
}

/// Dial a peer and spawn its session. The caller is expected to have
/// consulted the bad-peer set; loopback-by-id is handled by the session.
pub async fn connect_peer(node: &Arc<Node>, address: &str) -> Result<(), P2pError> {
    let addr = resolve(address).await?;
    let resolved = addr.to_string();
    if node.peers.has_address(&resolved) {
        return Err(P2pError::AlreadyConnected(resolved));
    }
    let stream = TcpStream::connect(addr).await?;
    // An outbound dial that succeeded on the default port proves the peer
    // is connectable.
    let connectable = addr.port() == DEFAULT_P2P_PORT;
    tokio::spawn(session::run_session(
        node.clone(),
        stream,
        resolved,
        connectable,
    ));
    Ok(())
}

/// Dial every saved peer we are not already connected to.
pub async fn connect_saved_peers(node: Arc<Node>) {
    let main_db = node.main_db.clone();
    let saved = tokio::task::spawn_blocking(move || crate::db::peers::saved_peers(&main_db)).await;
    let saved = match saved {
        Ok(Ok(saved)) => saved,
        Ok(Err(e)) => {
            tracing::error!("Cannot read saved peers: {}", e);
            return;
        }
        Err(e) => {
            tracing::error!("Join error reading saved peers: {}", e);
            return;
        }
    };
    for address in saved.keys() {
        if node.peers.has_address(address) || node.bad_peers.has(address) {
            continue;
        }
        if let Err(e) = connect_peer(&node, address).await {
            tracing::debug!(%address, "Cannot connect saved peer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_id_fits_48_bits() {
        for _ in 0..32 {
            let id = ephemeral_id();
            assert!(id >= 0);
            assert!(id <= 0xffff_ffff_ffff);
        }
    }

    #[test]
    fn split_address_handles_ports_and_ipv6() {
        assert_eq!(
            split_address("node.example.net:2017"),
            ("node.example.net".to_string(), Some(2017))
        );
        assert_eq!(split_address("bare-host"), ("bare-host".to_string(), None));
        let (host, port) = split_address("::1:2017");
        assert_eq!(host, "::1");
        assert_eq!(port, Some(2017));
    }

    #[test]
    fn canonical_address_pins_default_port() {
        assert_eq!(
            canonical_address("Node.Example.NET:49152"),
            "node.example.net:2017"
        );
        assert_eq!(canonical_address("10.1.2.3:2017"), "10.1.2.3:2017");
    }

    #[test]
    fn local_addresses_include_loopback() {
        let locals = local_addresses();
        assert!(locals.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
