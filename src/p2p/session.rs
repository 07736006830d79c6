//! One p2p session: a reader task feeding an inbound queue, and a driver
//! that owns the socket's write half and consumes either inbound messages
//! or outbound messages queued by the coordinator and other sessions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::coordinator::CtrlMessage;
use super::messages::{
    WireMessage, ENCODING_HTTP, ENCODING_ZLIB_BASE64, P2P_VERSION_STRING,
};
use crate::db;
use crate::node::Node;

/// Capacity of the inbound queue. Small on purpose: slow consumers
/// collapse fast instead of buffering without bound.
const INBOUND_QUEUE: usize = 5;

/// Whether the session keeps running after a message is handled.
#[derive(PartialEq)]
enum Control {
    Continue,
    Close,
}

/// Run one connection to completion. `connectable` marks peers we dialed
/// ourselves on the default port.
pub async fn run_session(node: Arc<Node>, stream: TcpStream, address: String, connectable: bool) {
    let local_ip = stream.local_addr().ok().map(|a| a.ip());
    let (read_half, mut write_half) = stream.into_split();

    let (token, mut outbound_rx) = node.peers.register(&address, connectable);
    tracing::info!(%address, "Handling connection");

    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let reader = tokio::spawn(read_loop(
        read_half,
        inbound_tx,
        node.params.genesis_block_hash.clone(),
        address.clone(),
    ));

    let hello = WireMessage::Hello {
        root: node.params.genesis_block_hash.clone(),
        p2p_id: node.p2p_id,
        version: P2P_VERSION_STRING.to_string(),
        chain_height: chain_height(&node).await,
        my_peers: node.peers.addresses(true),
    };
    if send_message(&mut write_half, &hello).await.is_err() {
        node.peers.remove(token);
        reader.abort();
        return;
    }

    loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                None => break,
                Some(msg) => {
                    let control =
                        handle_message(&node, token, &address, local_ip, &mut write_half, msg)
                            .await;
                    if control == Control::Close {
                        break;
                    }
                }
            },
            outbound = outbound_rx.recv() => match outbound {
                // Sender side dropped: we were removed from the peer set.
                None => break,
                Some(msg) => {
                    if send_message(&mut write_half, &msg).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    node.peers.remove(token);
    reader.abort();
    tracing::info!(%address, "Finished cleaning up connection");
}

/// Parse newline-delimited JSON off the socket. A line that is not a known
/// message shape ends the session; a known shape with a foreign chain root
/// is ignored.
async fn read_loop(
    read_half: OwnedReadHalf,
    inbound_tx: mpsc::Sender<WireMessage>,
    root: String,
    address: String,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let msg = match WireMessage::decode(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(%address, "Dropping session on unparseable message: {}", e);
                        break;
                    }
                };
                if msg.root() != root {
                    tracing::info!(
                        %address,
                        "Received message for a different chain than mine, ignoring"
                    );
                    continue;
                }
                if inbound_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%address, "Error reading from peer: {}", e);
                break;
            }
        }
    }
    tracing::debug!(%address, "Shutting down receiver");
}

async fn send_message(write_half: &mut OwnedWriteHalf, msg: &WireMessage) -> std::io::Result<()> {
    let line = msg
        .encode_line()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await
}

async fn chain_height(node: &Arc<Node>) -> i64 {
    let node = node.clone();
    tokio::task::spawn_blocking(move || node.chain_height())
        .await
        .unwrap_or(-1)
}

async fn handle_message(
    node: &Arc<Node>,
    token: u64,
    address: &str,
    local_ip: Option<IpAddr>,
    write_half: &mut OwnedWriteHalf,
    msg: WireMessage,
) -> Control {
    match msg {
        WireMessage::Hello {
            p2p_id,
            version,
            chain_height,
            my_peers,
            ..
        } => handle_hello(node, token, address, p2p_id, &version, chain_height, my_peers).await,
        WireMessage::GetBlockHashes {
            min_block_height,
            max_block_height,
            ..
        } => {
            handle_get_block_hashes(node, address, write_half, min_block_height, max_block_height)
                .await
        }
        WireMessage::BlockHashes { hashes, .. } => {
            handle_block_hashes(node, address, write_half, hashes).await
        }
        WireMessage::GetBlock { hash, .. } => {
            handle_get_block(node, address, local_ip, write_half, hash).await
        }
        WireMessage::Block {
            hash,
            hash_signature,
            size,
            encoding,
            data,
            ..
        } => handle_block(node, address, hash, hash_signature, size, encoding, data).await,
    }
}

async fn handle_hello(
    node: &Arc<Node>,
    token: u64,
    address: &str,
    peer_id: i64,
    version: &str,
    peer_height: i64,
    my_peers: Vec<String>,
) -> Control {
    tracing::info!(
        %address, version, peer_id = format_args!("{:x}", peer_id), peer_height,
        "Hello from peer"
    );

    if peer_id == node.p2p_id {
        tracing::info!(%address, "Peer is apparently myself, dropping it");
        node.bad_peers.add(address);
        return Control::Close;
    }
    if let super::peers::HelloOutcome::Duplicate = node.peers.record_hello(token, peer_id, peer_height)
    {
        tracing::info!(%address, "Peer looks like a duplicate session, dropping it");
        node.bad_peers.add(address);
        return Control::Close;
    }

    if !my_peers.is_empty() {
        let _ = node.ctrl_tx.send(CtrlMessage::ConnectPeers(my_peers)).await;
    }
    if peer_height > chain_height(node).await {
        let _ = node
            .ctrl_tx
            .send(CtrlMessage::SearchForBlocks { peer: token })
            .await;
    }
    Control::Continue
}

async fn handle_get_block_hashes(
    node: &Arc<Node>,
    address: &str,
    write_half: &mut OwnedWriteHalf,
    min_height: i64,
    max_height: i64,
) -> Control {
    let main_db = node.main_db.clone();
    let hashes = tokio::task::spawn_blocking(move || {
        let conn = db::lock(&main_db)?;
        crate::chain::index::height_hashes(&conn, min_height, max_height)
    })
    .await;
    let hashes = match hashes {
        Ok(Ok(hashes)) => hashes,
        Ok(Err(e)) => {
            tracing::error!(%address, "Cannot read block hashes: {}", e);
            return Control::Continue;
        }
        Err(e) => {
            tracing::error!(%address, "Join error reading block hashes: {}", e);
            return Control::Continue;
        }
    };

    tracing::debug!(%address, min_height, max_height, "Sending block hashes");
    let reply = WireMessage::BlockHashes {
        root: node.params.genesis_block_hash.clone(),
        p2p_id: node.p2p_id,
        hashes,
    };
    if send_message(write_half, &reply).await.is_err() {
        return Control::Close;
    }
    Control::Continue
}

async fn handle_block_hashes(
    node: &Arc<Node>,
    address: &str,
    write_half: &mut OwnedWriteHalf,
    hashes: BTreeMap<i64, String>,
) -> Control {
    // Ascending by height; a mismatch on a height we already have means
    // the chains have desynced and the rest of the map is ignored.
    let main_db = node.main_db.clone();
    let address_for_log = address.to_string();
    let missing = tokio::task::spawn_blocking(move || -> Result<Vec<String>, db::StoreError> {
        let conn = db::lock(&main_db)?;
        let mut missing = Vec::new();
        for (height, hash) in &hashes {
            match crate::chain::index::hash_by_height(&conn, *height)? {
                Some(ours) => {
                    if ours != *hash {
                        tracing::error!(
                            address = %address_for_log, height,
                            theirs = %hash, ours = %ours,
                            "Blockchain desynced, ignoring the rest of the hashes"
                        );
                        break;
                    }
                }
                None => missing.push(hash.clone()),
            }
        }
        Ok(missing)
    })
    .await;

    let missing = match missing {
        Ok(Ok(missing)) => missing,
        Ok(Err(e)) => {
            tracing::error!(%address, "Cannot check block hashes: {}", e);
            return Control::Continue;
        }
        Err(e) => {
            tracing::error!(%address, "Join error checking block hashes: {}", e);
            return Control::Continue;
        }
    };

    for hash in missing {
        // Several peers announce the same block; only ask once per TTL.
        if node.recently_requested.test_and_set(&hash) {
            continue;
        }
        tracing::info!(%address, %hash, "Requesting block");
        let request = WireMessage::GetBlock {
            root: node.params.genesis_block_hash.clone(),
            p2p_id: node.p2p_id,
            hash,
        };
        if send_message(write_half, &request).await.is_err() {
            return Control::Close;
        }
    }
    Control::Continue
}

async fn handle_get_block(
    node: &Arc<Node>,
    address: &str,
    local_ip: Option<IpAddr>,
    write_half: &mut OwnedWriteHalf,
    hash: String,
) -> Control {
    let inline = node.cfg.p2p_block_inline;
    let http_port = node.cfg.http_port;
    let node_for_task = node.clone();
    let hash_for_task = hash.clone();

    let reply = tokio::task::spawn_blocking(move || -> Option<WireMessage> {
        let record = {
            let conn = db::lock(&node_for_task.main_db).ok()?;
            crate::chain::index::block_by_hash(&conn, &hash_for_task).ok()??
        };
        let filename = node_for_task.chain.block_filename(record.height);
        let file_bytes = std::fs::read(&filename).ok()?;
        let size = file_bytes.len() as i64;

        let (encoding, data) = if inline {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&file_bytes).ok()?;
            let compressed = encoder.finish().ok()?;
            (ENCODING_ZLIB_BASE64.to_string(), BASE64.encode(compressed))
        } else {
            let host = local_ip?;
            (
                ENCODING_HTTP.to_string(),
                format!("http://{}:{}/block/{}", host, http_port, record.height),
            )
        };

        Some(WireMessage::Block {
            root: node_for_task.params.genesis_block_hash.clone(),
            p2p_id: node_for_task.p2p_id,
            hash: hash_for_task,
            hash_signature: hex::encode(&record.hash_signature),
            size,
            encoding,
            data,
        })
    })
    .await;

    match reply {
        Ok(Some(reply)) => {
            if send_message(write_half, &reply).await.is_err() {
                return Control::Close;
            }
            tracing::info!(%address, %hash, "Sent block");
        }
        Ok(None) => tracing::warn!(%address, %hash, "Cannot serve requested block"),
        Err(e) => tracing::error!(%address, "Join error serving block: {}", e),
    }
    Control::Continue
}

async fn handle_block(
    node: &Arc<Node>,
    address: &str,
    hash: String,
    hash_signature: String,
    size: i64,
    encoding: String,
    data: String,
) -> Control {
    let already_known = {
        let main_db = node.main_db.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db::lock(&main_db)?;
            crate::chain::index::hash_exists(&conn, &hash)
        })
        .await
    };
    match already_known {
        Ok(Ok(true)) => {
            tracing::debug!(%address, %hash, "Already have this block");
            return Control::Continue;
        }
        Ok(Ok(false)) => {}
        Ok(Err(e)) => {
            tracing::error!(%address, "Cannot check block hash: {}", e);
            return Control::Continue;
        }
        Err(e) => {
            tracing::error!(%address, "Join error checking block hash: {}", e);
            return Control::Continue;
        }
    }

    let signature = match hex::decode(&hash_signature) {
        Ok(signature) => signature,
        Err(e) => {
            tracing::warn!(%address, "Bad block hash signature hex: {}", e);
            return Control::Continue;
        }
    };

    let file_bytes = match materialize_block_data(&encoding, &data, size).await {
        Ok(bytes) => bytes,
        Err(reason) => {
            tracing::warn!(%address, %hash, "Cannot decode block payload: {}", reason);
            return Control::Continue;
        }
    };

    // The temp file lives until admission finishes, then is removed with it.
    let temp = match tempfile::NamedTempFile::new() {
        Ok(temp) => temp,
        Err(e) => {
            tracing::error!("Cannot create temp block file: {}", e);
            return Control::Continue;
        }
    };
    if let Err(e) = std::fs::write(temp.path(), &file_bytes) {
        tracing::error!("Cannot write temp block file: {}", e);
        return Control::Continue;
    }

    let path = temp.path().to_path_buf();
    let node_for_task = node.clone();
    let accepted = tokio::task::spawn_blocking(move || {
        node_for_task.chain.accept_block(&path, &signature)
    })
    .await;

    match accepted {
        Ok(Ok(height)) => tracing::info!(%hash, height, "Accepted block from peer"),
        Ok(Err(e)) => tracing::warn!(%address, %hash, "Cannot import block: {}", e),
        Err(e) => tracing::error!(%address, "Join error importing block: {}", e),
    }
    Control::Continue
}

/// Turn the `data` field of a block message into raw file bytes according
/// to its encoding, enforcing the advertised decompressed size.
async fn materialize_block_data(encoding: &str, data: &str, size: i64) -> Result<Vec<u8>, String> {
    let bytes = match encoding {
        ENCODING_ZLIB_BASE64 => {
            let compressed = BASE64
                .decode(data)
                .map_err(|e| format!("base64: {}", e))?;
            let mut decoded = Vec::new();
            ZlibDecoder::new(compressed.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| format!("zlib: {}", e))?;
            decoded
        }
        ENCODING_HTTP => {
            let response = reqwest::get(data).await.map_err(|e| format!("GET: {}", e))?;
            response
                .bytes()
                .await
                .map_err(|e| format!("read body: {}", e))?
                .to_vec()
        }
        other => return Err(format!("unknown block encoding {:?}", other)),
    };
    if bytes.len() as i64 != size {
        return Err(format!(
            "sizes don't match: {} received vs {} advertised",
            bytes.len(),
            size
        ));
    }
    Ok(bytes)
}
