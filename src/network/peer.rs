//! One peer connection
//!
//! Owns the framed socket, performs the version/verack handshake, enforces
//! idle timeouts, and forwards everything after the handshake to the node's
//! event loop. Share traffic strictly follows `verack`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::networks::NetworkDescriptor;
use crate::primitives::hash::Hash256;

use super::protocol::{FrameCodec, P2pMessage};

/// Node-local peer identifier
pub type PeerId = u64;

/// Ping after this much silence; drop after twice as much
const IDLE_PING_SECS: u64 = 60;
const IDLE_DROP_SECS: u64 = 120;

/// Outbound queue depth; a slower peer gets coalesced tip pushes instead
pub const OUTBOUND_QUEUE: usize = 64;

/// Peer identity agreed during the handshake
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub protocol_version: u32,
    pub subversion: String,
    pub best_share_hash: Option<Hash256>,
    pub inbound: bool,
}

/// Events surfaced to the node's ingest loop
pub enum PeerEvent {
    /// Handshake completed; share traffic may begin
    Connected {
        id: PeerId,
        addr: SocketAddr,
        info: PeerInfo,
        outbound: mpsc::Sender<P2pMessage>,
    },
    Message {
        id: PeerId,
        addr: SocketAddr,
        message: P2pMessage,
    },
    /// Connection ended; `misbehaved` carries a ban-score penalty to apply
    Disconnected {
        id: PeerId,
        addr: SocketAddr,
        reason: String,
        misbehaved: Option<f64>,
    },
}

/// Drive one connection to completion. Spawned per peer.
#[allow(clippy::too_many_arguments)]
pub async fn run_peer(
    stream: TcpStream,
    addr: SocketAddr,
    id: PeerId,
    inbound: bool,
    net: Arc<NetworkDescriptor>,
    local_nonce: u64,
    best_share_hash: Option<Hash256>,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut framed = Framed::new(stream, FrameCodec::new(net.wire_prefix));

    let hello = P2pMessage::Version {
        protocol_version: crate::network::PROTOCOL_VERSION,
        subversion: crate::network::SUBVERSION.to_string(),
        best_share_hash,
        nonce: local_nonce,
    };
    if framed.send(hello).await.is_err() {
        let _ = events
            .send(PeerEvent::Disconnected {
                id,
                addr,
                reason: "write failed during handshake".into(),
                misbehaved: None,
            })
            .await;
        return;
    }

    // Their version, then mutual verack
    let info = match handshake(&mut framed, addr, inbound, &net, local_nonce).await {
        Ok(info) => info,
        Err((reason, misbehaved)) => {
            let _ = events
                .send(PeerEvent::Disconnected {
                    id,
                    addr,
                    reason,
                    misbehaved,
                })
                .await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<P2pMessage>(OUTBOUND_QUEUE);
    if events
        .send(PeerEvent::Connected {
            id,
            addr,
            info,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut last_heard = Instant::now();
    let mut pinged = false;
    let mut ticker = interval(Duration::from_secs(5));
    let (reason, misbehaved) = loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    last_heard = Instant::now();
                    pinged = false;
                    match message {
                        P2pMessage::Ping { nonce } => {
                            if framed.send(P2pMessage::Pong { nonce }).await.is_err() {
                                break ("write failed".to_string(), None);
                            }
                        }
                        P2pMessage::Pong { .. } => {}
                        other => {
                            if events.send(PeerEvent::Message { id, addr, message: other }).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    break (format!("bad frame: {}", e), Some(super::ban::penalty::MALFORMED));
                }
                None => break ("peer closed connection".to_string(), None),
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(message) => {
                    if framed.send(message).await.is_err() {
                        break ("write failed".to_string(), None);
                    }
                }
                None => break ("local shutdown".to_string(), None),
            },
            _ = ticker.tick() => {
                let idle = last_heard.elapsed().as_secs();
                if idle >= IDLE_DROP_SECS {
                    break ("idle timeout".to_string(), None);
                }
                if idle >= IDLE_PING_SECS && !pinged {
                    pinged = true;
                    if framed.send(P2pMessage::Ping { nonce: rand::random() }).await.is_err() {
                        break ("write failed".to_string(), None);
                    }
                }
            }
        }
    };

    debug!(%addr, %reason, "peer disconnected");
    let _ = events
        .send(PeerEvent::Disconnected {
            id,
            addr,
            reason,
            misbehaved,
        })
        .await;
}

/// Receive the remote version, gate on protocol floor and self-connection,
/// exchange veracks.
async fn handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    addr: SocketAddr,
    inbound: bool,
    net: &NetworkDescriptor,
    local_nonce: u64,
) -> Result<PeerInfo, (String, Option<f64>)> {
    let first = tokio::time::timeout(Duration::from_secs(30), framed.next())
        .await
        .map_err(|_| ("handshake timeout".to_string(), None))?;
    let message = match first {
        Some(Ok(m)) => m,
        Some(Err(e)) => {
            return Err((
                format!("bad handshake frame: {}", e),
                Some(super::ban::penalty::MALFORMED),
            ))
        }
        None => return Err(("closed during handshake".to_string(), None)),
    };
    let (protocol_version, subversion, best_share_hash, nonce) = match message {
        P2pMessage::Version {
            protocol_version,
            subversion,
            best_share_hash,
            nonce,
        } => (protocol_version, subversion, best_share_hash, nonce),
        _ => {
            return Err((
                "expected version".to_string(),
                Some(super::ban::penalty::MALFORMED),
            ))
        }
    };

    if nonce == local_nonce {
        // Dialed ourselves through a rendezvous address; not an offence
        return Err(("connected to self".to_string(), None));
    }
    if protocol_version < net.minimum_protocol_version {
        // Legitimate old peer: clean disconnect, no ban
        info!(
            %addr,
            peer_version = protocol_version,
            floor = net.minimum_protocol_version,
            "peer below minimum protocol version"
        );
        return Err(("protocol version below minimum".to_string(), None));
    }

    if framed.send(P2pMessage::Verack).await.is_err() {
        return Err(("write failed during handshake".to_string(), None));
    }
    let second = tokio::time::timeout(Duration::from_secs(30), framed.next())
        .await
        .map_err(|_| ("verack timeout".to_string(), None))?;
    match second {
        Some(Ok(P2pMessage::Verack)) => {}
        Some(Ok(_)) => {
            warn!(%addr, "share traffic before verack");
            return Err((
                "message before verack".to_string(),
                Some(super::ban::penalty::MALFORMED),
            ));
        }
        Some(Err(e)) => {
            return Err((
                format!("bad handshake frame: {}", e),
                Some(super::ban::penalty::MALFORMED),
            ))
        }
        None => return Err(("closed during handshake".to_string(), None)),
    }

    Ok(PeerInfo {
        protocol_version,
        subversion,
        best_share_hash,
        inbound,
    })
}
