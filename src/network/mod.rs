//! P2P share network
//!
//! Connection management around the share-gossip protocol: listening,
//! outbound dialing with DNS bootstrap, the peer registry, broadcast with
//! per-peer backpressure, and ban bookkeeping. Protocol semantics (what the
//! messages mean) live in the node's ingest loop; this module moves frames.

pub mod addrstore;
pub mod ban;
pub mod peer;
pub mod protocol;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::networks::NetworkDescriptor;
use crate::primitives::hash::Hash256;
use crate::utils::current_timestamp;

pub use addrstore::AddrStore;
pub use ban::BanTracker;
pub use peer::{PeerEvent, PeerId, PeerInfo};
pub use protocol::{P2pMessage, PeerAddr, ShareReplyResult};

/// Current share-network protocol version (V36 share generation)
pub const PROTOCOL_VERSION: u32 = 3600;
/// Our subversion string
pub const SUBVERSION: &str = concat!("peerpool-node/", env!("CARGO_PKG_VERSION"));

/// Default outbound connection target
pub const TARGET_OUTBOUND: usize = 10;

/// Network layer configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_port: u16,
    pub max_inbound: usize,
    pub target_outbound: usize,
    pub ban_threshold: f64,
    pub ban_decay_interval_secs: u64,
    pub ban_cooldown_secs: u64,
}

impl NetworkConfig {
    pub fn for_net(net: &NetworkDescriptor) -> Self {
        Self {
            listen_port: net.default_p2p_port,
            max_inbound: 40,
            target_outbound: TARGET_OUTBOUND,
            ban_threshold: 100.0,
            ban_decay_interval_secs: 60,
            ban_cooldown_secs: 1800,
        }
    }
}

/// A connected, handshaken peer
pub struct ConnectedPeer {
    pub addr: SocketAddr,
    pub info: PeerInfo,
    pub outbound: mpsc::Sender<P2pMessage>,
    /// Set when the queue overflowed and the peer owes a fresh tip push
    pub needs_tip: bool,
}

/// The connection manager
pub struct NetworkManager {
    net: Arc<NetworkDescriptor>,
    config: NetworkConfig,
    pub peers: Arc<Mutex<HashMap<PeerId, ConnectedPeer>>>,
    pub bans: Arc<Mutex<BanTracker>>,
    pub addrs: Arc<Mutex<AddrStore>>,
    events_tx: mpsc::Sender<PeerEvent>,
    best_share_rx: watch::Receiver<Option<Hash256>>,
    /// Nonce in our outgoing version messages, for self-connect detection
    local_nonce: u64,
    next_peer_id: AtomicU64,
}

impl NetworkManager {
    pub fn new(
        net: Arc<NetworkDescriptor>,
        config: NetworkConfig,
        events_tx: mpsc::Sender<PeerEvent>,
        best_share_rx: watch::Receiver<Option<Hash256>>,
    ) -> Self {
        let bans = BanTracker::new(
            config.ban_threshold,
            config.ban_decay_interval_secs,
            config.ban_cooldown_secs,
        );
        Self {
            net,
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            bans: Arc::new(Mutex::new(bans)),
            addrs: Arc::new(Mutex::new(AddrStore::new(2000, 24 * 3600))),
            events_tx,
            best_share_rx,
            local_nonce: rand::random(),
            next_peer_id: AtomicU64::new(1),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Count of fully handshaken peers; only these matter for the
    /// "isolated node" warning
    pub async fn handshaken_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Bind the listener; a failure here is a startup error (exit code 3)
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listen = SocketAddr::from(([0, 0, 0, 0], self.config.listen_port));
        let listener = TcpListener::bind(listen).await?;
        info!(%listen, "P2P listening");
        Ok(listener)
    }

    /// Accept loop for inbound peers
    pub async fn run_accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let now = current_timestamp();
            if self.bans.lock().await.is_banned(addr.ip(), now) {
                debug!(%addr, "refused banned host");
                continue;
            }
            if self.peers.lock().await.len() >= self.config.max_inbound {
                debug!(%addr, "inbound capacity reached");
                continue;
            }
            self.spawn_peer(stream, addr, true);
        }
    }

    /// Dial one address
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let now = current_timestamp();
            if manager.bans.lock().await.is_banned(addr.ip(), now) {
                return;
            }
            match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => manager.spawn_peer(stream, addr, false),
                Ok(Err(e)) => debug!(%addr, "dial failed: {}", e),
                Err(_) => debug!(%addr, "dial timed out"),
            }
        });
    }

    fn spawn_peer(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, inbound: bool) {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let net = Arc::clone(&self.net);
        let events = self.events_tx.clone();
        let best = *self.best_share_rx.borrow();
        let nonce = self.local_nonce;
        tokio::spawn(peer::run_peer(
            stream, addr, id, inbound, net, nonce, best, events,
        ));
    }

    /// Resolve bootstrap DNS names and dial until the outbound target is met
    pub async fn bootstrap(self: &Arc<Self>) {
        let mut candidates: Vec<SocketAddr> = Vec::new();
        for host in self.net.bootstrap_hosts {
            let target = format!("{}:{}", host, self.net.default_p2p_port);
            match lookup_host(&target).await {
                Ok(addrs) => {
                    let found: Vec<SocketAddr> = addrs.collect();
                    info!(host, count = found.len(), "resolved bootstrap host");
                    candidates.extend(found);
                }
                Err(e) => warn!(host, "bootstrap resolution failed: {}", e),
            };
        }
        {
            let now = current_timestamp();
            let mut addrs = self.addrs.lock().await;
            for addr in &candidates {
                addrs.note(*addr, now);
            }
        }
        for addr in candidates.into_iter().take(self.config.target_outbound) {
            self.connect(addr);
        }
    }

    /// Keep outbound connections near the target; decay ban scores
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let now = current_timestamp();
            self.bans.lock().await.decay_tick(now);

            let (connected, connected_addrs): (usize, Vec<SocketAddr>) = {
                let peers = self.peers.lock().await;
                (peers.len(), peers.values().map(|p| p.addr).collect())
            };
            if connected >= self.config.target_outbound {
                continue;
            }
            let candidates = self.addrs.lock().await.fresh(now, 50);
            let mut dialed = 0;
            for candidate in candidates {
                if connected_addrs.contains(&candidate.addr) {
                    continue;
                }
                self.connect(candidate.addr);
                dialed += 1;
                if connected + dialed >= self.config.target_outbound {
                    break;
                }
            }
            if connected == 0 && dialed == 0 {
                warn!("node is isolated: no handshaken peers and no dialable addresses");
            }
        }
    }

    /// Broadcast to every handshaken peer whose protocol accepts the
    /// message. Overflowing a peer's queue coalesces into a later tip push
    /// rather than queueing unboundedly.
    pub async fn broadcast(&self, message: P2pMessage, min_protocol: u32) {
        let mut peers = self.peers.lock().await;
        for peer in peers.values_mut() {
            if peer.info.protocol_version < min_protocol {
                continue;
            }
            match peer.outbound.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    peer.needs_tip = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Send to one peer; a full queue flags a pending tip push
    pub async fn send_to(&self, id: PeerId, message: P2pMessage) -> bool {
        let mut peers = self.peers.lock().await;
        let Some(peer) = peers.get_mut(&id) else {
            return false;
        };
        match peer.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                peer.needs_tip = true;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Register a handshaken peer (called by the node's ingest loop)
    pub async fn register(
        &self,
        id: PeerId,
        addr: SocketAddr,
        info: PeerInfo,
        outbound: mpsc::Sender<P2pMessage>,
    ) {
        let now = current_timestamp();
        let mut addrs = self.addrs.lock().await;
        if !info.inbound {
            addrs.note_success(addr, now);
        }
        drop(addrs);
        self.peers.lock().await.insert(
            id,
            ConnectedPeer {
                addr,
                info,
                outbound,
                needs_tip: false,
            },
        );
    }

    /// Drop a peer and apply any ban penalty its connection earned
    pub async fn unregister(&self, id: PeerId, addr: SocketAddr, misbehaved: Option<f64>) {
        self.peers.lock().await.remove(&id);
        if let Some(penalty) = misbehaved {
            self.bans
                .lock()
                .await
                .penalize(addr.ip(), penalty, current_timestamp());
        }
    }

    /// Apply a ban penalty for a protocol offence on a live connection
    pub async fn penalize(&self, addr: SocketAddr, penalty: f64) {
        self.bans
            .lock()
            .await
            .penalize(addr.ip(), penalty, current_timestamp());
    }
}
