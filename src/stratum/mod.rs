//! Stratum server
//!
//! Line-delimited JSON-RPC over TCP. Each connection runs its own task with
//! a bounded outbound queue; a stalled miner is dropped rather than queued
//! against. New-work broadcasts fan out through a shared epoch channel.

pub mod messages;
pub mod session;
pub mod vardiff;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::networks::NetworkDescriptor;
use crate::parent::BlockTemplate;
use crate::primitives::block::Block;
use crate::primitives::tx::Transaction;
use crate::share::Share;
use crate::tracker::ShareTracker;
use crate::work::WorkGenerator;

pub use messages::MinerLogin;
pub use session::Session;
pub use vardiff::{Vardiff, VardiffConfig, VardiffSnapshot};

/// Pool-wide submission ceiling per second
pub const GLOBAL_MAX_SUBMITS_PER_SEC: u32 = 1000;

/// BIP320 bits this pool lets miners roll
pub const DEFAULT_VERSION_MASK: u32 = 0x1fff_e000;

/// A qualifying submission on its way to the share chain (and possibly the
/// parent chain and any merged auxiliary chains)
pub struct FoundWork {
    pub share: Share,
    pub extranonce2: [u8; 4],
    pub job_id: u32,
    /// The mined generation transaction, for auxpow proofs
    pub coinbase: Transaction,
    pub block: Option<Box<Block>>,
}

/// Operator-driven pushes fanned out to every connection
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// `client.show_message` banner
    ShowMessage(String),
    /// `client.reconnect`; sessions stay resumable
    Reconnect,
}

/// Pool-wide submission rate limiter with a dynamic-floor signal
pub struct GlobalLimits {
    max_per_sec: u32,
    state: std::sync::Mutex<(u64, u32)>,
}

impl GlobalLimits {
    pub fn new(max_per_sec: u32) -> Self {
        Self {
            max_per_sec,
            state: std::sync::Mutex::new((0, 0)),
        }
    }

    /// Count one submission; false means drop it
    pub fn allow_submit(&self, now: u64) -> bool {
        let mut state = self.state.lock().expect("limits lock");
        if state.0 != now {
            *state = (now, 0);
        }
        state.1 += 1;
        state.1 <= self.max_per_sec
    }

    /// Above half the global cap: sessions should raise their floors
    pub fn above_half_capacity(&self, now: u64) -> bool {
        let state = self.state.lock().expect("limits lock");
        state.0 == now && state.1 > self.max_per_sec / 2
    }
}

/// State shared by every stratum connection
pub struct StratumShared {
    pub net: Arc<NetworkDescriptor>,
    pub tracker: Arc<Mutex<ShareTracker>>,
    pub workgen: Arc<Mutex<WorkGenerator>>,
    pub template_rx: watch::Receiver<Option<Arc<BlockTemplate>>>,
    /// Bumped on best-share or template change; sessions push clean jobs
    pub work_epoch: watch::Receiver<u64>,
    pub found_tx: mpsc::Sender<FoundWork>,
    pub limits: GlobalLimits,
    pub session_cache: Mutex<HashMap<String, VardiffSnapshot>>,
    pub vardiff_config: VardiffConfig,
    pub version_mask: u32,
    /// Banner/reconnect fan-out; connections subscribe on accept
    pub control: broadcast::Sender<ControlMessage>,
}

/// The listener
pub struct StratumServer {
    shared: Arc<StratumShared>,
    port: u16,
}

impl StratumServer {
    pub fn new(shared: Arc<StratumShared>, port: u16) -> Self {
        Self { shared, port }
    }

    /// Bind the worker port; failure here is a startup error (exit code 3)
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listen = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(listen).await?;
        info!(%listen, "stratum listening");
        Ok(listener)
    }

    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(run_connection(stream, addr, shared));
                }
                Err(e) => warn!("stratum accept failed: {}", e),
            }
        }
    }
}

/// Drive one miner connection to completion
async fn run_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<StratumShared>) {
    debug!(%addr, "miner connected");
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

    // Writer task: a stalled socket ends the channel and thus the session
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            let mut framed = line.into_bytes();
            framed.push(b'\n');
            if write_half.write_all(&framed).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(Arc::clone(&shared), out_tx);
    let mut lines = BufReader::new(read_half).lines();
    let mut work_epoch = shared.work_epoch.clone();
    let mut control_rx = shared.control.subscribe();
    let mut idle_ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<messages::StratumRequest>(&line) {
                        Ok(request) => {
                            if !session.handle(request).await {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(%addr, "bad stratum line: {}", e);
                            // Malformed input: drop the message, keep the socket
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%addr, "read failed: {}", e);
                    break;
                }
            },
            changed = work_epoch.changed() => {
                if changed.is_err() {
                    break;
                }
                if !session.send_work(true).await {
                    break;
                }
            }
            control = control_rx.recv() => match control {
                Ok(message) => {
                    if !session.handle_control(message).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = idle_ticker.tick() => {
                session.idle_tick(crate::utils::current_timestamp()).await;
            }
        }
    }

    session.save_session().await;
    writer.abort();
    debug!(%addr, "miner disconnected");
}
