//! Node orchestration
//!
//! Wires the tracker, parent adapter, work generator, P2P manager, and
//! Stratum server together, owns the ingest loops, and carries the
//! startup/shutdown sequence with its exit-code contract.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::merged::{AuxCommitment, MergedCoordinator};
use crate::network::{
    ban::penalty, protocol::MAX_SHARES_PER_MESSAGE, NetworkConfig, NetworkManager, P2pMessage,
    PeerEvent, ShareReplyResult,
};
use crate::networks::NetworkDescriptor;
use crate::parent::{KnownTxs, ParentRpcClient, TemplatePoller};
use crate::primitives::hash::Hash256;
use crate::share::Share;
use crate::storage::{BlockRecord, Storage};
use crate::stratum::{
    FoundWork, GlobalLimits, StratumServer, StratumShared, VardiffConfig,
    DEFAULT_VERSION_MASK, GLOBAL_MAX_SUBMITS_PER_SEC,
};
use crate::tracker::{AddOutcome, ShareTracker};
use crate::utils::current_timestamp;
use crate::work::WorkGenerator;

/// Startup failures map directly to process exit codes
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("parent node unreachable: {0}")]
    ParentUnreachable(String),
    #[error("port bind failed: {0}")]
    Bind(std::io::Error),
}

impl NodeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::Config(_) => 1,
            NodeError::ParentUnreachable(_) => 2,
            NodeError::Bind(_) => 3,
        }
    }
}

/// Long-lived node state shared across the ingest loops
struct NodeState {
    net: Arc<NetworkDescriptor>,
    tracker: Arc<Mutex<ShareTracker>>,
    workgen: Arc<Mutex<WorkGenerator>>,
    known_txs: Arc<Mutex<KnownTxs>>,
    storage: Arc<Storage>,
    client: Arc<ParentRpcClient>,
    network: Arc<NetworkManager>,
    best_tx: watch::Sender<Option<Hash256>>,
    epoch_tx: watch::Sender<u64>,
    /// Outstanding sharereq ids we are allowed replies for
    pending_requests: Mutex<HashSet<u64>>,
    /// Share-chain cumulative work when the previous block was found
    last_block_abswork: Mutex<u128>,
    /// How long a disconnected Stratum session stays resumable
    session_timeout_secs: u64,
    /// Auxiliary-chain coordination, when merged mining is configured
    merged: Option<Arc<MergedCoordinator>>,
    aux_commitment: Arc<Mutex<Option<AuxCommitment>>>,
    shared: Arc<StratumShared>,
}

/// Run the node to completion (ctrl-c). Every startup error carries its
/// exit code.
pub async fn run(config: NodeConfig) -> Result<(), NodeError> {
    let net = Arc::new(config.net.clone());
    let storage = Arc::new(
        Storage::open(&config.data_dir).map_err(|e| NodeError::Config(e.to_string()))?,
    );

    // Parent node must answer before anything else spins up
    let client = Arc::new(
        ParentRpcClient::new(&config.parent_rpc_url)
            .map_err(|e| NodeError::Config(e.to_string()))?,
    );
    client
        .get_blockchain_info()
        .await
        .map_err(|e| NodeError::ParentUnreachable(e.to_string()))?;
    info!(net = net.name, "parent node reachable");

    // Restore the share forest
    let tracker = Arc::new(Mutex::new(ShareTracker::new(Arc::clone(&net))));
    {
        let mut tracker = tracker.lock().await;
        let restored = storage
            .load_shares()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let mut hashes = Vec::new();
        for share in restored {
            if let Ok((_, hash)) = tracker.add(share) {
                hashes.push(hash);
            }
        }
        for hash in hashes {
            let _ = tracker.verify(&hash, None);
        }
        if let Some(best) = tracker.best_share() {
            info!(%best, height = tracker.len(), "share chain restored");
        }
    }

    let known_txs = Arc::new(Mutex::new(KnownTxs::new()));
    let (poller, template_rx) = TemplatePoller::new(
        Arc::clone(&client),
        Arc::clone(&net),
        Arc::clone(&known_txs),
    );
    // Prime the first template before miners can connect
    poller
        .refresh()
        .await
        .map_err(|e| NodeError::ParentUnreachable(e.to_string()))?;
    tokio::spawn(poller.run());

    let solo = !net.persist;
    let workgen = Arc::new(Mutex::new(WorkGenerator::new(
        Arc::clone(&net),
        config.donation_permille,
        solo,
    )));

    let (best_tx, best_rx) = watch::channel(tracker.lock().await.best_share());
    let (epoch_tx, epoch_rx) = watch::channel(0u64);

    // P2P
    let (peer_events_tx, mut peer_events_rx) = mpsc::channel::<PeerEvent>(1024);
    let mut net_config = NetworkConfig::for_net(&net);
    net_config.listen_port = config.p2p_port;
    net_config.max_inbound = config.max_connections;
    let network = Arc::new(NetworkManager::new(
        Arc::clone(&net),
        net_config,
        peer_events_tx,
        best_rx.clone(),
    ));
    network
        .addrs
        .lock()
        .await
        .restore(storage.load_peers());
    let p2p_listener = network.bind().await.map_err(NodeError::Bind)?;
    tokio::spawn(Arc::clone(&network).run_accept(p2p_listener));
    tokio::spawn(Arc::clone(&network).run_maintenance());
    {
        let network = Arc::clone(&network);
        tokio::spawn(async move { network.bootstrap().await });
    }

    // Stratum
    let (found_tx, mut found_rx) = mpsc::channel::<FoundWork>(256);
    let shared = Arc::new(StratumShared {
        net: Arc::clone(&net),
        tracker: Arc::clone(&tracker),
        workgen: Arc::clone(&workgen),
        template_rx: template_rx.clone(),
        work_epoch: epoch_rx,
        found_tx,
        limits: GlobalLimits::new(GLOBAL_MAX_SUBMITS_PER_SEC),
        session_cache: Mutex::new(storage.load_sessions()),
        vardiff_config: VardiffConfig {
            target_share_secs: config.share_rate_secs,
            min_difficulty: config.min_difficulty,
            max_difficulty: config.max_difficulty,
            window: 8,
        },
        version_mask: DEFAULT_VERSION_MASK,
        control: tokio::sync::broadcast::channel(8).0,
    });
    let stratum = StratumServer::new(Arc::clone(&shared), config.stratum_port);
    let stratum_listener = stratum.bind().await.map_err(NodeError::Bind)?;
    tokio::spawn(stratum.run(stratum_listener));

    // Merged mining
    let (merged, aux_commitment) = if config.merged.is_empty() {
        (None, Arc::new(Mutex::new(None)))
    } else {
        let (coordinator, commitment) = spawn_merged(&config, &workgen, &epoch_tx).await?;
        (Some(coordinator), commitment)
    };

    let state = Arc::new(NodeState {
        net: Arc::clone(&net),
        tracker,
        workgen,
        known_txs,
        storage,
        client,
        network,
        best_tx,
        epoch_tx,
        pending_requests: Mutex::new(HashSet::new()),
        last_block_abswork: Mutex::new(0),
        session_timeout_secs: config.session_timeout_secs,
        merged,
        aux_commitment,
        shared,
    });

    // Template changes are new-work events; peers also learn which
    // transactions we can serve them
    {
        let state = Arc::clone(&state);
        let mut template_rx = template_rx.clone();
        tokio::spawn(async move {
            while template_rx.changed().await.is_ok() {
                let txids = template_rx
                    .borrow()
                    .as_ref()
                    .map(|t| t.txids())
                    .unwrap_or_default();
                state.note_new_work().await;
                if !txids.is_empty() {
                    state
                        .network
                        .broadcast(P2pMessage::HaveTx { tx_hashes: txids }, 0)
                        .await;
                }
            }
        });
    }

    // Periodic maintenance and persistence
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                state.maintenance().await;
            }
        });
    }

    info!("node started");
    loop {
        tokio::select! {
            found = found_rx.recv() => match found {
                Some(found) => state.handle_found(found).await,
                None => break,
            },
            event = peer_events_rx.recv() => match event {
                Some(event) => state.handle_peer_event(event).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    state.persist().await;
    Ok(())
}

/// Stand up aux-chain clients and the commitment refresh loop
async fn spawn_merged(
    config: &NodeConfig,
    workgen: &Arc<Mutex<WorkGenerator>>,
    epoch_tx: &watch::Sender<u64>,
) -> Result<(Arc<MergedCoordinator>, Arc<Mutex<Option<AuxCommitment>>>), NodeError> {
    let mut chains = Vec::new();
    for (name, url) in &config.merged {
        let profile = crate::networks::aux_lookup(name)
            .ok_or_else(|| NodeError::Config(format!("unknown aux chain {}", name)))?;
        let client = Arc::new(
            ParentRpcClient::new(url).map_err(|e| NodeError::Config(e.to_string()))?,
        );
        let payout = config
            .merged_operator_address
            .clone()
            .unwrap_or_else(|| config.payout_address.clone());
        chains.push((profile, client, payout));
    }
    let coordinator = Arc::new(MergedCoordinator::new(chains));
    tokio::spawn(Arc::clone(&coordinator).run());

    let commitment_handle = Arc::new(Mutex::new(None));
    let workgen = Arc::clone(workgen);
    let epoch_tx = epoch_tx.clone();
    let works_handle = coordinator.works_handle();
    let handle = Arc::clone(&commitment_handle);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        let mut last_commitment = None;
        loop {
            ticker.tick().await;
            let works: Vec<_> = works_handle.lock().await.values().copied().collect();
            if works.is_empty() {
                continue;
            }
            match crate::merged::build_commitment(&works) {
                Ok(commitment) => {
                    if last_commitment.as_ref() != Some(&commitment.data) {
                        last_commitment = Some(commitment.data);
                        *handle.lock().await = Some(commitment.clone());
                        let mut workgen = workgen.lock().await;
                        workgen.merged_commitment = Some(commitment.data);
                        workgen.note_new_work();
                        drop(workgen);
                        epoch_tx.send_modify(|epoch| *epoch += 1);
                    }
                }
                Err(e) => warn!("aux commitment failed: {}", e),
            }
        }
    });
    Ok((coordinator, commitment_handle))
}

impl NodeState {
    /// New template or merged work: bump counters and re-issue jobs
    async fn note_new_work(&self) {
        self.workgen.lock().await.note_new_work();
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }

    /// A local submission qualified as a share (and possibly a block)
    async fn handle_found(&self, found: FoundWork) {
        let share = found.share.clone();
        let version = share.version;

        if let Some(block) = &found.block {
            let block_hex = hex::encode(block.to_bytes());
            let header = block.header;
            let height = crate::primitives::block::decode_bip34_height(
                &block.coinbase.inputs[0].script_sig,
            )
            .unwrap_or_default();
            match self.client.submit_block(&block_hex).await {
                Ok(None) => {
                    info!(hash = %header.hash(), height, "parent block accepted");
                    let _ = self.storage.append_block(&BlockRecord {
                        height,
                        hash: header.hash(),
                        timestamp: current_timestamp(),
                        luck: self.block_luck(&share).await,
                    });
                }
                Ok(Some(reason)) => warn!(%reason, "parent block rejected"),
                Err(e) => warn!("parent block submit failed: {}", e),
            }
        }

        // Any qualifying PoW may also satisfy an easier auxiliary target
        if let Some(merged) = &self.merged {
            if let Some(commitment) = self.aux_commitment.lock().await.clone() {
                let ids = share.ids(&self.net.identifier);
                let pow = share.pow_hash(&self.net, &ids);
                merged
                    .try_submit(
                        &pow,
                        &commitment,
                        &found.coinbase,
                        &share.merkle_link,
                        &ids.header,
                    )
                    .await;
            }
        }

        let best_changed = {
            let mut tracker = self.tracker.lock().await;
            let before = tracker.best_share();
            match tracker.add(share.clone()) {
                Ok((AddOutcome::Known, _)) => false,
                Ok((_, hash)) => {
                    if let Err(e) = tracker.verify(&hash, None) {
                        warn!("locally produced share failed verification: {}", e);
                    }
                    tracker.best_share() != before
                }
                Err(e) => {
                    warn!("locally produced share rejected: {}", e);
                    false
                }
            }
        };

        // Gossip the new share; peers below its protocol floor never see it
        self.network
            .broadcast(
                P2pMessage::Shares {
                    shares: vec![share],
                },
                version.minimum_protocol_version(),
            )
            .await;

        if best_changed {
            self.publish_best().await;
        }
    }

    /// Expected work for this parent target over the share-chain work
    /// actually spent since the last found block; above 1.0 means lucky
    async fn block_luck(&self, share: &Share) -> f64 {
        let expected = crate::primitives::target::u256_to_f64(
            crate::primitives::target::target_to_average_attempts(
                crate::primitives::target::compact_to_target(share.min_header.bits),
            ),
        );
        let mut last = self.last_block_abswork.lock().await;
        let spent = share.info.abswork.saturating_sub(*last).max(1) as f64;
        *last = share.info.abswork;
        expected / spent
    }

    /// Push the tracker's best tip to the watch channel and re-issue work
    async fn publish_best(&self) {
        let best = self.tracker.lock().await.best_share();
        self.best_tx.send_replace(best);
        self.note_new_work().await;
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                id,
                addr,
                info,
                outbound,
            } => {
                info!(%addr, version = info.protocol_version, subversion = %info.subversion, "peer connected");
                let peer_best = info.best_share_hash;
                let peer_version = info.protocol_version;
                self.network.register(id, addr, info, outbound).await;
                let _ = self.network.send_to(id, P2pMessage::GetAddrs { count: 16 }).await;
                // Introduce our tip; let the peer walk back on its own
                if let Some(tip) = *self.best_tx.borrow() {
                    let tracker = self.tracker.lock().await;
                    if let Some(entry) = tracker.get(&tip) {
                        let share = entry.share.as_ref().clone();
                        let floor = share.version.minimum_protocol_version();
                        drop(tracker);
                        if peer_version >= floor {
                            let _ = self
                                .network
                                .send_to(id, P2pMessage::Shares { shares: vec![share] })
                                .await;
                        }
                    }
                }
                // And chase theirs if we do not know it
                if let Some(peer_tip) = peer_best {
                    if !self.tracker.lock().await.contains(&peer_tip) {
                        self.request_backfill(id, vec![peer_tip]).await;
                    }
                }
            }
            PeerEvent::Message { id, addr, message } => {
                self.handle_peer_message(id, addr, message).await;
            }
            PeerEvent::Disconnected {
                id,
                addr,
                reason,
                misbehaved,
            } => {
                debug!(%addr, %reason, "peer gone");
                self.network.unregister(id, addr, misbehaved).await;
            }
        }
    }

    async fn handle_peer_message(
        &self,
        id: crate::network::PeerId,
        addr: std::net::SocketAddr,
        message: P2pMessage,
    ) {
        match message {
            P2pMessage::Shares { shares } => {
                self.ingest_shares(id, addr, shares, false).await;
            }
            P2pMessage::ShareReply { id: req_id, shares, result } => {
                let solicited = self.pending_requests.lock().await.remove(&req_id);
                if !solicited {
                    self.network.penalize(addr, penalty::UNSOLICITED).await;
                    return;
                }
                if result == ShareReplyResult::Ok {
                    self.ingest_shares(id, addr, shares, true).await;
                }
            }
            P2pMessage::ShareReq {
                id: req_id,
                hashes,
                parents,
                stops,
            } => {
                self.serve_share_request(id, req_id, hashes, parents, stops)
                    .await;
            }
            P2pMessage::GetAddrs { count } => {
                let now = current_timestamp();
                let addrs = self
                    .network
                    .addrs
                    .lock()
                    .await
                    .fresh(now, count.min(64) as usize);
                let _ = self.network.send_to(id, P2pMessage::Addrs { addrs }).await;
            }
            P2pMessage::Addrs { addrs } => {
                let now = current_timestamp();
                let mut store = self.network.addrs.lock().await;
                for entry in addrs {
                    store.note(entry.addr, now);
                }
            }
            P2pMessage::HaveTx { tx_hashes } => {
                debug!(%addr, count = tx_hashes.len(), "peer announced transactions");
            }
            P2pMessage::RememberTx { tx_hashes, txs } => {
                let now = current_timestamp();
                let mut known = self.known_txs.lock().await;
                for (hash, bytes) in tx_hashes.into_iter().zip(txs) {
                    known.insert(hash, bytes, now);
                }
            }
            P2pMessage::LosingTx { .. } => {}
            P2pMessage::ForgetTx { tx_hashes } => {
                let mut known = self.known_txs.lock().await;
                for hash in &tx_hashes {
                    known.remove(hash);
                }
            }
            P2pMessage::BestBlockHeader { header } => {
                debug!(hash = %header.hash(), "peer relayed parent header");
            }
            P2pMessage::Version { .. } | P2pMessage::Verack => {
                // Handshake messages after the handshake are protocol abuse
                self.network.penalize(addr, penalty::MALFORMED).await;
            }
            P2pMessage::Ping { .. } | P2pMessage::Pong { .. } => {}
        }
    }

    /// Add gossiped shares, chase unknown parents, ban on invalid ones
    async fn ingest_shares(
        &self,
        peer: crate::network::PeerId,
        addr: std::net::SocketAddr,
        shares: Vec<Share>,
        from_backfill: bool,
    ) {
        let mut missing_parents = Vec::new();
        let best_changed;
        {
            let mut tracker = self.tracker.lock().await;
            let before = tracker.best_share();
            for share in shares {
                // Pre-V34 shares reference transactions inline; hashes we
                // cannot resolve are legacy-strict disconnect territory
                if share.version.carries_inline_txs() {
                    let known = self.known_txs.lock().await;
                    let unknown = share
                        .info
                        .new_transaction_hashes
                        .iter()
                        .any(|h| !known.contains(h));
                    if unknown {
                        drop(known);
                        warn!(%addr, "legacy share with unresolvable transactions");
                        self.network.penalize(addr, penalty::UNKNOWN_TX_REF).await;
                        continue;
                    }
                }
                match tracker.add(share) {
                    Ok((AddOutcome::Known, _)) => {} // silent, no ban change
                    Ok((AddOutcome::Orphan, hash)) => {
                        if let Some(parent) = tracker
                            .get(&hash)
                            .and_then(|e| e.share.info.previous_share_hash)
                        {
                            missing_parents.push(parent);
                        }
                    }
                    Ok((AddOutcome::New, hash)) => {
                        match tracker.verify(&hash, None) {
                            Ok(()) => {}
                            Err(crate::tracker::VerifyError::MissingAncestor) => {}
                            Err(e) => {
                                debug!(%addr, "share failed verification: {}", e);
                                self.network.penalize(addr, penalty::BAD_SHARE).await;
                            }
                        }
                        // A new parent may unblock waiting children
                        let waiting: Vec<Hash256> = tracker
                            .get(&hash)
                            .map(|e| e.children.clone())
                            .unwrap_or_default();
                        for child in waiting {
                            let _ = tracker.verify(&child, None);
                        }
                    }
                    Err(e) => {
                        debug!(%addr, "undecodable share: {}", e);
                        self.network.penalize(addr, penalty::MALFORMED).await;
                    }
                }
            }
            best_changed = tracker.best_share() != before;
        }

        if !missing_parents.is_empty() && !from_backfill {
            self.request_backfill(peer, missing_parents).await;
        }
        if best_changed {
            self.publish_best().await;
            // Tell everyone about the new tip
            if let Some(tip) = *self.best_tx.borrow() {
                let tracker = self.tracker.lock().await;
                if let Some(entry) = tracker.get(&tip) {
                    let share = entry.share.as_ref().clone();
                    let floor = share.version.minimum_protocol_version();
                    drop(tracker);
                    self.network
                        .broadcast(P2pMessage::Shares { shares: vec![share] }, floor)
                        .await;
                }
            }
        }
    }

    /// Bounded backfill: ask for ancestors of the given hashes
    async fn request_backfill(&self, peer: crate::network::PeerId, hashes: Vec<Hash256>) {
        let req_id: u64 = rand::random();
        self.pending_requests.lock().await.insert(req_id);
        let stops = self
            .tracker
            .lock()
            .await
            .best_share()
            .into_iter()
            .collect();
        let sent = self
            .network
            .send_to(
                peer,
                P2pMessage::ShareReq {
                    id: req_id,
                    hashes,
                    parents: self.net.real_chain_length,
                    stops,
                },
            )
            .await;
        if !sent {
            self.pending_requests.lock().await.remove(&req_id);
        }
    }

    /// Answer a peer's chain request
    async fn serve_share_request(
        &self,
        peer: crate::network::PeerId,
        req_id: u64,
        hashes: Vec<Hash256>,
        parents: u64,
        stops: Vec<Hash256>,
    ) {
        let tracker = self.tracker.lock().await;
        let mut found = Vec::new();
        let limit = parents
            .min(self.net.real_chain_length)
            .min(MAX_SHARES_PER_MESSAGE as u64);
        'outer: for start in &hashes {
            if !tracker.contains(start) {
                continue;
            }
            let mut cursor = Some(*start);
            while let Some(hash) = cursor {
                if found.len() as u64 >= limit || stops.contains(&hash) {
                    break 'outer;
                }
                let Some(entry) = tracker.get(&hash) else {
                    break 'outer;
                };
                found.push(entry.share.as_ref().clone());
                cursor = entry.share.info.previous_share_hash;
            }
            break;
        }
        drop(tracker);

        let result = if found.is_empty() {
            ShareReplyResult::None
        } else {
            ShareReplyResult::Ok
        };
        let _ = self
            .network
            .send_to(
                peer,
                P2pMessage::ShareReply {
                    id: req_id,
                    result,
                    shares: found,
                },
            )
            .await;
    }

    /// Periodic pruning, trimming, and persistence
    async fn maintenance(&self) {
        let now = current_timestamp();
        self.known_txs.lock().await.trim(now);
        self.tracker.lock().await.prune();
        self.shared
            .session_cache
            .lock()
            .await
            .retain(|_, s| now.saturating_sub(s.saved_at) < self.session_timeout_secs);
        self.persist().await;
    }

    async fn persist(&self) {
        let shares = self.tracker.lock().await.all_shares();
        if let Err(e) = self.storage.save_shares(&shares) {
            warn!("share persistence failed: {}", e);
        }
        let peers = self.network.addrs.lock().await.persistable();
        if let Err(e) = self.storage.save_peers(&peers) {
            warn!("peer cache persistence failed: {}", e);
        }
        let sessions = self.shared.session_cache.lock().await.clone();
        if let Err(e) = self.storage.save_sessions(&sessions) {
            warn!("session cache persistence failed: {}", e);
        }
    }
}
