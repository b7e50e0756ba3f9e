//! Per-connection Stratum session
//!
//! Owns the miner's negotiated state and dispatches every client method.
//! Submissions validate against the target pinned in their job, never
//! against the connection's current difficulty.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::primitives::address::{address_to_script, convertible_pubkey_hash};
use crate::primitives::hash::Hash256;
use crate::primitives::target::difficulty_to_target;
use crate::work::{Classified, Job, WorkRequest, EXTRANONCE2_SIZE};

use super::messages::{
    error_code, notification, MinerLogin, StratumRequest, StratumResponse,
};
use super::vardiff::Vardiff;
use super::{FoundWork, StratumShared};

/// Jobs remembered per connection; older submissions go stale
const JOB_MEMORY: usize = 8;
/// Per-connection submission ceiling per second
const MAX_SUBMITS_PER_SEC: usize = 100;

/// One miner connection
pub struct Session {
    pub session_id: String,
    pub extranonce1: [u8; 4],
    pub subscribed: bool,
    /// worker name -> payout pubkey hash
    pub authorized: HashMap<String, [u8; 20]>,
    pub primary_pubkey_hash: Option<[u8; 20]>,
    pub vardiff: Vardiff,
    /// Negotiated BIP320 rolling mask; zero when not negotiated
    pub version_mask: u32,
    pub jobs: VecDeque<Job>,
    submit_times: VecDeque<u64>,
    outbound: mpsc::Sender<String>,
    shared: Arc<StratumShared>,
}

impl Session {
    pub fn new(shared: Arc<StratumShared>, outbound: mpsc::Sender<String>) -> Self {
        let session_id = format!("{:016x}", rand::random::<u64>());
        let vardiff = Vardiff::new(shared.vardiff_config.clone(), 1.0);
        Self {
            session_id,
            extranonce1: rand::random::<u32>().to_be_bytes(),
            subscribed: false,
            authorized: HashMap::new(),
            primary_pubkey_hash: None,
            vardiff,
            version_mask: 0,
            jobs: VecDeque::new(),
            submit_times: VecDeque::new(),
            outbound,
            shared,
        }
    }

    /// Queue one line; a full queue means the miner has stalled and the
    /// connection is dropped instead of buffering without bound
    async fn push(&self, line: String) -> bool {
        self.outbound.try_send(line).is_ok()
    }

    /// Dispatch one client line; returns false when the connection must close
    pub async fn handle(&mut self, request: StratumRequest) -> bool {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "mining.subscribe" => self.on_subscribe(id, &request.params).await,
            "mining.configure" => self.on_configure(id, &request.params).await,
            "mining.authorize" => self.on_authorize(id, &request.params).await,
            "mining.suggest_difficulty" => self.on_suggest_difficulty(id, &request.params).await,
            "mining.submit" => self.on_submit(id, &request.params).await,
            "mining.extranonce.subscribe" => {
                self.respond(StratumResponse::ok(id, json!(true))).await
            }
            "mining.ping" => self.respond(StratumResponse::ok(id, json!("pong"))).await,
            other => {
                debug!(method = other, "unknown stratum method");
                self.respond(StratumResponse::err(id, error_code::UNKNOWN, "unknown method"))
                    .await
            }
        }
    }

    async fn respond(&self, response: StratumResponse) -> bool {
        self.push(super::messages::response_line(&response)).await
    }

    async fn on_subscribe(&mut self, id: Value, params: &Value) -> bool {
        // Optional second parameter resumes a previous session
        if let Some(previous) = params.get(1).and_then(|v| v.as_str()) {
            let cache = self.shared.session_cache.lock().await;
            if let Some(saved) = cache.get(previous) {
                self.session_id = previous.to_string();
                self.vardiff.restore(saved);
                info!(session = previous, "stratum session resumed");
            }
        }
        self.subscribed = true;
        let result = json!([
            [
                ["mining.set_difficulty", self.session_id.clone()],
                ["mining.notify", self.session_id.clone()]
            ],
            hex::encode(self.extranonce1),
            EXTRANONCE2_SIZE,
        ]);
        self.respond(StratumResponse::ok(id, result)).await
    }

    async fn on_configure(&mut self, id: Value, params: &Value) -> bool {
        let capabilities: Vec<String> = params
            .get(0)
            .and_then(|v| v.as_array())
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let mut result = serde_json::Map::new();
        if capabilities.iter().any(|c| c == "version-rolling") {
            let requested = params
                .get(1)
                .and_then(|v| v.get("version-rolling.mask"))
                .and_then(|v| v.as_str())
                .and_then(|s| u32::from_str_radix(s, 16).ok())
                .unwrap_or(u32::MAX);
            self.version_mask = requested & self.shared.version_mask;
            result.insert("version-rolling".into(), json!(true));
            result.insert(
                "version-rolling.mask".into(),
                json!(format!("{:08x}", self.version_mask)),
            );
        }
        if capabilities.iter().any(|c| c == "minimum-difficulty") {
            let floor = params
                .get(1)
                .and_then(|v| v.get("minimum-difficulty.value"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            self.vardiff.raise_floor(floor);
            result.insert("minimum-difficulty".into(), json!(true));
        }
        self.respond(StratumResponse::ok(id, Value::Object(result)))
            .await
    }

    async fn on_authorize(&mut self, id: Value, params: &Value) -> bool {
        let Some(username) = params.get(0).and_then(|v| v.as_str()) else {
            return self
                .respond(StratumResponse::err(
                    id,
                    error_code::UNAUTHORIZED,
                    "unauthorized",
                ))
                .await;
        };
        let login = MinerLogin::parse(username);
        let script = match address_to_script(&login.address, &self.shared.net.parent.address) {
            Ok(script) => script,
            Err(_) => {
                info!(address = %login.address, "authorize rejected: bad address");
                return self
                    .respond(StratumResponse::err(
                        id,
                        error_code::UNAUTHORIZED,
                        "unauthorized",
                    ))
                    .await;
            }
        };
        let Some(pubkey_hash) = convertible_pubkey_hash(&script) else {
            info!(address = %login.address, "authorize rejected: script-hash payout");
            return self
                .respond(StratumResponse::err(
                    id,
                    error_code::UNAUTHORIZED,
                    "unauthorized",
                ))
                .await;
        };

        if let Some(diff) = login.starting_difficulty {
            self.vardiff.suggest(diff);
        }
        if let Some(rate) = login.share_rate_secs {
            self.vardiff.set_target_share_secs(rate);
        }
        self.apply_dust_floor().await;

        self.authorized.insert(login.worker_name(), pubkey_hash);
        self.primary_pubkey_hash.get_or_insert(pubkey_hash);
        info!(worker = %login.worker_name(), "worker authorized");
        if !self.respond(StratumResponse::ok(id, json!(true))).await {
            return false;
        }
        self.send_work(true).await
    }

    /// Raise the difficulty floor so per-share payouts clear the dust
    /// threshold under the current PPLNS shape.
    async fn apply_dust_floor(&mut self) {
        let template = match &*self.shared.template_rx.borrow() {
            Some(t) => Arc::clone(t),
            None => return,
        };
        let mut tracker = self.shared.tracker.lock().await;
        let Some(best) = tracker.best_share() else {
            return;
        };
        let Ok(weights) = tracker.cumulative_weights(&best, self.shared.net.chain_length) else {
            return;
        };
        if template.coinbase_value == 0 {
            return;
        }
        // A share worth fewer attempts than this pays out under the dust line
        let needed_attempts = self.shared.net.dust_threshold as f64
            * weights.total_attempts as f64
            / template.coinbase_value as f64;
        let floor = needed_attempts / (u32::MAX as f64);
        if floor > self.vardiff.floor() {
            debug!(floor, "raising connection floor for dust protection");
            self.vardiff.raise_floor(floor);
        }
    }

    async fn on_suggest_difficulty(&mut self, id: Value, params: &Value) -> bool {
        let Some(difficulty) = params.get(0).and_then(|v| v.as_f64()) else {
            return self
                .respond(StratumResponse::err(id, error_code::UNKNOWN, "bad params"))
                .await;
        };
        let applied = self.vardiff.suggest(difficulty);
        if !self.respond(StratumResponse::ok(id, json!(true))).await {
            return false;
        }
        // Resend work at the new difficulty after a short pause so the
        // set_difficulty/notify pair cannot reorder around the response
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        debug!(applied, "suggest_difficulty applied, resending work");
        self.send_work(false).await
    }

    async fn on_submit(&mut self, id: Value, params: &Value) -> bool {
        let now = crate::utils::current_timestamp();
        if !self.check_submit_rate(now) || !self.shared.limits.allow_submit(now) {
            return self.respond(StratumResponse::ok(id, json!(false))).await;
        }

        let worker = params.get(0).and_then(|v| v.as_str()).unwrap_or_default();
        if !self.authorized.contains_key(worker) {
            return self
                .respond(StratumResponse::err(
                    id,
                    error_code::UNAUTHORIZED,
                    "unauthorized",
                ))
                .await;
        }
        let (Some(job_id), Some(en2), Some(ntime), Some(nonce)) = (
            params.get(1).and_then(|v| v.as_str()),
            params
                .get(2)
                .and_then(|v| v.as_str())
                .and_then(|s| hex::decode(s).ok())
                .and_then(|b| <[u8; EXTRANONCE2_SIZE]>::try_from(b.as_slice()).ok()),
            params
                .get(3)
                .and_then(|v| v.as_str())
                .and_then(|s| u32::from_str_radix(s, 16).ok()),
            params
                .get(4)
                .and_then(|v| v.as_str())
                .and_then(|s| u32::from_str_radix(s, 16).ok()),
        ) else {
            return self
                .respond(StratumResponse::err(id, error_code::UNKNOWN, "bad params"))
                .await;
        };
        let version_bits = params
            .get(5)
            .and_then(|v| v.as_str())
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .unwrap_or(0);

        let Some(job) = self.jobs.iter().find(|j| j.id_hex() == job_id).cloned() else {
            // Evicted or never issued here: stale, answered plainly
            return self.respond(StratumResponse::ok(id, json!(false))).await;
        };

        let (classified, coinbase) = {
            let mut workgen = self.shared.workgen.lock().await;
            let classified =
                workgen.classify(&job, &en2, ntime, nonce, version_bits, self.version_mask);
            let coinbase = match &classified {
                Classified::Block { .. } | Classified::Share(_) => {
                    Some(workgen.rebuild_coinbase(&job, &en2))
                }
                _ => None,
            };
            (classified, coinbase)
        };
        match (classified, coinbase) {
            (Classified::Block { block, share }, Some(coinbase)) => {
                info!(worker, "parent block candidate from submission");
                self.note_accept(now).await;
                let _ = self
                    .shared
                    .found_tx
                    .send(FoundWork {
                        share,
                        extranonce2: en2,
                        job_id: job.id,
                        coinbase,
                        block: Some(block),
                    })
                    .await;
                self.respond(StratumResponse::ok(id, json!(true))).await
            }
            (Classified::Share(share), Some(coinbase)) => {
                self.note_accept(now).await;
                let _ = self
                    .shared
                    .found_tx
                    .send(FoundWork {
                        share,
                        extranonce2: en2,
                        job_id: job.id,
                        coinbase,
                        block: None,
                    })
                    .await;
                self.respond(StratumResponse::ok(id, json!(true))).await
            }
            (Classified::Pseudoshare { .. }, _) => {
                self.note_accept(now).await;
                self.respond(StratumResponse::ok(id, json!(true))).await
            }
            (Classified::Stale, _) => {
                self.respond(StratumResponse::ok(id, json!(false))).await
            }
            (Classified::Duplicate, _) => {
                self.respond(StratumResponse::err(
                    id,
                    error_code::DUPLICATE_SHARE,
                    "duplicate",
                ))
                .await
            }
            (Classified::HashAboveTarget, _) => {
                self.respond(StratumResponse::err(
                    id,
                    error_code::LOW_DIFFICULTY,
                    "hash-above-target",
                ))
                .await
            }
            // Qualifying submissions always carry their rebuilt coinbase
            (Classified::Block { .. } | Classified::Share(_), None) => {
                self.respond(StratumResponse::ok(id, json!(false))).await
            }
        }
    }

    /// Vardiff bookkeeping after any accepted submission
    async fn note_accept(&mut self, now: u64) {
        // Dynamic floor: protect the pool when global submit rate runs hot
        if self.shared.limits.above_half_capacity(now) {
            self.vardiff.raise_floor(self.vardiff.current() * 2.0);
        }
        if let Some(new_difficulty) = self.vardiff.on_submission(now as f64) {
            debug!(new_difficulty, "vardiff adjustment");
            let _ = self
                .push(notification("mining.set_difficulty", json!([new_difficulty])))
                .await;
            self.send_work(false).await;
        }
    }

    fn check_submit_rate(&mut self, now: u64) -> bool {
        self.submit_times.push_back(now);
        while let Some(&front) = self.submit_times.front() {
            if now.saturating_sub(front) >= 1 {
                self.submit_times.pop_front();
            } else {
                break;
            }
        }
        self.submit_times.len() <= MAX_SUBMITS_PER_SEC
    }

    /// Build and push a fresh job (set_difficulty then notify, in order)
    pub async fn send_work(&mut self, clean_jobs: bool) -> bool {
        let Some(pubkey_hash) = self.primary_pubkey_hash else {
            return true; // nothing to mine for yet
        };
        let template = match &*self.shared.template_rx.borrow() {
            Some(t) => Arc::clone(t),
            None => return true,
        };

        let pseudo_target = difficulty_to_target(self.vardiff.current());
        let job = {
            let tracker = self.shared.tracker.lock().await;
            let mut workgen = self.shared.workgen.lock().await;
            let request = WorkRequest {
                pubkey_hash,
                extranonce1: self.extranonce1,
                pseudo_target,
            };
            match workgen.make_job(&tracker, &template, &request, clean_jobs) {
                Ok(job) => job,
                Err(e) => {
                    warn!("job assembly failed: {}", e);
                    return true;
                }
            }
        };

        // Advertise the vardiff difficulty; the job's pinned pseudo target is
        // never stricter than it, so miners see no spurious rejections
        let advertised = self.vardiff.current();
        if !self
            .push(notification("mining.set_difficulty", json!([advertised])))
            .await
        {
            return false;
        }
        let params = notify_params(&job);
        self.jobs.push_back(job);
        while self.jobs.len() > JOB_MEMORY {
            self.jobs.pop_front();
        }
        self.push(notification("mining.notify", params)).await
    }

    /// Operator fan-out: banners and reconnect requests
    pub async fn handle_control(&self, message: super::ControlMessage) -> bool {
        match message {
            super::ControlMessage::ShowMessage(text) => {
                self.push(notification("client.show_message", json!([text])))
                    .await
            }
            super::ControlMessage::Reconnect => {
                // The miner reconnects on its own schedule; the session stays
                // cached for resumption
                self.save_session().await;
                self.push(notification("client.reconnect", json!([]))).await
            }
        }
    }

    /// Persist resumable state; called on disconnect
    pub async fn save_session(&self) {
        let mut cache = self.shared.session_cache.lock().await;
        cache.insert(
            self.session_id.clone(),
            self.vardiff.snapshot(crate::utils::current_timestamp()),
        );
    }

    /// Idle vardiff maintenance; called from the connection's ticker
    pub async fn idle_tick(&mut self, now: u64) {
        if let Some(new_difficulty) = self.vardiff.on_idle_check(now as f64) {
            debug!(new_difficulty, "idle halving");
            let _ = self
                .push(notification("mining.set_difficulty", json!([new_difficulty])))
                .await;
            self.send_work(false).await;
        }
    }
}

/// `mining.notify` params for a job
fn notify_params(job: &Job) -> Value {
    json!([
        job.id_hex(),
        prevhash_stratum(&job.previous_block),
        hex::encode(&job.coinb1),
        hex::encode(&job.coinb2),
        job.merkle_branch
            .iter()
            .map(|h| hex::encode(h.0))
            .collect::<Vec<_>>(),
        format!("{:08x}", job.version),
        format!("{:08x}", job.bits),
        format!("{:08x}", job.ntime),
        job.clean_jobs,
    ])
}

/// Stratum's previous-block-hash convention: eight 32-bit words, each
/// rendered big-endian, taken in wire order
fn prevhash_stratum(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for chunk in hash.0.chunks(4) {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.push_str(&format!("{:08x}", word));
    }
    out
}
