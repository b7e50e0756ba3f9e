//! Block-template ingestion and polling
//!
//! Parses `getblocktemplate` results into the shape the work generator
//! consumes, tolerating transactions that refuse structured decode (MWEB
//! HogEx and other extension payloads ride along as opaque bytes). The
//! poller refreshes once a second and publishes snapshots over a watch
//! channel; templates older than a minute are flagged stale.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::networks::NetworkDescriptor;
use crate::primitives::hash::Hash256;
use crate::primitives::target::{compact_to_target, U256};
use crate::primitives::tx::{RawTransaction, TxOut};
use crate::utils::current_timestamp;

use super::client::ParentRpcClient;
use super::known_txs::KnownTxs;

/// A template is too old to mine on after this many seconds
pub const TEMPLATE_STALE_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template field missing or mistyped: {0}")]
    BadField(&'static str),
}

/// One transaction from the template
#[derive(Debug, Clone)]
pub struct TemplateTx {
    /// Txid as reported by the parent node
    pub hash: Hash256,
    pub fee: u64,
    pub raw: RawTransaction,
}

/// Parsed work context from the parent node
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub previous_block: Hash256,
    pub height: u32,
    /// Subsidy plus fees available to the coinbase
    pub coinbase_value: u64,
    pub bits: u32,
    pub version: i32,
    pub curtime: u32,
    pub transactions: Vec<TemplateTx>,
    /// Chain-mandated coinbase outputs (masternode, treasury, superblock)
    pub obligations: Vec<TxOut>,
    /// Witness-commitment output script, when the template demands one
    pub witness_commitment: Option<Bytes>,
    /// Local clock at fetch time
    pub fetched_at: u64,
}

impl BlockTemplate {
    pub fn parent_target(&self) -> U256 {
        compact_to_target(self.bits)
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.fetched_at) > TEMPLATE_STALE_SECS
    }

    /// Txids in template order (the coinbase slot excluded)
    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|t| t.hash).collect()
    }

    /// Parse a `getblocktemplate` result
    pub fn parse(value: &Value, now: u64) -> Result<Self, TemplateError> {
        let obj = value.as_object().ok_or(TemplateError::BadField("root"))?;
        let previous_block = obj
            .get("previousblockhash")
            .and_then(|v| v.as_str())
            .and_then(Hash256::from_hex)
            .ok_or(TemplateError::BadField("previousblockhash"))?;
        let height = obj
            .get("height")
            .and_then(|v| v.as_u64())
            .ok_or(TemplateError::BadField("height"))? as u32;
        let coinbase_value = obj
            .get("coinbasevalue")
            .and_then(|v| v.as_u64())
            .ok_or(TemplateError::BadField("coinbasevalue"))?;
        let bits = obj
            .get("bits")
            .and_then(|v| v.as_str())
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or(TemplateError::BadField("bits"))?;
        let version = obj
            .get("version")
            .and_then(|v| v.as_i64())
            .ok_or(TemplateError::BadField("version"))? as i32;
        let curtime = obj
            .get("curtime")
            .and_then(|v| v.as_u64())
            .ok_or(TemplateError::BadField("curtime"))? as u32;

        let mut transactions = Vec::new();
        if let Some(entries) = obj.get("transactions").and_then(|v| v.as_array()) {
            for entry in entries {
                let data = entry
                    .get("data")
                    .and_then(|v| v.as_str())
                    .ok_or(TemplateError::BadField("transaction data"))?;
                let bytes = hex::decode(data)
                    .map_err(|_| TemplateError::BadField("transaction hex"))?;
                let hash = entry
                    .get("txid")
                    .or_else(|| entry.get("hash"))
                    .and_then(|v| v.as_str())
                    .and_then(Hash256::from_hex)
                    .ok_or(TemplateError::BadField("transaction hash"))?;
                let fee = entry.get("fee").and_then(|v| v.as_u64()).unwrap_or(0);
                let raw = RawTransaction::parse(Bytes::from(bytes));
                if raw.is_opaque() {
                    debug!(txid = %hash, "template transaction kept as opaque bytes");
                }
                transactions.push(TemplateTx { hash, fee, raw });
            }
        }

        let mut obligations = Vec::new();
        for key in ["masternode", "treasury", "platform", "superblock"] {
            if let Some(entries) = obj.get(key).and_then(|v| v.as_array()) {
                for entry in entries {
                    let script = entry
                        .get("script")
                        .and_then(|v| v.as_str())
                        .and_then(|s| hex::decode(s).ok())
                        .ok_or(TemplateError::BadField("obligation script"))?;
                    let amount = entry
                        .get("amount")
                        .and_then(|v| v.as_u64())
                        .ok_or(TemplateError::BadField("obligation amount"))?;
                    obligations.push(TxOut {
                        value: amount,
                        script_pubkey: Bytes::from(script),
                    });
                }
            }
        }

        let witness_commitment = obj
            .get("default_witness_commitment")
            .and_then(|v| v.as_str())
            .and_then(|s| hex::decode(s).ok())
            .map(Bytes::from);

        Ok(BlockTemplate {
            previous_block,
            height,
            coinbase_value,
            bits,
            version,
            curtime,
            transactions,
            obligations,
            witness_commitment,
            fetched_at: now,
        })
    }
}

/// Periodic template refresh, publishing snapshots over a watch channel
pub struct TemplatePoller {
    client: Arc<ParentRpcClient>,
    net: Arc<NetworkDescriptor>,
    sender: watch::Sender<Option<Arc<BlockTemplate>>>,
    known_txs: Arc<tokio::sync::Mutex<KnownTxs>>,
}

impl TemplatePoller {
    pub fn new(
        client: Arc<ParentRpcClient>,
        net: Arc<NetworkDescriptor>,
        known_txs: Arc<tokio::sync::Mutex<KnownTxs>>,
    ) -> (Self, watch::Receiver<Option<Arc<BlockTemplate>>>) {
        let (sender, receiver) = watch::channel(None);
        (
            Self {
                client,
                net,
                sender,
                known_txs,
            },
            receiver,
        )
    }

    /// Fetch once; publish when the work context changed
    pub async fn refresh(&self) -> Result<(), super::client::RpcError> {
        let raw = self
            .client
            .get_block_template(self.net.parent.required_softforks)
            .await?;
        let now = current_timestamp();
        let template = match BlockTemplate::parse(&raw, now) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!("unusable block template: {}", e);
                return Ok(());
            }
        };

        {
            let mut known = self.known_txs.lock().await;
            for tx in &template.transactions {
                known.insert(tx.hash, tx.raw.raw_bytes(), now);
            }
        }

        let changed = match &*self.sender.borrow() {
            None => true,
            Some(current) => {
                current.previous_block != template.previous_block
                    || current.transactions.len() != template.transactions.len()
                    || current.coinbase_value != template.coinbase_value
            }
        };
        if changed {
            info!(
                height = template.height,
                txs = template.transactions.len(),
                value = template.coinbase_value,
                "new block template"
            );
            let _ = self.sender.send(Some(template));
        }
        Ok(())
    }

    /// Poll forever; transient RPC failures back off inside the client
    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.refresh().await {
                warn!("template refresh failed: {}", e);
            }
        }
    }
}
