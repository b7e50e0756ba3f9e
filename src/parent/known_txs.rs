//! Known-transaction table
//!
//! Raw transaction bytes by txid, fed from block templates, peer gossip, and
//! direct `getrawtransaction` lookups. Bounded by total bytes and by age
//! since last reference; a background task calls `trim` periodically.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::primitives::hash::Hash256;

struct TxRecord {
    bytes: Bytes,
    last_ref: u64,
}

/// Byte- and age-bounded transaction cache
pub struct KnownTxs {
    map: HashMap<Hash256, TxRecord>,
    total_bytes: usize,
    max_bytes: usize,
    max_age_secs: u64,
}

impl KnownTxs {
    /// Default retention: 5 minutes since last reference, 256 MiB ceiling
    pub fn new() -> Self {
        Self::with_limits(256 * 1024 * 1024, 300)
    }

    pub fn with_limits(max_bytes: usize, max_age_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            max_age_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.map.contains_key(hash)
    }

    pub fn insert(&mut self, hash: Hash256, bytes: Bytes, now: u64) {
        if let Some(existing) = self.map.get_mut(&hash) {
            existing.last_ref = now;
            return;
        }
        self.total_bytes += bytes.len();
        self.map.insert(
            hash,
            TxRecord {
                bytes,
                last_ref: now,
            },
        );
    }

    /// Fetch and refresh the reference clock
    pub fn get(&mut self, hash: &Hash256, now: u64) -> Option<Bytes> {
        let record = self.map.get_mut(hash)?;
        record.last_ref = now;
        Some(record.bytes.clone())
    }

    /// Fetch without touching the reference clock
    pub fn peek(&self, hash: &Hash256) -> Option<Bytes> {
        self.map.get(hash).map(|r| r.bytes.clone())
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Bytes> {
        let record = self.map.remove(hash)?;
        self.total_bytes -= record.bytes.len();
        Some(record.bytes)
    }

    pub fn hashes(&self) -> Vec<Hash256> {
        self.map.keys().copied().collect()
    }

    /// Evict expired entries, then oldest-first until under the byte ceiling
    pub fn trim(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.max_age_secs);
        let expired: Vec<Hash256> = self
            .map
            .iter()
            .filter(|(_, r)| r.last_ref < cutoff)
            .map(|(h, _)| *h)
            .collect();
        let mut evicted = expired.len();
        for hash in expired {
            self.remove(&hash);
        }
        while self.total_bytes > self.max_bytes {
            let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, r)| r.last_ref)
                .map(|(h, _)| *h)
            else {
                break;
            };
            self.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.map.len(), "trimmed known transactions");
        }
        evicted
    }
}

impl Default for KnownTxs {
    fn default() -> Self {
        Self::new()
    }
}
