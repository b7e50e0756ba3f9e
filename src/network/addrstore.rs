//! Known peer address store
//!
//! Addresses learned from `addrs` gossip and successful connections, with
//! freshness tracking for the peer cache and for answering `getaddrs`.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::network::protocol::PeerAddr;

/// One stored address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressEntry {
    pub addr: SocketAddr,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Last time an outbound connection to it completed a handshake
    pub last_success: Option<u64>,
}

/// Address database
pub struct AddrStore {
    addresses: HashMap<SocketAddr, AddressEntry>,
    max_addresses: usize,
    expiry_secs: u64,
}

impl AddrStore {
    pub fn new(max_addresses: usize, expiry_secs: u64) -> Self {
        Self {
            addresses: HashMap::new(),
            max_addresses,
            expiry_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Record a gossiped or observed address
    pub fn note(&mut self, addr: SocketAddr, now: u64) {
        match self.addresses.get_mut(&addr) {
            Some(entry) => entry.last_seen = now,
            None => {
                if self.addresses.len() >= self.max_addresses {
                    self.evict_stalest();
                }
                self.addresses.insert(
                    addr,
                    AddressEntry {
                        addr,
                        first_seen: now,
                        last_seen: now,
                        last_success: None,
                    },
                );
            }
        }
    }

    /// Record a completed handshake
    pub fn note_success(&mut self, addr: SocketAddr, now: u64) {
        self.note(addr, now);
        if let Some(entry) = self.addresses.get_mut(&addr) {
            entry.last_success = Some(now);
        }
    }

    /// Fresh addresses for `addrs` replies and dialing, newest first
    pub fn fresh(&self, now: u64, limit: usize) -> Vec<PeerAddr> {
        let cutoff = now.saturating_sub(self.expiry_secs);
        let mut fresh: Vec<&AddressEntry> = self
            .addresses
            .values()
            .filter(|e| e.last_seen >= cutoff)
            .collect();
        fresh.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        fresh
            .into_iter()
            .take(limit)
            .map(|e| PeerAddr {
                timestamp: e.last_seen,
                addr: e.addr,
            })
            .collect()
    }

    /// Entries to persist across restarts (only ones that ever worked)
    pub fn persistable(&self) -> Vec<AddressEntry> {
        let mut out: Vec<AddressEntry> = self
            .addresses
            .values()
            .filter(|e| e.last_success.is_some())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_success.cmp(&a.last_success));
        out
    }

    /// Restore from the peer cache
    pub fn restore(&mut self, entries: Vec<AddressEntry>) {
        for entry in entries {
            self.addresses.entry(entry.addr).or_insert(entry);
        }
    }

    fn evict_stalest(&mut self) {
        if let Some(stalest) = self
            .addresses
            .values()
            .min_by_key(|e| e.last_seen)
            .map(|e| e.addr)
        {
            self.addresses.remove(&stalest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:7903", n).parse().unwrap()
    }

    #[test]
    fn fresh_filters_and_sorts() {
        let mut store = AddrStore::new(100, 3600);
        store.note(addr(1), 100);
        store.note(addr(2), 5000);
        store.note(addr(3), 6000);
        let fresh = store.fresh(6100, 10);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].addr, addr(3));
    }

    #[test]
    fn capacity_evicts_stalest() {
        let mut store = AddrStore::new(2, 3600);
        store.note(addr(1), 1);
        store.note(addr(2), 2);
        store.note(addr(3), 3);
        assert_eq!(store.len(), 2);
        assert!(store.fresh(3, 10).iter().all(|a| a.addr != addr(1)));
    }

    #[test]
    fn only_successful_addresses_persist() {
        let mut store = AddrStore::new(10, 3600);
        store.note(addr(1), 1);
        store.note_success(addr(2), 2);
        let persisted = store.persistable();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].addr, addr(2));
    }
}
