//! Per-host ban scoring with decay
//!
//! One map keyed by host: a floating score that decays linearly over time
//! and a ban horizon once the threshold is crossed. The decay interval is
//! configuration, not a constant.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::warn;

/// Score penalties by offence class
pub mod penalty {
    /// Undecodable frame or payload
    pub const MALFORMED: f64 = 10.0;
    /// Share that fails verification
    pub const BAD_SHARE: f64 = 25.0;
    /// Reply nobody asked for
    pub const UNSOLICITED: f64 = 5.0;
    /// Legacy inline-tx reference we cannot resolve
    pub const UNKNOWN_TX_REF: f64 = 50.0;
}

#[derive(Debug, Clone)]
struct BanEntry {
    score: f64,
    last_decay: u64,
    banned_until: Option<u64>,
}

/// Ban bookkeeping for every remote host
pub struct BanTracker {
    entries: HashMap<IpAddr, BanEntry>,
    /// Score at which a host is refused connections
    threshold: f64,
    /// Seconds per unit of score decay
    decay_interval_secs: u64,
    /// Refusal period once banned
    cooldown_secs: u64,
}

impl BanTracker {
    pub fn new(threshold: f64, decay_interval_secs: u64, cooldown_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            threshold,
            decay_interval_secs,
            cooldown_secs,
        }
    }

    /// Apply decay for elapsed time, then add the penalty; bans when the
    /// threshold is crossed.
    pub fn penalize(&mut self, host: IpAddr, amount: f64, now: u64) {
        let entry = self.entries.entry(host).or_insert(BanEntry {
            score: 0.0,
            last_decay: now,
            banned_until: None,
        });
        decay_entry(entry, self.decay_interval_secs, now);
        entry.score += amount;
        if entry.score >= self.threshold && entry.banned_until.is_none() {
            warn!(%host, score = entry.score, "host banned");
            entry.banned_until = Some(now + self.cooldown_secs);
        }
    }

    /// Whether new connections from this host are refused
    pub fn is_banned(&mut self, host: IpAddr, now: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&host) else {
            return false;
        };
        if let Some(until) = entry.banned_until {
            if now < until {
                return true;
            }
            // Cooldown over; score restarts from zero
            entry.banned_until = None;
            entry.score = 0.0;
            entry.last_decay = now;
        }
        false
    }

    pub fn score(&self, host: IpAddr) -> f64 {
        self.entries.get(&host).map(|e| e.score).unwrap_or(0.0)
    }

    /// Periodic maintenance: decay all scores, drop clean entries
    pub fn decay_tick(&mut self, now: u64) {
        let interval = self.decay_interval_secs;
        for entry in self.entries.values_mut() {
            decay_entry(entry, interval, now);
        }
        self.entries
            .retain(|_, e| e.score > 0.0 || e.banned_until.is_some());
    }
}

fn decay_entry(entry: &mut BanEntry, interval_secs: u64, now: u64) {
    if interval_secs == 0 {
        return;
    }
    let elapsed = now.saturating_sub(entry.last_decay);
    let units = (elapsed / interval_secs) as f64;
    if units > 0.0 {
        entry.score = (entry.score - units).max(0.0);
        entry.last_decay = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn threshold_bans_and_cooldown_expires() {
        let mut bans = BanTracker::new(100.0, 60, 600);
        for _ in 0..4 {
            bans.penalize(host(), penalty::BAD_SHARE, 1000);
        }
        assert!(bans.is_banned(host(), 1001));
        assert!(bans.is_banned(host(), 1599));
        assert!(!bans.is_banned(host(), 1601));
        assert_eq!(bans.score(host()), 0.0);
    }

    #[test]
    fn score_decays_over_time() {
        let mut bans = BanTracker::new(100.0, 60, 600);
        bans.penalize(host(), 10.0, 0);
        bans.decay_tick(60 * 4);
        assert_eq!(bans.score(host()), 6.0);
        bans.decay_tick(60 * 100);
        assert_eq!(bans.score(host()), 0.0);
        assert!(!bans.is_banned(host(), 60 * 100));
    }

    #[test]
    fn below_threshold_never_bans() {
        let mut bans = BanTracker::new(100.0, 60, 600);
        bans.penalize(host(), penalty::UNSOLICITED, 0);
        assert!(!bans.is_banned(host(), 1));
    }
}
