//! Variable difficulty controller
//!
//! Tracks submission intervals per connection and steers the pseudoshare
//! difficulty toward one share per target period. Adjustments happen after
//! every third submission; an idle connection that has submitted before is
//! halved once. All difficulty values here are miner-facing numbers.

use std::collections::VecDeque;

/// Pool-level difficulty clamps
#[derive(Debug, Clone)]
pub struct VardiffConfig {
    /// Target seconds between submissions
    pub target_share_secs: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    /// Intervals kept in the rolling window (at least 3)
    pub window: usize,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_share_secs: 10.0,
            min_difficulty: 0.001,
            max_difficulty: 1e6,
            window: 8,
        }
    }
}

/// Per-connection vardiff state
#[derive(Debug, Clone)]
pub struct Vardiff {
    config: VardiffConfig,
    current: f64,
    /// Hard lower bound from BIP310 negotiation or dust protection
    floor: f64,
    /// Miner's `suggest_difficulty`, clamped up to the floor
    suggested: Option<f64>,
    intervals: VecDeque<f64>,
    last_submission: Option<f64>,
    submissions_since_adjust: u32,
    ever_submitted: bool,
    idle_halved: bool,
}

impl Vardiff {
    pub fn new(config: VardiffConfig, starting_difficulty: f64) -> Self {
        let current = starting_difficulty.clamp(config.min_difficulty, config.max_difficulty);
        Self {
            config,
            current,
            floor: 0.0,
            suggested: None,
            intervals: VecDeque::new(),
            last_submission: None,
            submissions_since_adjust: 0,
            ever_submitted: false,
            idle_halved: false,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn config(&self) -> &VardiffConfig {
        &self.config
    }

    pub fn set_target_share_secs(&mut self, secs: f64) {
        if secs > 0.0 {
            self.config.target_share_secs = secs;
        }
    }

    /// Raise the hard floor (BIP310 or dust protection); never lowers it
    pub fn raise_floor(&mut self, floor: f64) {
        if floor > self.floor {
            self.floor = floor;
            if self.current < floor {
                self.current = self.clamp(floor);
            }
        }
    }

    /// Miner suggestion; clamped up to the pool floor and applied directly
    pub fn suggest(&mut self, difficulty: f64) -> f64 {
        let applied = self.clamp(difficulty);
        self.suggested = Some(applied);
        self.current = applied;
        applied
    }

    fn clamp(&self, difficulty: f64) -> f64 {
        difficulty
            .max(self.floor)
            .clamp(self.config.min_difficulty, self.config.max_difficulty)
    }

    /// Record an accepted submission. Returns the new difficulty when an
    /// adjustment fires (every third submission).
    pub fn on_submission(&mut self, now: f64) -> Option<f64> {
        if let Some(last) = self.last_submission {
            let interval = (now - last).max(0.001);
            self.intervals.push_back(interval);
            while self.intervals.len() > self.config.window {
                self.intervals.pop_front();
            }
        }
        self.last_submission = Some(now);
        self.ever_submitted = true;
        self.idle_halved = false;
        self.submissions_since_adjust += 1;
        if self.submissions_since_adjust < 3 || self.intervals.is_empty() {
            return None;
        }
        self.submissions_since_adjust = 0;

        let mean_interval: f64 =
            self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        // measured_rate / target_rate collapses to target_period / mean_interval
        let ratio = (self.config.target_share_secs / mean_interval).clamp(0.1, 10.0);
        let adjusted = self.clamp(self.current * ratio);
        if (adjusted - self.current).abs() / self.current > 0.05 {
            self.current = adjusted;
            Some(adjusted)
        } else {
            None
        }
    }

    /// Idle check: halve once after 3 target periods of silence, but only
    /// for connections that have ever submitted.
    pub fn on_idle_check(&mut self, now: f64) -> Option<f64> {
        if !self.ever_submitted || self.idle_halved {
            return None;
        }
        let last = self.last_submission?;
        if now - last < 3.0 * self.config.target_share_secs {
            return None;
        }
        self.idle_halved = true;
        let halved = self.clamp(self.current / 2.0);
        if halved < self.current {
            self.current = halved;
            Some(halved)
        } else {
            None
        }
    }

    /// State carried across reconnects for session resumption
    pub fn snapshot(&self, now: u64) -> VardiffSnapshot {
        VardiffSnapshot {
            current: self.current,
            floor: self.floor,
            suggested: self.suggested,
            target_share_secs: self.config.target_share_secs,
            saved_at: now,
        }
    }

    pub fn restore(&mut self, snapshot: &VardiffSnapshot) {
        self.config.target_share_secs = snapshot.target_share_secs;
        self.floor = snapshot.floor;
        self.suggested = snapshot.suggested;
        self.current = self.clamp(snapshot.current);
    }
}

/// Resumable vardiff state
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VardiffSnapshot {
    pub current: f64,
    pub floor: f64,
    pub suggested: Option<f64>,
    pub target_share_secs: f64,
    /// When this snapshot was taken; expired sessions are not resumable
    pub saved_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vardiff(start: f64) -> Vardiff {
        Vardiff::new(VardiffConfig::default(), start)
    }

    #[test]
    fn fast_miner_ramps_up() {
        let mut v = vardiff(1.0);
        let mut now = 0.0;
        let mut adjustments = 0;
        // 120 submissions over 10 seconds
        for _ in 0..120 {
            now += 10.0 / 120.0;
            if v.on_submission(now).is_some() {
                adjustments += 1;
            }
        }
        assert!(adjustments >= 1);
        // Within 3 submissions the first adjustment fires; by the end the
        // difficulty has grown at least 4x from the start
        assert!(v.current() >= 4.0, "difficulty {}", v.current());
    }

    #[test]
    fn first_adjustment_within_three_submissions() {
        let mut v = vardiff(100.0);
        assert!(v.on_submission(0.1).is_none());
        assert!(v.on_submission(0.2).is_none());
        assert!(v.on_submission(0.3).is_some());
    }

    #[test]
    fn slow_miner_ramps_down() {
        let mut v = vardiff(100.0);
        let mut now = 0.0;
        for _ in 0..9 {
            now += 100.0; // 10x slower than target
            v.on_submission(now);
        }
        assert!(v.current() < 100.0);
    }

    #[test]
    fn clip_bounds_adjustment() {
        let mut v = vardiff(1.0);
        // Extremely fast submissions: ratio clips at 10x per adjustment
        v.on_submission(0.001);
        v.on_submission(0.002);
        let adjusted = v.on_submission(0.003).unwrap();
        assert!(adjusted <= 10.0 + f64::EPSILON);
    }

    #[test]
    fn idle_halves_once_and_only_after_submitting() {
        let mut v = vardiff(8.0);
        // Never submitted: no idle halving
        assert!(v.on_idle_check(1000.0).is_none());
        v.on_submission(0.0);
        assert!(v.on_idle_check(10.0).is_none()); // not idle yet
        assert_eq!(v.on_idle_check(31.0), Some(4.0));
        assert!(v.on_idle_check(62.0).is_none()); // halves only once
    }

    #[test]
    fn floor_clamps_suggestions() {
        let mut v = vardiff(8.0);
        v.raise_floor(4.0);
        assert_eq!(v.suggest(0.5), 4.0);
        assert_eq!(v.suggest(16.0), 16.0);
    }

    #[test]
    fn snapshot_restores() {
        let mut v = vardiff(8.0);
        v.raise_floor(2.0);
        v.suggest(32.0);
        let snapshot = v.snapshot(0);
        let mut restored = vardiff(1.0);
        restored.restore(&snapshot);
        assert_eq!(restored.current(), 32.0);
        assert_eq!(restored.floor(), 2.0);
    }
}
