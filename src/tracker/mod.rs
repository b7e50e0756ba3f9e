//! Share chain tracker
//!
//! An in-memory forest of shares keyed by share hash. Parent/child edges are
//! plain hashes (no pointer cycles); orphans wait in the forest until their
//! parent arrives. Best-chain selection is strictly by cumulative verified
//! work with the lower share hash breaking ties.

pub mod weights;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::networks::NetworkDescriptor;
use crate::primitives::encode::CodecError;
use crate::primitives::hash::Hash256;
use crate::primitives::target::{
    average_attempts_to_target, compact_to_target, target_to_compact, U256,
};
use crate::share::{Share, ShareIds};

use weights::{gentx_prefix, payout_outputs, GentxContext, WindowWeights};

/// Verification state of a tracked share
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    /// Structurally decoded, invariants not yet checked
    Seen,
    /// All invariants hold; eligible for best-chain selection
    Verified,
    /// On a branch the local node has abandoned
    Doa,
}

/// What happened on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    New,
    Known,
    /// Inserted, but the parent is unknown; backfill is needed
    Orphan,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("share not in tracker")]
    UnknownShare,
    #[error("proof of work above share target")]
    BadPow,
    #[error("generation transaction structure mismatch")]
    BadGentx,
    #[error("share bits violate the retarget rule")]
    BadRetarget,
    #[error("payout outputs disagree with the window")]
    BadPayouts,
    #[error("ancestor missing or unverified")]
    MissingAncestor,
    #[error("height or cumulative work linkage broken")]
    BadLinkage,
}

/// A share plus its tracker metadata
pub struct ShareEntry {
    pub share: Arc<Share>,
    pub ids: ShareIds,
    pub status: ShareStatus,
    pub children: Vec<Hash256>,
    /// Cumulative verified attempts from genesis, set on verification
    pub cumulative_work: u128,
}

/// The share forest
pub struct ShareTracker {
    net: Arc<NetworkDescriptor>,
    entries: HashMap<Hash256, ShareEntry>,
    /// Parent hash -> shares already held that wait for it
    waiting_on_parent: HashMap<Hash256, Vec<Hash256>>,
    best: Option<Hash256>,
    weights_cache: HashMap<(Hash256, u64), Arc<WindowWeights>>,
}

impl ShareTracker {
    pub fn new(net: Arc<NetworkDescriptor>) -> Self {
        Self {
            net,
            entries: HashMap::new(),
            waiting_on_parent: HashMap::new(),
            best: None,
            weights_cache: HashMap::new(),
        }
    }

    pub fn net(&self) -> &NetworkDescriptor {
        &self.net
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &Hash256) -> Option<&ShareEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Current best tip, if any chain has verified work
    pub fn best_share(&self) -> Option<Hash256> {
        self.best
    }

    pub fn best_entry(&self) -> Option<&ShareEntry> {
        self.best.and_then(|h| self.entries.get(&h))
    }

    /// Parents we are missing; the P2P layer turns these into backfill requests
    pub fn missing_parents(&self) -> Vec<Hash256> {
        self.waiting_on_parent.keys().copied().collect()
    }

    /// Insert a codec-accepted share. Never blocks on parent resolution.
    pub fn add(&mut self, share: Share) -> Result<(AddOutcome, Hash256), CodecError> {
        share.sanity_check(&self.net)?;
        let ids = share.ids(&self.net.identifier);
        let hash = ids.hash;
        if self.entries.contains_key(&hash) {
            return Ok((AddOutcome::Known, hash));
        }

        let share = Arc::new(share);
        let children = self.waiting_on_parent.remove(&hash).unwrap_or_default();
        let mut outcome = AddOutcome::New;
        if let Some(parent_hash) = share.info.previous_share_hash {
            if let Some(parent) = self.entries.get_mut(&parent_hash) {
                parent.children.push(hash);
            } else {
                self.waiting_on_parent
                    .entry(parent_hash)
                    .or_default()
                    .push(hash);
                outcome = AddOutcome::Orphan;
            }
        }
        self.entries.insert(
            hash,
            ShareEntry {
                share,
                ids,
                status: ShareStatus::Seen,
                children,
                cumulative_work: 0,
            },
        );
        Ok((outcome, hash))
    }

    /// Check every invariant of a tracked share.
    ///
    /// `context` supplies the template-dependent coinbase outputs; when the
    /// local node has it, payout bytes are checked against the hash link.
    /// Without it the gate is proof of work, linkage, and retarget.
    pub fn verify(
        &mut self,
        hash: &Hash256,
        context: Option<&GentxContext>,
    ) -> Result<(), VerifyError> {
        let entry = self.entries.get(hash).ok_or(VerifyError::UnknownShare)?;
        if entry.status == ShareStatus::Verified {
            return Ok(());
        }
        let share = Arc::clone(&entry.share);
        let ids = entry.ids;
        let attempts = share.work_attempts();

        let parent_cumulative = match share.info.previous_share_hash {
            Some(parent_hash) => {
                let parent = self
                    .entries
                    .get(&parent_hash)
                    .ok_or(VerifyError::MissingAncestor)?;
                if parent.status != ShareStatus::Verified {
                    return Err(VerifyError::MissingAncestor);
                }
                if share.info.absheight != parent.share.info.absheight + 1 {
                    return Err(VerifyError::BadLinkage);
                }
                if share.info.abswork
                    != parent.share.info.abswork.saturating_add(attempts)
                {
                    return Err(VerifyError::BadLinkage);
                }
                self.check_far_share(&share, parent_hash)?;
                let expected =
                    self.expected_bits(Some(parent_hash), share.min_header.bits);
                if share.info.bits != expected
                    && Some(share.info.bits)
                        != self.eased_bits_for_child(parent_hash, share.info.timestamp)
                {
                    return Err(VerifyError::BadRetarget);
                }
                self.entries[&parent_hash].cumulative_work
            }
            None => {
                if share.info.absheight != 1 {
                    return Err(VerifyError::BadLinkage);
                }
                if share.info.abswork != attempts {
                    return Err(VerifyError::BadLinkage);
                }
                let expected = self.expected_bits(None, share.min_header.bits);
                if share.info.bits != expected {
                    return Err(VerifyError::BadRetarget);
                }
                0
            }
        };

        // PoW gate under the parent chain's digest
        let pow = share.pow_hash(&self.net, &ids);
        if crate::primitives::target::hash_to_u256(&pow) > share.target() {
            return Err(VerifyError::BadPow);
        }

        if let Some(context) = context {
            self.check_payout_commitment(&share, context)?;
        }

        let cumulative = parent_cumulative.saturating_add(attempts);
        let entry = self.entries.get_mut(hash).expect("entry present");
        entry.status = ShareStatus::Verified;
        entry.cumulative_work = cumulative;
        self.maybe_update_best(*hash, cumulative);
        Ok(())
    }

    /// Rebuild the consensus payout section and compare against the midstate
    fn check_payout_commitment(
        &self,
        share: &Share,
        context: &GentxContext,
    ) -> Result<(), VerifyError> {
        let window = self.window_for(share)?;
        let outputs = payout_outputs(&self.net, share.info.subsidy, &window)
            .map_err(|_| VerifyError::BadPayouts)?;
        let mut script = share.info.coinbase.to_vec();
        script.extend_from_slice(&context.scriptsig_tail);
        let prefix = gentx_prefix(&script, context, &outputs);
        if prefix.len() as u64 != share.hash_link.length {
            return Err(VerifyError::BadGentx);
        }
        if crate::share::HashLink::from_prefix(&prefix) != share.hash_link {
            return Err(VerifyError::BadPayouts);
        }
        Ok(())
    }

    /// PPLNS window ending at a share that may not be tracked yet
    fn window_for(&self, share: &Share) -> Result<Vec<Arc<Share>>, VerifyError> {
        let mut window = match share.info.previous_share_hash {
            Some(parent) => self.chain(&parent, self.net.chain_length - 1)?,
            None => Vec::new(),
        };
        window.push(Arc::new(share.clone()));
        Ok(window)
    }

    /// Far-share reference a child of `parent` must carry
    pub fn far_share_for_child(
        &self,
        parent: Option<Hash256>,
    ) -> Result<Option<Hash256>, VerifyError> {
        let Some(parent_hash) = parent else {
            return Ok(None);
        };
        let distance = self.net.target_lookbehind;
        let (chain, reached_genesis) = self.walk(parent_hash, distance);
        if (chain.len() as u64) < distance {
            if reached_genesis {
                Ok(None)
            } else {
                Err(VerifyError::MissingAncestor)
            }
        } else {
            Ok(Some(chain.last().expect("nonempty walk").ids.hash))
        }
    }

    /// The far-share reference must land on the ancestor one lookbehind away
    fn check_far_share(&self, share: &Share, parent_hash: Hash256) -> Result<(), VerifyError> {
        let distance = self.net.target_lookbehind;
        let (chain, reached_genesis) = self.walk(parent_hash, distance);
        if (chain.len() as u64) < distance {
            if !reached_genesis {
                return Err(VerifyError::MissingAncestor);
            }
            // Short chain: no reference required yet
            if share.info.far_share_hash.is_some() {
                return Err(VerifyError::BadLinkage);
            }
            return Ok(());
        }
        let far = chain.last().expect("nonempty walk");
        if share.info.far_share_hash != Some(far.ids.hash) {
            return Err(VerifyError::BadLinkage);
        }
        Ok(())
    }

    fn maybe_update_best(&mut self, hash: Hash256, cumulative: u128) {
        let better = match self.best {
            None => true,
            Some(best_hash) => {
                let best = &self.entries[&best_hash];
                cumulative > best.cumulative_work
                    || (cumulative == best.cumulative_work && hash < best_hash)
            }
        };
        if better {
            debug!(tip = %hash, work = cumulative, "best share advanced");
            self.best = Some(hash);
        }
    }

    /// Walk back from `tip` (inclusive), newest first, up to `n` entries
    fn walk(&self, tip: Hash256, n: u64) -> (Vec<&ShareEntry>, bool) {
        let mut out = Vec::new();
        let mut cursor = Some(tip);
        let mut reached_genesis = false;
        while let Some(hash) = cursor {
            if out.len() as u64 >= n {
                return (out, reached_genesis);
            }
            match self.entries.get(&hash) {
                Some(entry) => {
                    cursor = entry.share.info.previous_share_hash;
                    if cursor.is_none() {
                        reached_genesis = true;
                    }
                    out.push(entry);
                }
                None => return (out, false),
            }
        }
        (out, reached_genesis)
    }

    /// The last `n` shares ending at `tip`, oldest first.
    ///
    /// A chain cut short by genesis is fine; a chain cut short by a missing
    /// ancestor is `MissingAncestor`.
    pub fn chain(&self, tip: &Hash256, n: u64) -> Result<Vec<Arc<Share>>, VerifyError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if !self.entries.contains_key(tip) {
            return Err(VerifyError::UnknownShare);
        }
        let (walked, reached_genesis) = self.walk(*tip, n);
        if (walked.len() as u64) < n && !reached_genesis {
            return Err(VerifyError::MissingAncestor);
        }
        let mut shares: Vec<Arc<Share>> =
            walked.into_iter().map(|e| Arc::clone(&e.share)).collect();
        shares.reverse();
        Ok(shares)
    }

    /// Deepest common ancestor of two tips, if they share one
    pub fn common_ancestor(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let mut seen = std::collections::HashSet::new();
        let mut cursor = Some(*a);
        while let Some(hash) = cursor {
            seen.insert(hash);
            cursor = self
                .entries
                .get(&hash)
                .and_then(|e| e.share.info.previous_share_hash);
        }
        let mut cursor = Some(*b);
        while let Some(hash) = cursor {
            if seen.contains(&hash) {
                return Some(hash);
            }
            cursor = self
                .entries
                .get(&hash)
                .and_then(|e| e.share.info.previous_share_hash);
        }
        None
    }

    /// Cached PPLNS weights over the window ending at `tip`
    pub fn cumulative_weights(
        &mut self,
        tip: &Hash256,
        n: u64,
    ) -> Result<Arc<WindowWeights>, VerifyError> {
        if let Some(cached) = self.weights_cache.get(&(*tip, n)) {
            return Ok(Arc::clone(cached));
        }
        let window = self.chain(tip, n)?;
        let weights = weights::pplns_weights(&window).map_err(|_| VerifyError::BadPayouts)?;
        let weights = Arc::new(weights);
        self.weights_cache.insert((*tip, n), Arc::clone(&weights));
        Ok(weights)
    }

    /// Distribution of `desired_version` across the window, for upgrade votes
    pub fn get_desired_versions(
        &self,
        tip: &Hash256,
        n: u64,
    ) -> Result<HashMap<u16, u64>, VerifyError> {
        let window = self.chain(tip, n)?;
        let mut tally = HashMap::new();
        for share in window {
            *tally.entry(share.info.desired_version).or_insert(0) += 1;
        }
        Ok(tally)
    }

    /// Share bits the retarget rule demands for a child of `parent`.
    ///
    /// `parent_block_bits` is the parent-chain target the new share claims in
    /// its header; it bounds share difficulty to parent difficulty / spread.
    pub fn expected_bits(&self, parent: Option<Hash256>, parent_block_bits: u32) -> u32 {
        let Some(parent_hash) = parent else {
            return self.net.max_target_bits;
        };
        let Some(parent_entry) = self.entries.get(&parent_hash) else {
            return self.net.max_target_bits;
        };
        let (window, _) = self.walk(parent_hash, self.net.target_lookbehind);
        if window.len() < 2 {
            return parent_entry.share.info.bits;
        }
        let newest_ts = window.first().expect("nonempty").share.info.timestamp as u64;
        let oldest_ts = window.last().expect("nonempty").share.info.timestamp as u64;
        let elapsed = newest_ts.saturating_sub(oldest_ts).max(1) as u128;
        // Work across the intervals between the window's shares
        let total_attempts: u128 = window[..window.len() - 1]
            .iter()
            .map(|e| e.share.work_attempts())
            .fold(0u128, |acc, a| acc.saturating_add(a));
        let desired_attempts =
            (total_attempts / elapsed).saturating_mul(self.net.share_period_secs as u128)
                + (total_attempts % elapsed) * self.net.share_period_secs as u128 / elapsed;
        let raw = if desired_attempts == 0 {
            self.net.max_target()
        } else {
            average_attempts_to_target(U256::from(desired_attempts))
        };
        let bounded = bound_share_target(&self.net, raw, parent_block_bits);
        target_to_compact(bounded)
    }

    /// Emergency time-decay easing: once no share has arrived for 20 share
    /// periods, the target doubles per further silent window, toward the
    /// maximum. Derived purely from committed timestamps, so a producer
    /// easing its emitted bits and a verifier checking them agree.
    pub fn eased_bits_for_child(
        &self,
        parent_hash: Hash256,
        child_timestamp: u32,
    ) -> Option<u32> {
        let parent = self.entries.get(&parent_hash)?;
        let silent = (child_timestamp as u64).saturating_sub(parent.share.info.timestamp as u64);
        let threshold = 20 * self.net.share_period_secs;
        if silent < threshold {
            return None;
        }
        let steps = (silent / threshold).min(128) as usize;
        let parent_target = parent.share.target();
        let eased = parent_target << steps;
        let eased = if eased > self.net.max_target() || (eased >> steps) != parent_target {
            self.net.max_target()
        } else {
            eased
        };
        Some(target_to_compact(eased))
    }

    /// Easing applied to the best tip, for work generation against a clock
    pub fn emergency_target_ease(&self, now: u64) -> Option<U256> {
        let best = self.best_share()?;
        self.eased_bits_for_child(best, now.min(u32::MAX as u64) as u32)
            .map(compact_to_target)
    }

    /// Drop shares beyond the retention window behind the best tip, plus
    /// dead branches hanging off abandoned parents.
    pub fn prune(&mut self) -> usize {
        let Some(best) = self.best_entry() else {
            return 0;
        };
        let cutoff = best
            .share
            .info
            .absheight
            .saturating_sub(self.net.real_chain_length as u32);
        let doomed: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(_, e)| e.share.info.absheight < cutoff)
            .map(|(h, _)| *h)
            .collect();
        for hash in &doomed {
            if let Some(entry) = self.entries.remove(hash) {
                if let Some(parent) = entry.share.info.previous_share_hash {
                    if let Some(parent_entry) = self.entries.get_mut(&parent) {
                        parent_entry.children.retain(|c| c != hash);
                    }
                    self.waiting_on_parent.remove(&parent);
                }
            }
        }
        if !doomed.is_empty() {
            self.weights_cache.clear();
            debug!(count = doomed.len(), "pruned shares behind retention window");
        }
        doomed.len()
    }

    /// Mark a branch dead-on-arrival (its chain lost to the best chain)
    pub fn mark_doa(&mut self, hash: &Hash256) {
        let mut stack = vec![*hash];
        while let Some(h) = stack.pop() {
            if let Some(entry) = self.entries.get_mut(&h) {
                if entry.status != ShareStatus::Verified {
                    entry.status = ShareStatus::Doa;
                }
                stack.extend(entry.children.iter().copied());
            }
        }
    }

    /// All shares, for persistence
    pub fn all_shares(&self) -> Vec<Arc<Share>> {
        let mut shares: Vec<&ShareEntry> = self.entries.values().collect();
        shares.sort_by_key(|e| e.share.info.absheight);
        shares.iter().map(|e| Arc::clone(&e.share)).collect()
    }
}

/// Clamp a raw retarget result into the share-target bounds and the
/// parent-difficulty spread floor.
fn bound_share_target(net: &NetworkDescriptor, raw: U256, parent_block_bits: u32) -> U256 {
    let parent_target = compact_to_target(parent_block_bits);
    // Share difficulty may not exceed parent difficulty / spread
    let (floor, overflow) = parent_target.overflowing_mul(U256::from(net.spread));
    let floor = if overflow { U256::MAX } else { floor };
    let mut target = raw.max(floor);
    if target < net.min_target() {
        target = net.min_target();
    }
    if target > net.max_target() {
        target = net.max_target();
    }
    target
}
