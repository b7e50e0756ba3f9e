//! Work generation and submission classification
//!
//! Builds miner jobs from a `(best share, block template)` snapshot and
//! routes submissions back: parent block, share, pseudoshare, or rejection.
//! A job pins its share target and its gentx byte split at issuance, so
//! vardiff moves and template churn never invalidate in-flight submissions
//! retroactively.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::networks::NetworkDescriptor;
use crate::parent::BlockTemplate;
use crate::primitives::block::{encode_bip34_height, Block, BlockHeader, MergedMiningData};
use crate::primitives::hash::{hash256, Hash256};
use crate::primitives::merkle::{apply_merkle_branch, merkle_branch};
use crate::primitives::target::{hash_to_u256, U256};
use crate::primitives::tx::{Transaction, TxOut};
use crate::share::{
    HashLink, MergedAddress, MinHeader, Share, ShareInfo, ShareVersion, StaleInfo,
};
use crate::tracker::weights::{build_gentx, payout_outputs, GentxContext};
use crate::tracker::{ShareTracker, VerifyError};

/// Pool tag placed in the coinbase scriptSig
const COINBASE_TAG: &[u8] = b"/peerpool/";

/// Bytes of miner-rolled extranonce2
pub const EXTRANONCE2_SIZE: usize = 4;

/// Length of the constant gentx tail after the hash-link prefix:
/// reference output (value, script length, OP_RETURN, PUSH32, hash) + lock time
const GENTX_TAIL_LEN: usize = 8 + 1 + 2 + 32 + 4;

/// Template switches tolerated before a job is stale
pub const STALE_EVENT_TOLERANCE: u64 = 3;
/// Relaxed tolerance for peerless solo operation
pub const STALE_EVENT_TOLERANCE_SOLO: u64 = 30;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("no block template available")]
    NoTemplate,
    #[error("share chain error: {0}")]
    Chain(#[from] VerifyError),
    #[error("payouts unbuildable: {0}")]
    Payout(#[from] crate::tracker::weights::PayoutError),
}

/// Per-miner inputs to job assembly
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub pubkey_hash: [u8; 20],
    pub extranonce1: [u8; 4],
    /// Vardiff target for pseudoshare accounting; clamped to the share target
    pub pseudo_target: U256,
}

/// Everything needed to rebuild a share from a submission
#[derive(Clone)]
pub struct ShareSkeleton {
    pub version: ShareVersion,
    /// Fully populated except that `coinbase` excludes extranonce2
    pub info: ShareInfo,
    pub context: GentxContext,
    pub consensus_outputs: Vec<TxOut>,
    pub template: Arc<BlockTemplate>,
    /// New-work counter at issuance, for staleness
    pub issued_at_event: u64,
}

/// A job handed to a Stratum connection
#[derive(Clone)]
pub struct Job {
    pub id: u32,
    pub version: i32,
    pub previous_block: Hash256,
    pub bits: u32,
    pub ntime: u32,
    /// Gentx serialization up to the extranonce2 insertion point
    pub coinb1: Bytes,
    /// Gentx serialization after extranonce2
    pub coinb2: Bytes,
    pub merkle_branch: Vec<Hash256>,
    /// Consensus share target, pinned for this job's lifetime
    pub share_target: U256,
    /// Vardiff (pseudoshare) target, pinned for this job's lifetime
    pub pseudo_target: U256,
    pub clean_jobs: bool,
    pub skeleton: ShareSkeleton,
}

impl Job {
    pub fn id_hex(&self) -> String {
        format!("{:08x}", self.id)
    }
}

/// Outcome of a classified submission
pub enum Classified {
    /// Parent block found: submit the block, then treat as a share too
    Block { block: Box<Block>, share: Share },
    Share(Share),
    /// Met only the vardiff target; accounting only
    Pseudoshare { difficulty: f64 },
    Stale,
    Duplicate,
    /// Above every target
    HashAboveTarget,
}

/// The work generator
pub struct WorkGenerator {
    net: Arc<NetworkDescriptor>,
    /// Share version new local shares are produced as
    pub share_version: ShareVersion,
    /// Voted next version
    pub desired_version: u16,
    /// Donation permille applied to locally produced shares
    pub donation: u16,
    /// Merged payout destinations carried in V36+ shares
    pub merged_addresses: Vec<MergedAddress>,
    /// Current merged-mining commitment, when aux chains are active
    pub merged_commitment: Option<MergedMiningData>,
    solo: bool,
    job_counter: u32,
    new_work_events: u64,
    recent_submissions: HashSet<(u32, [u8; 4], u32, u32)>,
}

impl WorkGenerator {
    pub fn new(net: Arc<NetworkDescriptor>, donation: u16, solo: bool) -> Self {
        Self {
            net,
            share_version: ShareVersion::V36,
            desired_version: ShareVersion::V36.as_u16(),
            donation,
            merged_addresses: Vec::new(),
            merged_commitment: None,
            solo,
            job_counter: 0,
            new_work_events: 0,
            recent_submissions: HashSet::new(),
        }
    }

    /// Record a best-share or template change; stale-job accounting keys off this
    pub fn note_new_work(&mut self) {
        self.new_work_events += 1;
        self.recent_submissions.clear();
    }

    pub fn new_work_events(&self) -> u64 {
        self.new_work_events
    }

    /// The coinbase scriptSig prefix: BIP34 height, merged-mining marker,
    /// pool tag, extranonce1. Extranonce2 is appended by the miner.
    fn coinbase_prefix(&self, height: u32, extranonce1: &[u8; 4]) -> Vec<u8> {
        let mut script = encode_bip34_height(height);
        if let Some(commitment) = &self.merged_commitment {
            script.extend_from_slice(&commitment.to_bytes());
        }
        script.extend_from_slice(COINBASE_TAG);
        script.extend_from_slice(extranonce1);
        script
    }

    /// Assemble a job for one miner from the current snapshot
    pub fn make_job(
        &mut self,
        tracker: &ShareTracker,
        template: &Arc<BlockTemplate>,
        request: &WorkRequest,
        clean_jobs: bool,
    ) -> Result<Job, WorkError> {
        let best = tracker.best_share();
        let mut bits = tracker.expected_bits(best, template.bits);
        // Emergency time-decay hook: ease the emitted target when the chain
        // has stalled; verification accepts the same deterministic easing.
        if let Some(parent) = best {
            if let Some(eased_bits) = tracker.eased_bits_for_child(parent, template.curtime) {
                debug!(bits, eased_bits, "share chain stalled, easing share target");
                bits = eased_bits;
            }
        }

        let (absheight, abswork, far_share_hash) = match best.and_then(|h| tracker.get(&h)) {
            Some(parent) => (
                parent.share.info.absheight + 1,
                parent
                    .share
                    .info
                    .abswork
                    .saturating_add(attempts_for_bits(bits)),
                tracker.far_share_for_child(best)?,
            ),
            None => (1, attempts_for_bits(bits), None),
        };

        let info = ShareInfo {
            previous_share_hash: best,
            coinbase: Bytes::from(self.coinbase_prefix(template.height, &request.extranonce1)),
            nonce: self.job_counter.wrapping_mul(0x9e37_79b9),
            pubkey_hash: request.pubkey_hash,
            subsidy: template.coinbase_value,
            donation: self.donation,
            stale_info: StaleInfo::None,
            desired_version: self.desired_version,
            far_share_hash,
            bits,
            timestamp: template.curtime,
            absheight,
            abswork,
            new_transaction_hashes: Vec::new(),
            transaction_hash_refs: Vec::new(),
            segwit_commitment: if self.share_version.supports_segwit_commitment() {
                template.witness_commitment.as_ref().map(|s| hash256(s))
            } else {
                None
            },
            merged_addresses: if self.share_version.commits_merged_addresses() {
                self.merged_addresses.clone()
            } else {
                Vec::new()
            },
        };

        // The provisional share participates in its own payout window
        let mut window = match best {
            Some(tip) => tracker.chain(&tip, self.net.chain_length - 1)?,
            None => Vec::new(),
        };
        let provisional = Share {
            version: self.share_version,
            min_header: MinHeader {
                version: template.version,
                previous_block: template.previous_block,
                timestamp: template.curtime,
                bits: template.bits,
                nonce: 0,
            },
            info: info.clone(),
            hash_link: HashLink::from_prefix(&[]),
            merkle_link: Vec::new(),
        };
        window.push(Arc::new(provisional));

        let consensus_outputs = payout_outputs(&self.net, template.coinbase_value, &window)?;
        let mut commitments = Vec::new();
        if let Some(script) = &template.witness_commitment {
            commitments.push(TxOut {
                value: 0,
                script_pubkey: script.clone(),
            });
        }
        let context = GentxContext {
            obligations: template.obligations.clone(),
            commitments,
            scriptsig_tail: Bytes::new(),
        };

        // Serialize with a zeroed extranonce2 and split around it
        let mut script_with_en2 = info.coinbase.to_vec();
        script_with_en2.extend_from_slice(&[0u8; EXTRANONCE2_SIZE]);
        let ref_hash = provisional_ref_hash(self.share_version, &info, &self.net.identifier);
        let gentx = build_gentx(&script_with_en2, &context, &consensus_outputs, &ref_hash);
        let serialized = gentx.to_bytes();
        let split = coinb1_len(&info.coinbase);
        let coinb1 = Bytes::copy_from_slice(&serialized[..split]);
        let coinb2 = Bytes::copy_from_slice(&serialized[split + EXTRANONCE2_SIZE..]);

        // Branch over the template txids with the gentx at index 0
        let mut leaves = Vec::with_capacity(1 + template.transactions.len());
        leaves.push(Hash256::ZERO);
        leaves.extend(template.txids());
        let branch = merkle_branch(&leaves, 0);

        let share_target = crate::primitives::target::compact_to_target(bits);
        let pseudo_target = request.pseudo_target.max(share_target);

        self.job_counter = self.job_counter.wrapping_add(1);
        Ok(Job {
            id: self.job_counter,
            version: template.version,
            previous_block: template.previous_block,
            bits: template.bits,
            ntime: template.curtime,
            coinb1,
            coinb2,
            merkle_branch: branch,
            share_target,
            pseudo_target,
            clean_jobs,
            skeleton: ShareSkeleton {
                version: self.share_version,
                info,
                context,
                consensus_outputs,
                template: Arc::clone(template),
                issued_at_event: self.new_work_events,
            },
        })
    }

    /// Classify one submission against its job
    #[allow(clippy::too_many_arguments)]
    pub fn classify(
        &mut self,
        job: &Job,
        extranonce2: &[u8; 4],
        ntime: u32,
        nonce: u32,
        version_bits: u32,
        version_mask: u32,
    ) -> Classified {
        if !self
            .recent_submissions
            .insert((job.id, *extranonce2, nonce, ntime))
        {
            return Classified::Duplicate;
        }
        let tolerance = if self.solo {
            STALE_EVENT_TOLERANCE_SOLO
        } else {
            STALE_EVENT_TOLERANCE
        };
        if self.new_work_events.saturating_sub(job.skeleton.issued_at_event) >= tolerance {
            return Classified::Stale;
        }

        // Gentx hash through the job's midstate, exactly as a miner builds it
        let base = HashLink::from_prefix(&job.coinb1);
        let mut tail = Vec::with_capacity(EXTRANONCE2_SIZE + job.coinb2.len());
        tail.extend_from_slice(extranonce2);
        tail.extend_from_slice(&job.coinb2);
        let gentx_hash = base.finalize(&tail);

        let merkle_root = apply_merkle_branch(gentx_hash, &job.merkle_branch, 0);
        let version = (job.version & !(version_mask as i32)) | (version_bits & version_mask) as i32;
        let header = BlockHeader {
            version,
            previous_block: job.previous_block,
            merkle_root,
            timestamp: ntime,
            bits: job.bits,
            nonce,
        };
        let pow = (self.net.parent.pow_hash)(&header.to_bytes());
        let pow_value = hash_to_u256(&pow);

        let parent_target = job.skeleton.template.parent_target();
        if pow_value <= parent_target {
            info!(hash = %header.hash(), "parent block solved");
            let share = self.rebuild_share(job, extranonce2, &header);
            let block = self.assemble_block(job, extranonce2, &header);
            return Classified::Block {
                block: Box::new(block),
                share,
            };
        }
        if pow_value <= job.share_target {
            return Classified::Share(self.rebuild_share(job, extranonce2, &header));
        }
        if pow_value <= job.pseudo_target {
            let difficulty = crate::primitives::target::target_to_difficulty(job.pseudo_target);
            return Classified::Pseudoshare { difficulty };
        }
        Classified::HashAboveTarget
    }

    /// Reconstruct the full share record for a qualifying submission
    fn rebuild_share(&self, job: &Job, extranonce2: &[u8; 4], header: &BlockHeader) -> Share {
        // Hash-link prefix: the gentx minus its constant reference tail
        let mut full = Vec::with_capacity(job.coinb1.len() + EXTRANONCE2_SIZE + job.coinb2.len());
        full.extend_from_slice(&job.coinb1);
        full.extend_from_slice(extranonce2);
        full.extend_from_slice(&job.coinb2);
        let prefix_len = full.len() - GENTX_TAIL_LEN;
        let hash_link = HashLink::from_prefix(&full[..prefix_len]);

        Share {
            version: job.skeleton.version,
            min_header: MinHeader {
                version: header.version,
                previous_block: header.previous_block,
                timestamp: header.timestamp,
                bits: header.bits,
                nonce: header.nonce,
            },
            info: job.skeleton.info.clone(),
            hash_link,
            merkle_link: job.merkle_branch.clone(),
        }
    }

    /// The exact generation transaction a submission mined
    pub fn rebuild_coinbase(&self, job: &Job, extranonce2: &[u8; 4]) -> Transaction {
        let mut script = job.skeleton.info.coinbase.to_vec();
        script.extend_from_slice(extranonce2);
        let ref_hash = provisional_ref_hash(
            job.skeleton.version,
            &job.skeleton.info,
            &self.net.identifier,
        );
        build_gentx(
            &script,
            &job.skeleton.context,
            &job.skeleton.consensus_outputs,
            &ref_hash,
        )
    }

    /// Full parent block from the job's template and the submitted gentx
    fn assemble_block(&self, job: &Job, extranonce2: &[u8; 4], header: &BlockHeader) -> Block {
        Block {
            header: *header,
            coinbase: self.rebuild_coinbase(job, extranonce2),
            transactions: job
                .skeleton
                .template
                .transactions
                .iter()
                .map(|t| t.raw.raw_bytes())
                .collect(),
        }
    }

    /// Gentx context for verifying a share we just produced locally
    pub fn local_context(job: &Job, extranonce2: &[u8; 4]) -> GentxContext {
        let mut context = job.skeleton.context.clone();
        context.scriptsig_tail = Bytes::copy_from_slice(extranonce2);
        context
    }
}

/// Byte offset of the extranonce2 inside the serialized gentx
fn coinb1_len(coinbase_prefix: &[u8]) -> usize {
    let script_len = coinbase_prefix.len() + EXTRANONCE2_SIZE;
    let varint_len = if script_len < 0xfd { 1 } else { 3 };
    // version + input count + outpoint + script varint + prefix
    4 + 1 + 36 + varint_len + coinbase_prefix.len()
}

/// Expected attempts for compact share bits
fn attempts_for_bits(bits: u32) -> u128 {
    let attempts = crate::primitives::target::target_to_average_attempts(
        crate::primitives::target::compact_to_target(bits),
    );
    if attempts.bits() > 128 {
        u128::MAX
    } else {
        attempts.low_u128()
    }
}

/// Reference hash of a share payload before the proof fields exist
fn provisional_ref_hash(
    version: ShareVersion,
    info: &ShareInfo,
    identifier: &[u8; 8],
) -> Hash256 {
    let mut buf = Vec::with_capacity(8 + 256);
    buf.extend_from_slice(identifier);
    buf.extend_from_slice(&crate::share::codec::pack_share_info(version, info));
    hash256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinb1_length_matches_layout() {
        let prefix = vec![0xaa; 20];
        // version(4) + count(1) + outpoint(36) + varint(1) + prefix(20)
        assert_eq!(coinb1_len(&prefix), 62);
    }

    #[test]
    fn version_rolling_respects_mask() {
        let mask: u32 = 0x1fffe000;
        let job_version: i32 = 0x20000000;
        let rolled: u32 = 0x00aa2000;
        let version = (job_version & !(mask as i32)) | (rolled & mask) as i32;
        assert_eq!(version as u32 & !mask, job_version as u32 & !mask);
        assert_eq!(version as u32 & mask, rolled & mask);
    }
}
