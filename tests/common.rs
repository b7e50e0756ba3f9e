//! Shared fixtures for the integration suites
//!
//! A test network with a target easy enough that share grinding takes a
//! handful of nonces, plus a pool harness that mines real shares through
//! the work generator so everything downstream sees fully valid records.

use std::sync::Arc;

use peerpool_node::networks::{NetworkDescriptor, LITECOIN};
use peerpool_node::parent::BlockTemplate;
use peerpool_node::primitives::hash::{hash256, Hash256};
use peerpool_node::share::Share;
use peerpool_node::tracker::ShareTracker;
use peerpool_node::work::{Classified, Job, WorkGenerator, WorkRequest};

/// Roughly half of all hashes meet this target
pub const EASY_BITS: u32 = 0x207fffff;
/// Essentially no hash meets the parent target in tests
pub const HARD_PARENT_BITS: u32 = 0x1d00ffff;

/// A short-window test deployment (PPLNS window of 10 shares)
pub fn test_net() -> Arc<NetworkDescriptor> {
    let mut net = LITECOIN.clone();
    net.share_period_secs = 10;
    net.chain_length = 10;
    net.real_chain_length = 20;
    net.target_lookbehind = 5;
    net.spread = 30;
    net.max_target_bits = EASY_BITS;
    net.min_target_bits = 0x1b0fffff;
    net.dust_threshold = 100;
    net.persist = false;
    Arc::new(net)
}

pub fn template_at(curtime: u32) -> Arc<BlockTemplate> {
    Arc::new(BlockTemplate {
        previous_block: hash256(b"parent-chain-tip"),
        height: 840_001,
        coinbase_value: 5_000_000_000,
        bits: HARD_PARENT_BITS,
        version: 0x2000_0000,
        curtime,
        transactions: Vec::new(),
        obligations: Vec::new(),
        witness_commitment: None,
        fetched_at: curtime as u64,
    })
}

/// A miner, a tracker, and a work generator wired together
pub struct TestPool {
    pub net: Arc<NetworkDescriptor>,
    pub tracker: ShareTracker,
    pub workgen: WorkGenerator,
    pub curtime: u32,
}

impl TestPool {
    pub fn new() -> Self {
        let net = test_net();
        Self {
            tracker: ShareTracker::new(Arc::clone(&net)),
            workgen: WorkGenerator::new(Arc::clone(&net), 5, true),
            net,
            curtime: 1_700_000_000,
        }
    }

    pub fn make_job(&mut self, pubkey_hash: [u8; 20]) -> Job {
        let template = template_at(self.curtime);
        let request = WorkRequest {
            pubkey_hash,
            extranonce1: [0xab, 0xcd, 0xef, 0x01],
            pseudo_target: peerpool_node::primitives::target::U256::MAX,
        };
        self.workgen
            .make_job(&self.tracker, &template, &request, true)
            .expect("job assembly")
    }

    /// Grind nonces until a submission qualifies as a share
    pub fn grind_share(&mut self, job: &Job) -> (Share, [u8; 4]) {
        let en2 = [0u8; 4];
        for nonce in 0..200_000u32 {
            match self
                .workgen
                .classify(job, &en2, job.ntime, nonce, 0, 0)
            {
                Classified::Share(share) => return (share, en2),
                Classified::Block { share, .. } => return (share, en2),
                _ => continue,
            }
        }
        panic!("no share found in 200k nonces; target miscalibrated");
    }

    /// Mine one share for `pubkey_hash`, add it, verify it with full
    /// payout context, and advance the clock one share period.
    pub fn mine_verified_share(&mut self, pubkey_hash: [u8; 20]) -> Hash256 {
        let job = self.make_job(pubkey_hash);
        let (share, en2) = self.grind_share(&job);
        let (_, hash) = self.tracker.add(share).expect("share accepted");
        let context = WorkGenerator::local_context(&job, &en2);
        self.tracker
            .verify(&hash, Some(&context))
            .expect("share verifies");
        self.curtime += self.net.share_period_secs as u32;
        hash
    }

    /// Mine a chain of `n` shares for one miner
    pub fn mine_chain(&mut self, pubkey_hash: [u8; 20], n: usize) -> Vec<Hash256> {
        (0..n).map(|_| self.mine_verified_share(pubkey_hash)).collect()
    }
}
