//! Work generator classification: pseudoshares, duplicates, staleness,
//! job-pinned targets, and the parent-block path.

mod common;

use common::{template_at, TestPool};
use peerpool_node::primitives::target::{compact_to_target, hash_to_u256, U256};
use peerpool_node::work::{Classified, WorkRequest, STALE_EVENT_TOLERANCE_SOLO};

const MINER: [u8; 20] = [0x77; 20];

#[test]
fn job_ids_are_eight_hex_chars() {
    let mut pool = TestPool::new();
    let job = pool.make_job(MINER);
    assert_eq!(job.id_hex().len(), 8);
    assert!(job.id_hex().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn pseudoshare_between_share_and_pseudo_target() {
    let mut pool = TestPool::new();
    let job = pool.make_job(MINER);
    // Pseudo target is the maximum: every submission counts at least as a
    // pseudoshare; harder hashes become shares
    let mut saw_pseudo = false;
    let mut saw_share = false;
    let en2 = [1u8; 4];
    for nonce in 0..512u32 {
        match pool.workgen.classify(&job, &en2, job.ntime, nonce, 0, 0) {
            Classified::Pseudoshare { difficulty } => {
                assert!(difficulty.is_finite());
                saw_pseudo = true;
            }
            Classified::Share(share) => {
                let ids = share.ids(&pool.net.identifier);
                let pow = share.pow_hash(&pool.net, &ids);
                assert!(hash_to_u256(&pow) <= job.share_target);
                saw_share = true;
            }
            Classified::Block { .. } => {}
            other => panic!(
                "with a maximum pseudo target nothing should be rejected: {}",
                match other {
                    Classified::Stale => "stale",
                    Classified::Duplicate => "duplicate",
                    Classified::HashAboveTarget => "hash-above-target",
                    _ => unreachable!(),
                }
            ),
        }
        if saw_pseudo && saw_share {
            return;
        }
    }
    panic!("expected both pseudoshares and shares in 512 nonces");
}

#[test]
fn duplicate_submission_detected() {
    let mut pool = TestPool::new();
    let job = pool.make_job(MINER);
    let en2 = [2u8; 4];
    let _ = pool.workgen.classify(&job, &en2, job.ntime, 42, 0, 0);
    assert!(matches!(
        pool.workgen.classify(&job, &en2, job.ntime, 42, 0, 0),
        Classified::Duplicate
    ));
    // A different nonce is a fresh submission
    assert!(!matches!(
        pool.workgen.classify(&job, &en2, job.ntime, 43, 0, 0),
        Classified::Duplicate
    ));
}

#[test]
fn job_goes_stale_after_enough_new_work_events() {
    let mut pool = TestPool::new();
    let job = pool.make_job(MINER);
    // Solo mode tolerates a large burst of template churn
    for _ in 0..STALE_EVENT_TOLERANCE_SOLO - 1 {
        pool.workgen.note_new_work();
    }
    assert!(!matches!(
        pool.workgen.classify(&job, &[3u8; 4], job.ntime, 1, 0, 0),
        Classified::Stale
    ));
    pool.workgen.note_new_work();
    assert!(matches!(
        pool.workgen.classify(&job, &[3u8; 4], job.ntime, 2, 0, 0),
        Classified::Stale
    ));
}

#[test]
fn in_flight_submission_validates_against_its_jobs_target() {
    let mut pool = TestPool::new();
    // Job issued while the connection's vardiff was easy
    let easy_job = pool.make_job(MINER);

    // Vardiff tightens: the next job pins a harder pseudo target
    let template = template_at(pool.curtime);
    let hard_request = WorkRequest {
        pubkey_hash: MINER,
        extranonce1: [0xab, 0xcd, 0xef, 0x01],
        pseudo_target: compact_to_target(common::EASY_BITS) >> 8,
    };
    let hard_job = pool
        .workgen
        .make_job(&pool.tracker, &template, &hard_request, false)
        .unwrap();
    assert!(hard_job.pseudo_target < easy_job.pseudo_target);

    // A solution for the old job still validates against the old pseudo
    // target, not the tightened one
    let en2 = [4u8; 4];
    let mut accepted = 0;
    for nonce in 0..256u32 {
        match pool
            .workgen
            .classify(&easy_job, &en2, easy_job.ntime, nonce, 0, 0)
        {
            Classified::Pseudoshare { .. } | Classified::Share(_) | Classified::Block { .. } => {
                accepted += 1
            }
            Classified::HashAboveTarget => panic!("old job's pinned target must govern"),
            _ => {}
        }
    }
    assert!(accepted > 0);
}

#[test]
fn parent_block_found_when_template_target_is_easy() {
    let mut pool = TestPool::new();
    // A template whose parent target equals the share target: any share is
    // simultaneously a block
    let mut template = (*template_at(pool.curtime)).clone();
    template.bits = common::EASY_BITS;
    let template = std::sync::Arc::new(template);
    let request = WorkRequest {
        pubkey_hash: MINER,
        extranonce1: [0xab, 0xcd, 0xef, 0x01],
        pseudo_target: U256::MAX,
    };
    let job = pool
        .workgen
        .make_job(&pool.tracker, &template, &request, true)
        .unwrap();

    let en2 = [5u8; 4];
    for nonce in 0..4096u32 {
        if let Classified::Block { block, share } =
            pool.workgen.classify(&job, &en2, job.ntime, nonce, 0, 0)
        {
            let bytes = block.to_bytes();
            // Header leads the serialization
            let header =
                peerpool_node::primitives::block::BlockHeader::from_bytes(&bytes[..80]).unwrap();
            assert_eq!(header, block.header);
            // The share rides along with the same header fields
            assert_eq!(share.min_header.nonce, nonce);
            // The coinbase commits to the BIP34 height
            assert_eq!(
                peerpool_node::primitives::block::decode_bip34_height(
                    &block.coinbase.inputs[0].script_sig
                ),
                Some(template.height)
            );
            return;
        }
    }
    panic!("no block found with an easy parent target");
}

#[test]
fn version_rolling_only_touches_masked_bits() {
    let mut pool = TestPool::new();
    let job = pool.make_job(MINER);
    let mask = 0x1fff_e000u32;
    let en2 = [6u8; 4];
    for nonce in 0..128u32 {
        if let Classified::Share(share) =
            pool.workgen
                .classify(&job, &en2, job.ntime, nonce, 0xffff_ffff, mask)
        {
            let rolled = share.min_header.version as u32;
            let base = job.version as u32;
            assert_eq!(rolled & !mask, base & !mask);
            assert_eq!(rolled & mask, mask);
            return;
        }
    }
    panic!("no share found while rolling version bits");
}
