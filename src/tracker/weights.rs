//! PPLNS weight accounting and coinbase payout construction
//!
//! Everything here is a pure function of the share window and the network
//! descriptor. Two nodes that agree on the window must produce byte-identical
//! output lists, so all arithmetic is integer-exact and every ordering rule
//! is total.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::networks::NetworkDescriptor;
use crate::primitives::address::synthesize_p2pkh;
use crate::primitives::encode::Writer;
use crate::primitives::tx::{OutPoint, Transaction, TxIn, TxOut};
use crate::share::Share;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayoutError {
    #[error("empty payout window")]
    EmptyWindow,
    #[error("window carries no weight")]
    ZeroWeight,
    #[error("subsidy is zero")]
    ZeroSubsidy,
}

/// Aggregated weights over a PPLNS window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowWeights {
    /// Kept weight per payout script, sorted by script bytes
    pub weights: Vec<(Bytes, u128)>,
    /// Sum of raw attempts across the window
    pub total_attempts: u128,
    /// Attempts redirected to the donation script
    pub donation_weight: u128,
}

/// Primary payout script for a share: P2PKH from its committed pubkey hash
pub fn share_payout_script(share: &Share) -> Bytes {
    synthesize_p2pkh(share.info.pubkey_hash)
}

/// Walk a window (oldest-first or any order; the result is order-free)
/// and aggregate kept weight per payout script.
pub fn pplns_weights(window: &[Arc<Share>]) -> Result<WindowWeights, PayoutError> {
    if window.is_empty() {
        return Err(PayoutError::EmptyWindow);
    }
    let mut per_script: HashMap<Bytes, u128> = HashMap::new();
    let mut total_attempts: u128 = 0;
    let mut donation_weight: u128 = 0;
    for share in window {
        let attempts = share.work_attempts();
        let kept = share.payout_weight();
        total_attempts = total_attempts.saturating_add(attempts);
        donation_weight = donation_weight.saturating_add(attempts.saturating_sub(kept));
        *per_script.entry(share_payout_script(share)).or_insert(0) += kept;
    }
    if total_attempts == 0 {
        return Err(PayoutError::ZeroWeight);
    }
    let mut weights: Vec<(Bytes, u128)> = per_script.into_iter().collect();
    weights.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(WindowWeights {
        weights,
        total_attempts,
        donation_weight,
    })
}

/// Split `amount` across `weights` proportionally, integer-exact
fn proportional_split(amount: u64, weights: &WindowWeights) -> Vec<(Bytes, u64)> {
    use crate::primitives::target::U256;
    weights
        .weights
        .iter()
        .map(|(script, weight)| {
            let value = (U256::from(amount) * U256::from(*weight)
                / U256::from(weights.total_attempts))
            .low_u64();
            (script.clone(), value)
        })
        .collect()
}

/// The consensus-bound tail of the coinbase output list: PPLNS payouts
/// (sorted by script), then the legacy donation output.
///
/// Dust handling: any payout under the threshold is dropped and its value
/// folded into the heaviest remaining recipient (ties to the lowest script),
/// or into the donation output when nothing remains. The output total always
/// equals `subsidy`.
pub fn payout_outputs(
    net: &NetworkDescriptor,
    subsidy: u64,
    window: &[Arc<Share>],
) -> Result<Vec<TxOut>, PayoutError> {
    if subsidy == 0 {
        return Err(PayoutError::ZeroSubsidy);
    }
    let weights = pplns_weights(window)?;
    let mut shares: Vec<(Bytes, u64)> = proportional_split(subsidy, &weights);

    // Rounding remainder accrues to the donation output
    let paid: u64 = shares.iter().map(|(_, v)| v).sum();
    let mut donation_value = subsidy - paid;

    // Fold dust into the heaviest surviving recipient
    let mut dust_total: u64 = 0;
    shares.retain(|(_, value)| {
        if *value < net.dust_threshold {
            dust_total += *value;
            false
        } else {
            true
        }
    });
    if dust_total > 0 {
        if let Some(heaviest) = heaviest_script(&weights, &shares) {
            for entry in shares.iter_mut() {
                if entry.0 == heaviest {
                    entry.1 += dust_total;
                    break;
                }
            }
        } else {
            donation_value += dust_total;
        }
    }

    let mut outputs: Vec<TxOut> = shares
        .into_iter()
        .map(|(script, value)| TxOut {
            value,
            script_pubkey: script,
        })
        .collect();
    outputs.push(TxOut {
        value: donation_value,
        script_pubkey: Bytes::from_static(net.donation_script),
    });
    Ok(outputs)
}

/// Heaviest script still present in `survivors`; ties break to the
/// lexicographically lowest script so every node picks the same one.
fn heaviest_script(weights: &WindowWeights, survivors: &[(Bytes, u64)]) -> Option<Bytes> {
    let mut best: Option<(&Bytes, u128)> = None;
    for (script, weight) in &weights.weights {
        if !survivors.iter().any(|(s, _)| s == script) {
            continue;
        }
        best = match best {
            None => Some((script, *weight)),
            Some((bs, bw)) => {
                if *weight > bw || (*weight == bw && script < bs) {
                    Some((script, *weight))
                } else {
                    Some((bs, bw))
                }
            }
        };
    }
    best.map(|(s, _)| s.clone())
}

/// Template-dependent gentx parts bracketing the consensus payout section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GentxContext {
    /// Chain-mandated outputs (masternode, treasury, platform, superblock)
    pub obligations: Vec<TxOut>,
    /// Trailing commitment outputs (segwit witness commitment and kin)
    pub commitments: Vec<TxOut>,
    /// Miner-rolled scriptSig bytes following the committed coinbase data
    /// (the extranonce2 of a Stratum submission); committed only through the
    /// hash-link midstate, never through the share payload
    pub scriptsig_tail: Bytes,
}

/// Serialize the gentx up to (not including) the reference output.
///
/// This is the hash-link prefix: the midstate captured over these bytes plus
/// the constant reference-output suffix reproduces the gentx hash.
pub fn gentx_prefix(
    coinbase_script: &[u8],
    context: &GentxContext,
    consensus_outputs: &[TxOut],
) -> Vec<u8> {
    let mut w = Writer::with_capacity(256 + 34 * consensus_outputs.len());
    w.put_i32(1); // version
    w.put_varint(1); // one coinbase input
    w.put_hash(&crate::primitives::hash::Hash256::ZERO);
    w.put_u32(u32::MAX);
    w.put_var_bytes(coinbase_script);
    w.put_u32(u32::MAX); // sequence
    let total =
        context.obligations.len() + consensus_outputs.len() + context.commitments.len() + 1;
    w.put_varint(total as u64);
    for out in context
        .obligations
        .iter()
        .chain(consensus_outputs.iter())
        .chain(context.commitments.iter())
    {
        w.put_u64(out.value);
        w.put_var_bytes(&out.script_pubkey);
    }
    w.into_bytes()
}

/// Assemble the complete generation transaction for a block candidate
pub fn build_gentx(
    coinbase_script: &[u8],
    context: &GentxContext,
    consensus_outputs: &[TxOut],
    ref_hash: &crate::primitives::hash::Hash256,
) -> Transaction {
    let mut outputs = Vec::with_capacity(
        context.obligations.len() + consensus_outputs.len() + context.commitments.len() + 1,
    );
    outputs.extend(context.obligations.iter().cloned());
    outputs.extend(consensus_outputs.iter().cloned());
    outputs.extend(context.commitments.iter().cloned());
    let mut ref_script = Vec::with_capacity(34);
    ref_script.push(0x6a); // OP_RETURN
    ref_script.push(0x20);
    ref_script.extend_from_slice(&ref_hash.0);
    outputs.push(TxOut {
        value: 0,
        script_pubkey: Bytes::from(ref_script),
    });
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: Bytes::copy_from_slice(coinbase_script),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        outputs,
        lock_time: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::LITECOIN;
    use crate::primitives::hash::hash256;
    use crate::share::testutil::sample_share;
    use crate::share::{HashLink, Share, ShareVersion};

    fn window_of(pubkey_hashes: &[[u8; 20]]) -> Vec<Arc<Share>> {
        pubkey_hashes
            .iter()
            .map(|pk| {
                let mut share = sample_share(ShareVersion::V36);
                share.info.pubkey_hash = *pk;
                Arc::new(share)
            })
            .collect()
    }

    #[test]
    fn single_miner_takes_everything_minus_donation() {
        let window = window_of(&[[1u8; 20]]);
        let outputs = payout_outputs(&LITECOIN, 5_000_000_000, &window).unwrap();
        assert_eq!(outputs.len(), 2); // miner + donation
        let total: u64 = outputs.iter().map(|o| o.value).sum();
        assert_eq!(total, 5_000_000_000);
        assert_eq!(
            outputs.last().unwrap().script_pubkey.as_ref(),
            LITECOIN.donation_script
        );
    }

    #[test]
    fn equal_shares_split_equally() {
        let window = window_of(&[[1u8; 20], [2u8; 20]]);
        let outputs = payout_outputs(&LITECOIN, 1_000_000_000, &window).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].value, outputs[1].value);
    }

    #[test]
    fn window_order_does_not_matter() {
        let mut window = window_of(&[[1u8; 20], [2u8; 20], [3u8; 20], [1u8; 20]]);
        let forward = payout_outputs(&LITECOIN, 1_000_000_000, &window).unwrap();
        window.reverse();
        let backward = payout_outputs(&LITECOIN, 1_000_000_000, &window).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn totals_are_exact() {
        let window = window_of(&[[1u8; 20], [2u8; 20], [3u8; 20]]);
        for subsidy in [1_000_000u64, 999_999_937, 5_000_000_000] {
            let outputs = payout_outputs(&LITECOIN, subsidy, &window).unwrap();
            let total: u64 = outputs.iter().map(|o| o.value).sum();
            assert_eq!(total, subsidy);
        }
    }

    #[test]
    fn dust_folds_into_heaviest() {
        // A tiny subsidy makes every payout dust; value lands on donation
        let window = window_of(&[[1u8; 20], [2u8; 20]]);
        let outputs = payout_outputs(&LITECOIN, 10, &window).unwrap();
        assert_eq!(outputs.len(), 1);
        let total: u64 = outputs.iter().map(|o| o.value).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn donation_fraction_reduces_miner_share() {
        let mut share = sample_share(ShareVersion::V36);
        share.info.donation = 500; // half redirected
        let window = vec![Arc::new(share)];
        let outputs = payout_outputs(&LITECOIN, 1_000_000_000, &window).unwrap();
        let donation = outputs.last().unwrap().value;
        assert!(donation >= 499_000_000 && donation <= 501_000_000);
    }

    #[test]
    fn gentx_prefix_matches_full_serialization() {
        let window = window_of(&[[5u8; 20]]);
        let outputs = payout_outputs(&LITECOIN, 1_000_000_000, &window).unwrap();
        let context = GentxContext::default();
        let coinbase = b"\x03\x10\x27\x00extranonce";
        let ref_hash = hash256(b"ref");

        let prefix = gentx_prefix(coinbase, &context, &outputs);
        let gentx = build_gentx(coinbase, &context, &outputs, &ref_hash);
        let full = gentx.to_bytes();

        assert_eq!(&full[..prefix.len()], &prefix[..]);
        let link = HashLink::from_prefix(&prefix);
        let suffix = Share::gentx_suffix(&ref_hash);
        assert_eq!(link.finalize(&suffix), gentx.txid());
    }
}
