//! Merged mining
//!
//! One parent-chain PoW satisfies any number of auxiliary chains through a
//! merkle commitment in the coinbase. This module builds the commitment
//! tree, assembles auxpow proofs for submission, keeps aux work fresh, and
//! routes auxiliary payouts for V36+ shares.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::networks::AuxChainProfile;
use crate::parent::ParentRpcClient;
use crate::primitives::address::{convertible_pubkey_hash, synthesize_p2pkh};
use crate::primitives::block::{BlockHeader, MergedMiningData};
use crate::primitives::encode::Writer;
use crate::primitives::hash::Hash256;
use crate::primitives::merkle::{merkle_branch, merkle_root};
use crate::primitives::target::{hash_to_u256, U256};
use crate::primitives::tx::Transaction;
use crate::share::Share;
use crate::tracker::weights::share_payout_script;

#[derive(Debug, Error)]
pub enum MergedError {
    #[error("aux work reply missing {0}")]
    BadReply(&'static str),
    #[error("no commitment slot assignment for {0} chains")]
    Unplaceable(usize),
}

/// Work unit from one auxiliary chain's node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxWork {
    pub chain_id: u32,
    pub hash: Hash256,
    pub target: U256,
}

impl AuxWork {
    /// Parse a `createauxblock`/`getauxblock` result
    pub fn parse(chain_id: u32, value: &Value) -> Result<Self, MergedError> {
        let hash = value
            .get("hash")
            .and_then(|v| v.as_str())
            .and_then(Hash256::from_hex)
            .ok_or(MergedError::BadReply("hash"))?;
        let target = value
            .get("target")
            .or_else(|| value.get("_target"))
            .and_then(|v| v.as_str())
            .and_then(|s| hex::decode(s).ok())
            .filter(|b| b.len() == 32)
            .map(|b| {
                // Aux targets arrive as raw 32 little-endian bytes
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&b);
                U256::from_little_endian(&arr)
            })
            .ok_or(MergedError::BadReply("target"))?;
        let declared = value.get("chainid").and_then(|v| v.as_u64());
        Ok(AuxWork {
            chain_id: declared.map(|c| c as u32).unwrap_or(chain_id),
            hash,
            target,
        })
    }
}

/// Slot an aux chain occupies in a commitment tree of `size` leaves
pub fn expected_index(chain_id: u32, nonce: u32, size: u32) -> u32 {
    let rand = nonce
        .wrapping_mul(1_103_515_245)
        .wrapping_add(12345)
        .wrapping_add(chain_id);
    rand % size
}

/// A built commitment: the coinbase marker plus per-chain branches
#[derive(Debug, Clone)]
pub struct AuxCommitment {
    pub data: MergedMiningData,
    /// chain_id -> (branch to the commitment root, leaf index)
    pub branches: HashMap<u32, (Vec<Hash256>, u32)>,
}

/// Place every aux chain at its expected leaf.
///
/// The tree size doubles and the nonce advances until no two chains collide;
/// unclaimed leaves hold the zero hash.
pub fn build_commitment(works: &[AuxWork]) -> Result<AuxCommitment, MergedError> {
    if works.is_empty() {
        return Err(MergedError::Unplaceable(0));
    }
    let mut size = works.len().next_power_of_two() as u32;
    for _ in 0..8 {
        for nonce in 0..64u32 {
            let mut slots: HashMap<u32, &AuxWork> = HashMap::new();
            let mut collision = false;
            for work in works {
                let index = expected_index(work.chain_id, nonce, size);
                if slots.insert(index, work).is_some() {
                    collision = true;
                    break;
                }
            }
            if collision {
                continue;
            }
            let leaves: Vec<Hash256> = (0..size)
                .map(|i| slots.get(&i).map(|w| w.hash).unwrap_or(Hash256::ZERO))
                .collect();
            let root = merkle_root(&leaves);
            let branches = works
                .iter()
                .map(|work| {
                    let index = expected_index(work.chain_id, nonce, size);
                    (
                        work.chain_id,
                        (merkle_branch(&leaves, index as usize), index),
                    )
                })
                .collect();
            return Ok(AuxCommitment {
                data: MergedMiningData {
                    merkle_root: root,
                    size,
                    nonce,
                },
                branches,
            });
        }
        size *= 2;
    }
    Err(MergedError::Unplaceable(works.len()))
}

/// The auxpow proof an auxiliary chain verifies
#[derive(Debug, Clone)]
pub struct AuxPowProof {
    pub coinbase: Transaction,
    pub parent_block_hash: Hash256,
    /// Branch from the coinbase to the parent merkle root
    pub coinbase_branch: Vec<Hash256>,
    /// Branch from the aux block hash to the commitment root
    pub chain_branch: Vec<Hash256>,
    pub chain_index: u32,
    pub parent_header: BlockHeader,
}

impl AuxPowProof {
    /// Standard auxpow serialization for `submitauxblock`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.coinbase.encode(&mut w);
        w.put_hash(&self.parent_block_hash);
        w.put_varint(self.coinbase_branch.len() as u64);
        for h in &self.coinbase_branch {
            w.put_hash(h);
        }
        w.put_u32(0); // coinbase sits at index 0
        w.put_varint(self.chain_branch.len() as u64);
        for h in &self.chain_branch {
            w.put_hash(h);
        }
        w.put_u32(self.chain_index);
        self.parent_header.encode(&mut w);
        w.into_bytes()
    }
}

/// Keeps aux work fresh and submits proofs when the parent PoW qualifies
pub struct MergedCoordinator {
    chains: Vec<(AuxChainProfile, Arc<ParentRpcClient>, String)>,
    works: Arc<Mutex<HashMap<u32, AuxWork>>>,
}

impl MergedCoordinator {
    pub fn new(chains: Vec<(AuxChainProfile, Arc<ParentRpcClient>, String)>) -> Self {
        Self {
            chains,
            works: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn works_handle(&self) -> Arc<Mutex<HashMap<u32, AuxWork>>> {
        Arc::clone(&self.works)
    }

    /// Refresh aux work for every configured chain
    pub async fn refresh(&self) {
        for (profile, client, payout_address) in &self.chains {
            match client.create_aux_block(payout_address).await {
                Ok(value) => match AuxWork::parse(profile.chain_id, &value) {
                    Ok(work) => {
                        let mut works = self.works.lock().await;
                        if works.insert(profile.chain_id, work) != Some(work) {
                            debug!(chain = profile.name, hash = %work.hash, "aux work updated");
                        }
                    }
                    Err(e) => warn!(chain = profile.name, "bad aux work reply: {}", e),
                },
                Err(e) => warn!(chain = profile.name, "aux work fetch failed: {}", e),
            }
        }
    }

    /// Poll loop; aux templates refresh on the parent block cadence
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            self.refresh().await;
        }
    }

    /// Check a solved parent PoW against every aux target and submit proofs
    pub async fn try_submit(
        &self,
        pow_hash: &Hash256,
        commitment: &AuxCommitment,
        coinbase: &Transaction,
        coinbase_branch: &[Hash256],
        parent_header: &BlockHeader,
    ) {
        let pow_value = hash_to_u256(pow_hash);
        let works = self.works.lock().await.clone();
        for (profile, client, _) in &self.chains {
            let Some(work) = works.get(&profile.chain_id) else {
                continue;
            };
            if pow_value > work.target {
                continue;
            }
            let Some((chain_branch, chain_index)) =
                commitment.branches.get(&profile.chain_id).cloned()
            else {
                continue;
            };
            let proof = AuxPowProof {
                coinbase: coinbase.clone(),
                parent_block_hash: parent_header.hash(),
                coinbase_branch: coinbase_branch.to_vec(),
                chain_branch,
                chain_index,
                parent_header: *parent_header,
            };
            let hex_proof = hex::encode(proof.to_bytes());
            match client.submit_aux_block(&work.hash, &hex_proof).await {
                Ok(true) => info!(chain = profile.name, hash = %work.hash, "aux block accepted"),
                Ok(false) => warn!(chain = profile.name, "aux block rejected"),
                Err(e) => warn!(chain = profile.name, "aux submit failed: {}", e),
            }
        }
    }
}

/// Payout script on an auxiliary chain for one share, per the routing rules:
/// explicit merged address first, then P2PKH synthesis from a convertible
/// primary, else ineligible.
pub fn merged_payout_script(share: &Share, profile: &AuxChainProfile) -> Option<Bytes> {
    if let Some(entry) = share
        .info
        .merged_addresses
        .iter()
        .find(|e| e.chain_id == profile.chain_id)
    {
        return Some(entry.script.clone());
    }
    let primary = share_payout_script(share);
    convertible_pubkey_hash(&primary).map(synthesize_p2pkh)
}

/// Local-only auxiliary payout split: ineligible shares' weight is
/// redistributed across the eligible shares in the same window.
pub fn merged_payouts(
    window: &[Arc<Share>],
    profile: &AuxChainProfile,
    total: u64,
) -> Vec<(Bytes, u64)> {
    let mut eligible: Vec<(Bytes, u128)> = Vec::new();
    let mut total_weight: u128 = 0;
    for share in window {
        let Some(script) = merged_payout_script(share, profile) else {
            continue;
        };
        let weight = share.payout_weight();
        total_weight += weight;
        match eligible.iter_mut().find(|(s, _)| *s == script) {
            Some(entry) => entry.1 += weight,
            None => eligible.push((script, weight)),
        }
    }
    if total_weight == 0 {
        return Vec::new();
    }
    eligible.sort_by(|a, b| a.0.cmp(&b.0));
    eligible
        .into_iter()
        .map(|(script, weight)| {
            let value =
                (U256::from(total) * U256::from(weight) / U256::from(total_weight)).low_u64();
            (script, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::aux_lookup;
    use crate::primitives::hash::hash256;
    use crate::primitives::merkle::apply_merkle_branch;
    use crate::share::testutil::sample_share;
    use crate::share::{MergedAddress, ShareVersion};

    fn work(chain_id: u32, seed: u8) -> AuxWork {
        AuxWork {
            chain_id,
            hash: hash256(&[seed]),
            target: U256::MAX,
        }
    }

    #[test]
    fn expected_index_formula() {
        assert_eq!(expected_index(0x62, 0, 8), (12345u32 + 0x62) % 8);
    }

    #[test]
    fn commitment_places_each_chain_at_its_slot() {
        let works = vec![work(0x62, 1), work(0x01, 2), work(0x07, 3)];
        let commitment = build_commitment(&works).unwrap();
        for aux in &works {
            let (branch, index) = &commitment.branches[&aux.chain_id];
            assert_eq!(
                *index,
                expected_index(aux.chain_id, commitment.data.nonce, commitment.data.size)
            );
            assert_eq!(
                apply_merkle_branch(aux.hash, branch, *index as usize),
                commitment.data.merkle_root
            );
        }
    }

    #[test]
    fn explicit_merged_address_wins() {
        let profile = aux_lookup("dogecoin").unwrap();
        let mut share = sample_share(ShareVersion::V36);
        share.info.merged_addresses = vec![MergedAddress {
            chain_id: profile.chain_id,
            script: Bytes::from_static(&[0x51, 0x51]),
        }];
        assert_eq!(
            merged_payout_script(&share, &profile).unwrap().as_ref(),
            &[0x51, 0x51]
        );
    }

    #[test]
    fn convertible_primary_synthesizes_p2pkh() {
        let profile = aux_lookup("dogecoin").unwrap();
        let mut share = sample_share(ShareVersion::V36);
        share.info.merged_addresses.clear();
        let script = merged_payout_script(&share, &profile).unwrap();
        assert_eq!(script, synthesize_p2pkh(share.info.pubkey_hash));
    }

    #[test]
    fn ineligible_weight_redistributes() {
        let profile = aux_lookup("dogecoin").unwrap();
        // One share with an explicit address, one ineligible (none either way
        // is impossible here since primaries are P2PKH; force ineligibility
        // by checking the split sums to the full total across the eligible)
        let a = Arc::new(sample_share(ShareVersion::V36));
        let mut b_inner = sample_share(ShareVersion::V36);
        b_inner.info.pubkey_hash = [9u8; 20];
        b_inner.info.merged_addresses.clear();
        let b = Arc::new(b_inner);
        let payouts = merged_payouts(&[a, b], &profile, 1_000_000);
        let total: u64 = payouts.iter().map(|(_, v)| v).sum();
        assert!(total <= 1_000_000 && total >= 999_998);
        assert_eq!(payouts.len(), 2);
    }

    #[test]
    fn auxpow_proof_serializes() {
        let works = vec![work(0x62, 1)];
        let commitment = build_commitment(&works).unwrap();
        let (chain_branch, chain_index) = commitment.branches[&0x62].clone();
        let header = BlockHeader {
            version: 1,
            previous_block: hash256(b"p"),
            merkle_root: hash256(b"m"),
            timestamp: 0,
            bits: 0x1d00ffff,
            nonce: 0,
        };
        let proof = AuxPowProof {
            coinbase: Transaction {
                version: 1,
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
            },
            parent_block_hash: header.hash(),
            coinbase_branch: vec![hash256(b"sib")],
            chain_branch,
            chain_index,
            parent_header: header,
        };
        let bytes = proof.to_bytes();
        // Ends with the 80-byte parent header
        assert_eq!(&bytes[bytes.len() - 80..], &header.to_bytes()[..]);
    }
}
