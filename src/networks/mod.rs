//! Per-chain network descriptors
//!
//! A descriptor is a passive, immutable record of everything that differs
//! between supported parent chains: wire magics, ports, address encoding,
//! subsidy schedule, digest functions, and share-chain tuning. The rest of
//! the node never hard-codes a chain parameter.

mod dash;
mod litecoin;

use crate::primitives::address::AddressParams;
use crate::primitives::hash::Hash256;
use crate::primitives::target::{compact_to_target, U256};

pub use dash::DASH;
pub use litecoin::LITECOIN;

/// Opaque digest function (SHA-256d supplied; Scrypt/X11 plug in here)
pub type PowFn = fn(&[u8]) -> Hash256;

/// Parent-chain parameters embedded in a network descriptor
#[derive(Clone)]
pub struct ParentDescriptor {
    pub symbol: &'static str,
    pub address: AddressParams,
    pub default_rpc_port: u16,
    pub default_p2p_port: u16,
    /// Target seconds between parent blocks
    pub block_period_secs: u64,
    /// Block subsidy (satoshis) at a given height, fees excluded
    pub subsidy_fn: fn(u32) -> u64,
    /// Proof-of-work digest for share/block qualification
    pub pow_hash: PowFn,
    /// Digest producing the block id the parent chain indexes by
    pub header_hash: PowFn,
    /// Compact-bits bounds a sane template must fall within
    pub sane_target_min_bits: u32,
    pub sane_target_max_bits: u32,
    /// Softfork rules the template request must carry
    pub required_softforks: &'static [&'static str],
}

impl ParentDescriptor {
    pub fn sane_target_range(&self) -> (U256, U256) {
        (
            compact_to_target(self.sane_target_min_bits),
            compact_to_target(self.sane_target_max_bits),
        )
    }
}

/// Everything the node needs to know about one share-chain deployment
#[derive(Clone)]
pub struct NetworkDescriptor {
    pub name: &'static str,
    /// Share-chain identity magic
    pub identifier: [u8; 8],
    /// P2P frame magic
    pub wire_prefix: [u8; 8],
    pub default_p2p_port: u16,
    pub default_stratum_port: u16,
    pub parent: ParentDescriptor,
    /// Target seconds between shares
    pub share_period_secs: u64,
    /// PPLNS window length, in shares
    pub chain_length: u64,
    /// Retention window, in shares
    pub real_chain_length: u64,
    /// Shares consulted by the retargeter
    pub target_lookbehind: u64,
    /// Cap on share difficulty relative to parent difficulty
    pub spread: u64,
    /// Share-target bounds, compact form
    pub min_target_bits: u32,
    pub max_target_bits: u32,
    /// Peers below this protocol version are rejected
    pub minimum_protocol_version: u32,
    /// Outputs below this many satoshis are consolidated away
    pub dust_threshold: u64,
    /// Legacy consensus-bound donation output script (P2PK, key lost)
    pub donation_script: &'static [u8],
    /// Operator-controlled donation script, config-gated
    pub secondary_donation_script: &'static [u8],
    pub bootstrap_hosts: &'static [&'static str],
    /// Production deployments persist; `false` permits peerless solo mode
    /// with a relaxed dead-on-arrival tolerance
    pub persist: bool,
}

impl NetworkDescriptor {
    pub fn min_target(&self) -> U256 {
        compact_to_target(self.min_target_bits)
    }

    pub fn max_target(&self) -> U256 {
        compact_to_target(self.max_target_bits)
    }

    /// Startup sanity: a descriptor that fails here is a config error
    pub fn validate(&self) -> Result<(), String> {
        if self.chain_length == 0 {
            return Err(format!("network {}: chain_length must be nonzero", self.name));
        }
        if self.real_chain_length < self.chain_length {
            return Err(format!(
                "network {}: retention window shorter than PPLNS window",
                self.name
            ));
        }
        if self.min_target() > self.max_target() {
            return Err(format!("network {}: min_target above max_target", self.name));
        }
        if self.donation_script.is_empty() {
            return Err(format!("network {}: empty donation script", self.name));
        }
        if self.target_lookbehind == 0 || self.spread == 0 {
            return Err(format!("network {}: zero retarget parameter", self.name));
        }
        Ok(())
    }
}

/// Auxiliary (merged-mined) chain profile
#[derive(Debug, Clone)]
pub struct AuxChainProfile {
    pub name: &'static str,
    pub symbol: &'static str,
    pub chain_id: u32,
    pub address: AddressParams,
}

/// Look up a network descriptor by CLI name
pub fn lookup(name: &str) -> Option<&'static NetworkDescriptor> {
    match name {
        "dash" => Some(&DASH),
        "litecoin" | "ltc" => Some(&LITECOIN),
        _ => None,
    }
}

/// Look up an auxiliary chain profile by name
pub fn aux_lookup(name: &str) -> Option<AuxChainProfile> {
    match name {
        "dogecoin" | "doge" => Some(AuxChainProfile {
            name: "dogecoin",
            symbol: "DOGE",
            chain_id: 0x62,
            address: AddressParams {
                p2pkh_version: 0x1e,
                p2sh_version: 0x16,
                bech32_hrp: "doge",
            },
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_descriptors_validate() {
        for net in [&DASH, &LITECOIN] {
            net.validate().unwrap();
        }
    }

    #[test]
    fn lookup_known_and_unknown() {
        assert!(lookup("dash").is_some());
        assert!(lookup("litecoin").is_some());
        assert!(lookup("nope").is_none());
        assert!(aux_lookup("dogecoin").is_some());
    }

    #[test]
    fn zero_chain_length_fails_loudly() {
        let mut net = LITECOIN.clone();
        net.chain_length = 0;
        assert!(net.validate().is_err());
    }
}
