//! Litecoin share-chain deployment (Dogecoin merged-mining capable)

use crate::primitives::address::AddressParams;
use crate::primitives::hash::sha256d_digest;

use super::{NetworkDescriptor, ParentDescriptor};

/// 50 LTC halving every 840 000 blocks
fn litecoin_subsidy(height: u32) -> u64 {
    let halvings = height / 840_000;
    if halvings >= 64 {
        return 0;
    }
    5_000_000_000u64 >> halvings
}

/// Legacy donation output (P2PK, key lost; kept for payout compatibility)
const DONATION_SCRIPT: &[u8] = &[
    0x21, 0x02, 0x1f, 0x8f, 0x41, 0x5c, 0x9a, 0x0c, 0x7a, 0x6e, 0xd3, 0x2c, 0x6b, 0x22, 0x84,
    0x2e, 0x62, 0x8d, 0x9a, 0x6d, 0x4f, 0xef, 0x0d, 0x19, 0xa6, 0x28, 0x7c, 0x29, 0x3b, 0x13,
    0x0c, 0x37, 0x9a, 0x23, 0xac,
];

/// Operator-controlled successor output, emitted only when configured
const SECONDARY_DONATION_SCRIPT: &[u8] = &[
    0x76, 0xa9, 0x14, 0x5b, 0x12, 0x73, 0x86, 0xf1, 0x6c, 0x3c, 0x41, 0x0e, 0x0a, 0x5d, 0x7a,
    0x99, 0x27, 0x3c, 0x1f, 0x60, 0x08, 0x44, 0xc2, 0x88, 0xac,
];

pub static LITECOIN: NetworkDescriptor = NetworkDescriptor {
    name: "litecoin",
    identifier: *b"\xe0\x37\xd5\xb8\xc6\x19\x00\x01",
    wire_prefix: *b"\xc0\x1d\xf1\x93\x2e\xca\x00\x01",
    default_p2p_port: 9327,
    default_stratum_port: 9327,
    parent: ParentDescriptor {
        symbol: "LTC",
        address: AddressParams {
            p2pkh_version: 0x30,
            p2sh_version: 0x32,
            bech32_hrp: "ltc",
        },
        default_rpc_port: 9332,
        default_p2p_port: 9333,
        block_period_secs: 150,
        subsidy_fn: litecoin_subsidy,
        // Scrypt plugs in through the descriptor; SHA-256d stands in until
        // an external digest is wired up.
        pow_hash: sha256d_digest,
        header_hash: sha256d_digest,
        sane_target_min_bits: 0x1a008000,
        sane_target_max_bits: 0x1e0fffff,
        required_softforks: &["segwit", "mweb"],
    },
    share_period_secs: 15,
    chain_length: 4320,
    real_chain_length: 8640,
    target_lookbehind: 200,
    spread: 30,
    min_target_bits: 0x1b0fffff,
    max_target_bits: 0x1e0fffff,
    minimum_protocol_version: 3500,
    dust_threshold: 100_000,
    donation_script: DONATION_SCRIPT,
    secondary_donation_script: SECONDARY_DONATION_SCRIPT,
    bootstrap_hosts: &[
        "seed-ltc.peerpool.net",
        "ltc.poolnodes.org",
        "backup.peerpool.net",
    ],
    persist: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_halves() {
        assert_eq!(litecoin_subsidy(0), 5_000_000_000);
        assert_eq!(litecoin_subsidy(839_999), 5_000_000_000);
        assert_eq!(litecoin_subsidy(840_000), 2_500_000_000);
        assert_eq!(litecoin_subsidy(1_680_000), 1_250_000_000);
    }

    #[test]
    fn donation_script_is_p2pk() {
        assert_eq!(DONATION_SCRIPT.len(), 35);
        assert_eq!(DONATION_SCRIPT[0], 0x21);
        assert_eq!(DONATION_SCRIPT[34], 0xac);
    }
}
