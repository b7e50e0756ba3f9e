//! Share records
//!
//! A share is a parent-chain block candidate at drastically reduced
//! difficulty. Its generation transaction commits (through a reference hash
//! in the final coinbase output) to the share-chain payload, so tampering
//! with any payload field moves the header hash and invalidates the proof
//! of work.

pub mod codec;
pub mod hash_link;

use bytes::Bytes;

use crate::networks::NetworkDescriptor;
use crate::primitives::block::BlockHeader;
use crate::primitives::encode::CodecError;
use crate::primitives::hash::{hash256, Hash256};
use crate::primitives::merkle::apply_merkle_branch;
use crate::primitives::target::{compact_to_target, target_to_average_attempts, U256};

pub use hash_link::HashLink;

/// Constant gentx bytes between the hash-link prefix and the reference hash:
/// a zero-value output whose script is `OP_RETURN PUSH32`.
pub const GENTX_BEFORE_REFHASH: [u8; 11] =
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x6a, 0x20];

/// Supported share format versions, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShareVersion {
    V17,
    V32,
    V33,
    V34,
    V35,
    V36,
}

impl ShareVersion {
    pub const ALL: [ShareVersion; 6] = [
        ShareVersion::V17,
        ShareVersion::V32,
        ShareVersion::V33,
        ShareVersion::V34,
        ShareVersion::V35,
        ShareVersion::V36,
    ];

    pub fn as_u16(self) -> u16 {
        match self {
            ShareVersion::V17 => 17,
            ShareVersion::V32 => 32,
            ShareVersion::V33 => 33,
            ShareVersion::V34 => 34,
            ShareVersion::V35 => 35,
            ShareVersion::V36 => 36,
        }
    }

    pub fn from_u16(v: u16) -> Result<Self, CodecError> {
        match v {
            17 => Ok(ShareVersion::V17),
            32 => Ok(ShareVersion::V32),
            33 => Ok(ShareVersion::V33),
            34 => Ok(ShareVersion::V34),
            35 => Ok(ShareVersion::V35),
            36 => Ok(ShareVersion::V36),
            other => Err(CodecError::UnknownVersion(other)),
        }
    }

    /// Peers below this P2P protocol version never receive this share version
    pub fn minimum_protocol_version(self) -> u32 {
        match self {
            ShareVersion::V17 => 1400,
            ShareVersion::V32 => 1700,
            ShareVersion::V33 => 1800,
            ShareVersion::V34 => 3400,
            ShareVersion::V35 => 3500,
            ShareVersion::V36 => 3600,
        }
    }

    /// Pre-V34 shares carry inline transaction hash lists
    pub fn carries_inline_txs(self) -> bool {
        self.as_u16() < 34
    }

    /// V35 onward can commit to a segwit witness root
    pub fn supports_segwit_commitment(self) -> bool {
        self.as_u16() >= 35
    }

    /// V36 onward commits merged-mining payout destinations into the share hash
    pub fn commits_merged_addresses(self) -> bool {
        self.as_u16() >= 36
    }
}

/// Why a share reports itself late, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleInfo {
    None,
    Orphan,
    Doa,
}

impl StaleInfo {
    pub fn as_u8(self) -> u8 {
        match self {
            StaleInfo::None => 0,
            StaleInfo::Orphan => 253,
            StaleInfo::Doa => 254,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(StaleInfo::None),
            253 => Ok(StaleInfo::Orphan),
            254 => Ok(StaleInfo::Doa),
            _ => Err(CodecError::Malformed("stale info")),
        }
    }
}

/// Explicit merged-mining payout destination (V36+)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedAddress {
    pub chain_id: u32,
    pub script: Bytes,
}

/// Maximum merged-address entries per share
pub const MAX_MERGED_ADDRESSES: usize = 8;

/// Parent block header fields a share fixes (the merkle root is derived)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinHeader {
    pub version: i32,
    pub previous_block: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// The share-chain payload committed into the gentx reference hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub previous_share_hash: Option<Hash256>,
    /// Miner-controlled coinbase scriptSig portion (extranonce lives here)
    pub coinbase: Bytes,
    pub nonce: u32,
    /// Primary payout destination on the parent chain
    pub pubkey_hash: [u8; 20],
    /// Parent subsidy plus fees this share presumes
    pub subsidy: u64,
    /// Thousandths of the payout redirected to the donation script
    pub donation: u16,
    pub stale_info: StaleInfo,
    /// The share version the producer votes to switch to
    pub desired_version: u16,
    /// Fixed-lookback reference used by the retargeter
    pub far_share_hash: Option<Hash256>,
    /// Share target, compact form
    pub bits: u32,
    pub timestamp: u32,
    /// Absolute share-chain height
    pub absheight: u32,
    /// Cumulative expected attempts up to and including this share
    pub abswork: u128,
    /// Inline transaction hashes (pre-V34 only)
    pub new_transaction_hashes: Vec<Hash256>,
    /// Compressed references into prior shares' hash lists (pre-V34 only)
    pub transaction_hash_refs: Vec<(u64, u64)>,
    /// Witness-root commitment when the parent template uses segwit (V35+)
    pub segwit_commitment: Option<Hash256>,
    /// Merged-chain payout destinations (V36+), hash-committed
    pub merged_addresses: Vec<MergedAddress>,
}

/// A complete share record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub version: ShareVersion,
    pub min_header: MinHeader,
    pub info: ShareInfo,
    /// Midstate over the gentx serialization up to the reference output
    pub hash_link: HashLink,
    /// Branch placing the gentx at index 0 of the parent merkle tree
    pub merkle_link: Vec<Hash256>,
}

/// Identity and proof hashes derived from a share, computed once on ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareIds {
    pub ref_hash: Hash256,
    pub gentx_hash: Hash256,
    pub header: BlockHeader,
    /// Share identity: SHA-256d of the reconstructed header
    pub hash: Hash256,
}

impl Share {
    /// Hash committing to the share payload, scoped by the chain identifier
    pub fn ref_hash(&self, identifier: &[u8; 8]) -> Hash256 {
        let mut buf = Vec::with_capacity(8 + 256);
        buf.extend_from_slice(identifier);
        buf.extend_from_slice(&codec::pack_share_info(self.version, &self.info));
        hash256(&buf)
    }

    /// Suffix completing the gentx serialization after the hash-link prefix
    pub fn gentx_suffix(ref_hash: &Hash256) -> Vec<u8> {
        let mut suffix = Vec::with_capacity(GENTX_BEFORE_REFHASH.len() + 36);
        suffix.extend_from_slice(&GENTX_BEFORE_REFHASH);
        suffix.extend_from_slice(&ref_hash.0);
        suffix.extend_from_slice(&[0x00; 4]); // lock_time
        suffix
    }

    /// Derive all identity hashes
    pub fn ids(&self, identifier: &[u8; 8]) -> ShareIds {
        let ref_hash = self.ref_hash(identifier);
        let gentx_hash = self.hash_link.finalize(&Self::gentx_suffix(&ref_hash));
        let merkle_root = apply_merkle_branch(gentx_hash, &self.merkle_link, 0);
        let header = BlockHeader {
            version: self.min_header.version,
            previous_block: self.min_header.previous_block,
            merkle_root,
            timestamp: self.min_header.timestamp,
            bits: self.min_header.bits,
            nonce: self.min_header.nonce,
        };
        ShareIds {
            ref_hash,
            gentx_hash,
            header,
            hash: header.hash(),
        }
    }

    /// Proof-of-work hash under the parent chain's digest
    pub fn pow_hash(&self, net: &NetworkDescriptor, ids: &ShareIds) -> Hash256 {
        (net.parent.pow_hash)(&ids.header.to_bytes())
    }

    /// This share's target
    pub fn target(&self) -> U256 {
        compact_to_target(self.info.bits)
    }

    /// Expected attempts represented by this share
    pub fn work_attempts(&self) -> u128 {
        let attempts = target_to_average_attempts(self.target());
        if attempts.bits() > 128 {
            u128::MAX
        } else {
            attempts.low_u128()
        }
    }

    /// Weight in the payout window: attempts scaled by the kept fraction
    pub fn payout_weight(&self) -> u128 {
        let attempts = self.work_attempts();
        attempts / 1000 * (1000 - self.info.donation.min(1000)) as u128
            + attempts % 1000 * (1000 - self.info.donation.min(1000)) as u128 / 1000
    }

    /// Structural sanity independent of chain context
    pub fn sanity_check(&self, net: &NetworkDescriptor) -> Result<(), CodecError> {
        if self.info.donation > 1000 {
            return Err(CodecError::Malformed("donation over 1000/1000"));
        }
        if self.info.merged_addresses.len() > MAX_MERGED_ADDRESSES {
            return Err(CodecError::Oversized {
                max: MAX_MERGED_ADDRESSES,
                got: self.info.merged_addresses.len(),
            });
        }
        if !self.version.commits_merged_addresses() && !self.info.merged_addresses.is_empty() {
            return Err(CodecError::Malformed("merged addresses before v36"));
        }
        if !self.version.supports_segwit_commitment() && self.info.segwit_commitment.is_some() {
            return Err(CodecError::Malformed("segwit commitment before v35"));
        }
        if !self.version.carries_inline_txs()
            && (!self.info.new_transaction_hashes.is_empty()
                || !self.info.transaction_hash_refs.is_empty())
        {
            return Err(CodecError::Malformed("inline tx hashes after v33"));
        }
        let target = self.target();
        if target < net.min_target() || target > net.max_target() {
            return Err(CodecError::Malformed("share target out of network bounds"));
        }
        Ok(())
    }
}
