//! Block header, block assembly, and coinbase conventions
//!
//! Covers the 80-byte header codec, BIP34 height encoding in the coinbase
//! script, and the merged-mining marker scanned for / emitted in
//! coinbase data.

use bytes::Bytes;

use super::encode::{CodecError, Reader, Writer};
use super::hash::{hash256, Hash256};
use super::tx::Transaction;

/// Merged-mining marker prefix in coinbase data: 0xFA 0xBE 'm' 'm'
pub const MERGED_MINING_MAGIC: [u8; 4] = [0xfa, 0xbe, 0x6d, 0x6d];

/// Parent-chain block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode(&self, w: &mut Writer) {
        w.put_i32(self.version);
        w.put_hash(&self.previous_block);
        w.put_hash(&self.merkle_root);
        w.put_u32(self.timestamp);
        w.put_u32(self.bits);
        w.put_u32(self.nonce);
    }

    pub fn to_bytes(&self) -> [u8; 80] {
        let mut w = Writer::with_capacity(80);
        self.encode(&mut w);
        let bytes = w.into_bytes();
        let mut out = [0u8; 80];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(BlockHeader {
            version: r.read_i32()?,
            previous_block: r.read_hash()?,
            merkle_root: r.read_hash()?,
            timestamp: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let header = Self::decode(&mut r)?;
        r.finish()?;
        Ok(header)
    }

    /// Header hash under the parent chain's block-header digest
    pub fn hash_with(&self, digest: fn(&[u8]) -> Hash256) -> Hash256 {
        digest(&self.to_bytes())
    }

    /// SHA-256d header hash (block-id convention for most parents)
    pub fn hash(&self) -> Hash256 {
        hash256(&self.to_bytes())
    }
}

/// A full parent-chain block candidate
///
/// Non-coinbase transactions are carried as raw bytes so opaque template
/// entries serialize back untouched.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub coinbase: Transaction,
    pub transactions: Vec<Bytes>,
}

impl Block {
    /// Serialize for `submitblock`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.encode(&mut w);
        w.put_varint(1 + self.transactions.len() as u64);
        self.coinbase.encode(&mut w);
        let mut out = w.into_bytes();
        for tx in &self.transactions {
            out.extend_from_slice(tx);
        }
        out
    }
}

/// Encode a block height the BIP34 way: minimal little-endian script push
pub fn encode_bip34_height(height: u32) -> Vec<u8> {
    if height == 0 {
        return vec![0x00]; // OP_0
    }
    let mut le = height.to_le_bytes().to_vec();
    while le.len() > 1 && le[le.len() - 1] == 0 {
        le.pop();
    }
    // A set high bit would flip the script-number sign
    if le[le.len() - 1] & 0x80 != 0 {
        le.push(0x00);
    }
    let mut out = Vec::with_capacity(1 + le.len());
    out.push(le.len() as u8);
    out.extend_from_slice(&le);
    out
}

/// Parse the BIP34 height prefix from a coinbase script
pub fn decode_bip34_height(script: &[u8]) -> Option<u32> {
    let len = *script.first()? as usize;
    if len == 0 || len > 4 || script.len() < 1 + len {
        return None;
    }
    let mut bytes = [0u8; 4];
    bytes[..len].copy_from_slice(&script[1..1 + len]);
    Some(u32::from_le_bytes(bytes))
}

/// Merged-mining commitment: magic, merkle root, tree size, index nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedMiningData {
    pub merkle_root: Hash256,
    pub size: u32,
    pub nonce: u32,
}

impl MergedMiningData {
    /// The 44-byte marker blob placed in coinbase data
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44);
        out.extend_from_slice(&MERGED_MINING_MAGIC);
        out.extend_from_slice(&self.merkle_root.0);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Scan coinbase data for the marker; the first occurrence wins
    pub fn find_in(script: &[u8]) -> Option<MergedMiningData> {
        let pos = script
            .windows(4)
            .position(|window| window == MERGED_MINING_MAGIC)?;
        let rest = &script[pos + 4..];
        if rest.len() < 40 {
            return None;
        }
        let merkle_root = Hash256::from_slice(&rest[..32])?;
        let size = u32::from_le_bytes(rest[32..36].try_into().ok()?);
        let nonce = u32::from_le_bytes(rest[36..40].try_into().ok()?);
        Some(MergedMiningData {
            merkle_root,
            size,
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = BlockHeader {
            version: 0x2000_0000,
            previous_block: hash256(b"prev"),
            merkle_root: hash256(b"root"),
            timestamp: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
        };
        let bytes = header.to_bytes();
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn bip34_round_trip() {
        for height in [1u32, 127, 128, 10_000, 840_000, 16_777_216] {
            let encoded = encode_bip34_height(height);
            assert_eq!(decode_bip34_height(&encoded), Some(height), "{}", height);
        }
    }

    #[test]
    fn bip34_high_bit_padded() {
        // 128 = 0x80 needs a zero pad byte to stay positive
        assert_eq!(encode_bip34_height(128), vec![0x02, 0x80, 0x00]);
    }

    #[test]
    fn merged_mining_marker_round_trip() {
        let data = MergedMiningData {
            merkle_root: hash256(b"aux"),
            size: 8,
            nonce: 1234,
        };
        let mut script = vec![0x03, 0x10, 0x27, 0x00];
        script.extend_from_slice(&data.to_bytes());
        script.extend_from_slice(b"extra");
        assert_eq!(MergedMiningData::find_in(&script), Some(data));
    }

    #[test]
    fn merged_mining_marker_truncated_rejected() {
        let mut script = MERGED_MINING_MAGIC.to_vec();
        script.extend_from_slice(&[0u8; 10]);
        assert_eq!(MergedMiningData::find_in(&script), None);
    }
}
