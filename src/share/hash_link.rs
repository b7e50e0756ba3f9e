//! SHA-256 midstate continuation for gentx hash commitments
//!
//! A share does not carry the full generation transaction; it carries the
//! compression-function state after the prefix, the unaligned tail bytes,
//! and the prefix length. A verifier appends the constant suffix and the
//! reference hash to recompute the gentx hash without ever seeing the body.

use sha2::compress256;
use sha2::digest::generic_array::GenericArray;

use crate::primitives::encode::{CodecError, Reader, Writer};
use crate::primitives::hash::Hash256;
use sha2::{Digest, Sha256};

/// SHA-256 initialization vector
const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Midstate over a message prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashLink {
    /// Compression state after all complete 64-byte blocks of the prefix
    pub state: [u32; 8],
    /// Prefix bytes past the last complete block (always < 64)
    pub tail: Vec<u8>,
    /// Total prefix length in bytes
    pub length: u64,
}

impl HashLink {
    /// Capture the midstate of `prefix`
    pub fn from_prefix(prefix: &[u8]) -> Self {
        let mut state = SHA256_IV;
        let whole = prefix.len() / 64 * 64;
        for chunk in prefix[..whole].chunks_exact(64) {
            let block = GenericArray::clone_from_slice(chunk);
            compress256(&mut state, &[block]);
        }
        Self {
            state,
            tail: prefix[whole..].to_vec(),
            length: prefix.len() as u64,
        }
    }

    /// Double SHA-256 of `prefix || suffix`, continuing from the midstate
    pub fn finalize(&self, suffix: &[u8]) -> Hash256 {
        let total_len = self.length + suffix.len() as u64;
        let mut state = self.state;

        // Rebuild the unprocessed message: tail, suffix, then SHA-256 padding
        let mut rest = Vec::with_capacity(self.tail.len() + suffix.len() + 72);
        rest.extend_from_slice(&self.tail);
        rest.extend_from_slice(suffix);
        rest.push(0x80);
        while (rest.len() + 8) % 64 != 0 {
            rest.push(0x00);
        }
        rest.extend_from_slice(&(total_len * 8).to_be_bytes());

        for chunk in rest.chunks_exact(64) {
            let block = GenericArray::clone_from_slice(chunk);
            compress256(&mut state, &[block]);
        }

        let mut first = [0u8; 32];
        for (i, word) in state.iter().enumerate() {
            first[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        Hash256(Sha256::digest(first).into())
    }

    pub fn encode(&self, w: &mut Writer) {
        for word in self.state {
            w.put_u32(word);
        }
        w.put_var_bytes(&self.tail);
        w.put_u64(self.length);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let mut state = [0u32; 8];
        for word in state.iter_mut() {
            *word = r.read_u32()?;
        }
        let tail = r.read_var_bytes(63)?.to_vec();
        let length = r.read_u64()?;
        if length % 64 != tail.len() as u64 % 64 {
            return Err(CodecError::Malformed("hash link tail length"));
        }
        Ok(Self {
            state,
            tail,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::hash::hash256;

    #[test]
    fn matches_direct_hash_across_block_boundaries() {
        // Prefix lengths straddling 64-byte blocks and suffixes of mixed size
        for prefix_len in [0usize, 1, 55, 63, 64, 65, 100, 128, 200] {
            for suffix_len in [0usize, 4, 32, 70] {
                let prefix: Vec<u8> = (0..prefix_len).map(|i| i as u8).collect();
                let suffix: Vec<u8> = (0..suffix_len).map(|i| (i * 7) as u8).collect();
                let link = HashLink::from_prefix(&prefix);
                let direct = {
                    let mut all = prefix.clone();
                    all.extend_from_slice(&suffix);
                    hash256(&all)
                };
                assert_eq!(
                    link.finalize(&suffix),
                    direct,
                    "prefix {} suffix {}",
                    prefix_len,
                    suffix_len
                );
            }
        }
    }

    #[test]
    fn codec_round_trip() {
        let link = HashLink::from_prefix(&[0xabu8; 100]);
        let mut w = Writer::new();
        link.encode(&mut w);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(HashLink::decode(&mut r).unwrap(), link);
        r.finish().unwrap();
    }

    #[test]
    fn inconsistent_tail_rejected() {
        let link = HashLink {
            state: SHA256_IV,
            tail: vec![0u8; 10],
            length: 64, // tail says 10 bytes past the block boundary
        };
        let mut w = Writer::new();
        link.encode(&mut w);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert!(HashLink::decode(&mut r).is_err());
    }
}
