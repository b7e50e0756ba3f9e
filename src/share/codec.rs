//! Versioned share wire codec
//!
//! One byte of version, then a length-prefixed payload. The payload layout
//! is version-gated: pre-V34 shares carry inline transaction hash lists,
//! V35 adds the segwit commitment, V36 adds merged payout destinations.
//! `pack_share_info` doubles as the reference-hash commitment encoding, so
//! the bytes that travel are exactly the bytes that are hash-committed.

use bytes::Bytes;

use crate::primitives::encode::{CodecError, Reader, Writer};
use crate::primitives::hash::Hash256;

use super::hash_link::HashLink;
use super::{
    MergedAddress, MinHeader, Share, ShareInfo, ShareVersion, StaleInfo, MAX_MERGED_ADDRESSES,
};

/// Upper bound on a packed share payload; V34+ shares sit around 1 kB
pub const MAX_SHARE_SIZE: usize = 16 * 1024;

const MAX_COINBASE_DATA: usize = 100;
const MAX_INLINE_TX_HASHES: usize = 128;
const MAX_TX_REFS: usize = 128;
const MAX_MERKLE_LINK: usize = 16;
const MAX_MERGED_SCRIPT: usize = 64;

fn put_opt_hash(w: &mut Writer, h: &Option<Hash256>) {
    match h {
        Some(h) => w.put_hash(h),
        None => w.put_hash(&Hash256::ZERO),
    }
}

fn read_opt_hash(r: &mut Reader<'_>) -> Result<Option<Hash256>, CodecError> {
    let h = r.read_hash()?;
    Ok(if h.is_zero() { None } else { Some(h) })
}

/// Deterministic encoding of the hash-committed share payload
pub fn pack_share_info(version: ShareVersion, info: &ShareInfo) -> Vec<u8> {
    let mut w = Writer::with_capacity(256);
    put_opt_hash(&mut w, &info.previous_share_hash);
    w.put_var_bytes(&info.coinbase);
    w.put_u32(info.nonce);
    w.put_slice(&info.pubkey_hash);
    w.put_u64(info.subsidy);
    w.put_u16(info.donation);
    w.put_u8(info.stale_info.as_u8());
    w.put_u16(info.desired_version);
    put_opt_hash(&mut w, &info.far_share_hash);
    w.put_u32(info.bits);
    w.put_u32(info.timestamp);
    w.put_u32(info.absheight);
    w.put_slice(&info.abswork.to_le_bytes());
    if version.carries_inline_txs() {
        w.put_varint(info.new_transaction_hashes.len() as u64);
        for h in &info.new_transaction_hashes {
            w.put_hash(h);
        }
        w.put_varint(info.transaction_hash_refs.len() as u64);
        for (share_count, tx_count) in &info.transaction_hash_refs {
            w.put_varint(*share_count);
            w.put_varint(*tx_count);
        }
    }
    if version.supports_segwit_commitment() {
        match &info.segwit_commitment {
            Some(h) => {
                w.put_u8(1);
                w.put_hash(h);
            }
            None => w.put_u8(0),
        }
    }
    if version.commits_merged_addresses() {
        w.put_u8(info.merged_addresses.len() as u8);
        for entry in &info.merged_addresses {
            w.put_u32(entry.chain_id);
            w.put_var_bytes(&entry.script);
        }
    }
    w.into_bytes()
}

fn unpack_share_info(version: ShareVersion, r: &mut Reader<'_>) -> Result<ShareInfo, CodecError> {
    let previous_share_hash = read_opt_hash(r)?;
    let coinbase = r.read_var_bytes(MAX_COINBASE_DATA)?;
    let nonce = r.read_u32()?;
    let pubkey_hash: [u8; 20] = r
        .read_bytes(20)?
        .try_into()
        .map_err(|_| CodecError::UnexpectedEof)?;
    let subsidy = r.read_u64()?;
    let donation = r.read_u16()?;
    if donation > 1000 {
        return Err(CodecError::Malformed("donation over 1000/1000"));
    }
    let stale_info = StaleInfo::from_u8(r.read_u8()?)?;
    let desired_version = r.read_u16()?;
    let far_share_hash = read_opt_hash(r)?;
    let bits = r.read_u32()?;
    let timestamp = r.read_u32()?;
    let absheight = r.read_u32()?;
    let abswork = u128::from_le_bytes(
        r.read_bytes(16)?
            .try_into()
            .map_err(|_| CodecError::UnexpectedEof)?,
    );

    let mut new_transaction_hashes = Vec::new();
    let mut transaction_hash_refs = Vec::new();
    if version.carries_inline_txs() {
        let count = r.read_count(MAX_INLINE_TX_HASHES)?;
        for _ in 0..count {
            new_transaction_hashes.push(r.read_hash()?);
        }
        let count = r.read_count(MAX_TX_REFS)?;
        for _ in 0..count {
            transaction_hash_refs.push((r.read_varint()?, r.read_varint()?));
        }
    }

    let segwit_commitment = if version.supports_segwit_commitment() {
        match r.read_u8()? {
            0 => None,
            1 => Some(r.read_hash()?),
            _ => return Err(CodecError::Malformed("segwit flag")),
        }
    } else {
        None
    };

    let mut merged_addresses = Vec::new();
    if version.commits_merged_addresses() {
        let count = r.read_u8()? as usize;
        if count > MAX_MERGED_ADDRESSES {
            return Err(CodecError::Oversized {
                max: MAX_MERGED_ADDRESSES,
                got: count,
            });
        }
        for _ in 0..count {
            let chain_id = r.read_u32()?;
            let script = r.read_var_bytes(MAX_MERGED_SCRIPT)?;
            merged_addresses.push(MergedAddress { chain_id, script });
        }
    }

    Ok(ShareInfo {
        previous_share_hash,
        coinbase,
        nonce,
        pubkey_hash,
        subsidy,
        donation,
        stale_info,
        desired_version,
        far_share_hash,
        bits,
        timestamp,
        absheight,
        abswork,
        new_transaction_hashes,
        transaction_hash_refs,
        segwit_commitment,
        merged_addresses,
    })
}

/// Serialize a share for the wire and for chunk files
pub fn pack_share(share: &Share) -> Vec<u8> {
    let mut payload = Writer::with_capacity(512);
    payload.put_i32(share.min_header.version);
    payload.put_hash(&share.min_header.previous_block);
    payload.put_u32(share.min_header.timestamp);
    payload.put_u32(share.min_header.bits);
    payload.put_u32(share.min_header.nonce);
    payload.put_slice(&pack_share_info(share.version, &share.info));
    share.hash_link.encode(&mut payload);
    payload.put_u8(share.merkle_link.len() as u8);
    for h in &share.merkle_link {
        payload.put_hash(h);
    }

    let mut w = Writer::with_capacity(payload.len() + 4);
    w.put_u8(share.version.as_u16() as u8);
    w.put_var_bytes(&payload.into_bytes());
    w.into_bytes()
}

/// Parse one share from a reader (frames may carry several back to back)
pub fn unpack_share(r: &mut Reader<'_>) -> Result<Share, CodecError> {
    let version = ShareVersion::from_u16(r.read_u8()? as u16)?;
    let payload = r.read_var_bytes(MAX_SHARE_SIZE)?;
    let mut inner = Reader::new(&payload);

    let min_header = MinHeader {
        version: inner.read_i32()?,
        previous_block: inner.read_hash()?,
        timestamp: inner.read_u32()?,
        bits: inner.read_u32()?,
        nonce: inner.read_u32()?,
    };
    let info = unpack_share_info(version, &mut inner)?;
    let hash_link = HashLink::decode(&mut inner)?;
    let link_len = inner.read_u8()? as usize;
    if link_len > MAX_MERKLE_LINK {
        return Err(CodecError::Oversized {
            max: MAX_MERKLE_LINK,
            got: link_len,
        });
    }
    let mut merkle_link = Vec::with_capacity(link_len);
    for _ in 0..link_len {
        merkle_link.push(inner.read_hash()?);
    }
    inner.finish()?;

    Ok(Share {
        version,
        min_header,
        info,
        hash_link,
        merkle_link,
    })
}

/// Parse a share from a standalone byte string
pub fn share_from_bytes(bytes: &[u8]) -> Result<Share, CodecError> {
    let mut r = Reader::new(bytes);
    let share = unpack_share(&mut r)?;
    r.finish()?;
    Ok(share)
}

/// Convenience wrapper used by gossip and persistence
pub fn share_to_bytes(share: &Share) -> Bytes {
    Bytes::from(pack_share(share))
}
