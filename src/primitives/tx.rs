//! Transaction types and serialization
//!
//! Structured transactions cover everything the node builds itself (the
//! coinbase above all). Template transactions from the parent node decode
//! through `RawTransaction`, which falls back to opaque bytes when the
//! structured decode fails, so extension-block payloads (MWEB HogEx and
//! friends) stay forwardable and includable without being understood.

use bytes::Bytes;

use super::encode::{CodecError, Reader, Writer};
use super::hash::{hash256, Hash256};

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// The null outpoint marking a coinbase input
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Bytes,
    pub sequence: u32,
    /// Segwit witness stack, empty for non-witness inputs
    pub witness: Vec<Bytes>,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Bytes,
}

/// A structured parent-chain transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

const MAX_TX_ITEMS: usize = 100_000;
const MAX_SCRIPT_LEN: usize = 1_000_000;

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    /// Serialize without witness data (the txid form)
    pub fn encode_base(&self, w: &mut Writer) {
        w.put_i32(self.version);
        w.put_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            w.put_hash(&input.prevout.txid);
            w.put_u32(input.prevout.vout);
            w.put_var_bytes(&input.script_sig);
            w.put_u32(input.sequence);
        }
        w.put_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            w.put_u64(output.value);
            w.put_var_bytes(&output.script_pubkey);
        }
        w.put_u32(self.lock_time);
    }

    /// Full serialization, with the segwit marker and witnesses when present
    pub fn encode(&self, w: &mut Writer) {
        if !self.has_witness() {
            return self.encode_base(w);
        }
        w.put_i32(self.version);
        w.put_u8(0x00); // segwit marker
        w.put_u8(0x01); // segwit flag
        w.put_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            w.put_hash(&input.prevout.txid);
            w.put_u32(input.prevout.vout);
            w.put_var_bytes(&input.script_sig);
            w.put_u32(input.sequence);
        }
        w.put_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            w.put_u64(output.value);
            w.put_var_bytes(&output.script_pubkey);
        }
        for input in &self.inputs {
            w.put_varint(input.witness.len() as u64);
            for item in &input.witness {
                w.put_var_bytes(item);
            }
        }
        w.put_u32(self.lock_time);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    /// Transaction id: hash of the serialization without witness data
    pub fn txid(&self) -> Hash256 {
        let mut w = Writer::new();
        self.encode_base(&mut w);
        hash256(&w.into_bytes())
    }

    /// Witness transaction id: hash of the full serialization
    pub fn wtxid(&self) -> Hash256 {
        hash256(&self.to_bytes())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let mut count = r.read_count(MAX_TX_ITEMS)?;
        let mut segwit = false;
        if count == 0 {
            // Either a segwit marker or a genuinely empty input list
            let flag = r.read_u8()?;
            if flag != 0x01 {
                return Err(CodecError::Malformed("segwit flag"));
            }
            segwit = true;
            count = r.read_count(MAX_TX_ITEMS)?;
        }
        let mut inputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let txid = r.read_hash()?;
            let vout = r.read_u32()?;
            let script_sig = r.read_var_bytes(MAX_SCRIPT_LEN)?;
            let sequence = r.read_u32()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }
        let out_count = r.read_count(MAX_TX_ITEMS)?;
        let mut outputs = Vec::with_capacity(out_count.min(1024));
        for _ in 0..out_count {
            let value = r.read_u64()?;
            let script_pubkey = r.read_var_bytes(MAX_SCRIPT_LEN)?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        if segwit {
            for input in &mut inputs {
                let items = r.read_count(MAX_TX_ITEMS)?;
                for _ in 0..items {
                    input.witness.push(r.read_var_bytes(MAX_SCRIPT_LEN)?);
                }
            }
        }
        let lock_time = r.read_u32()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let tx = Self::decode(&mut r)?;
        r.finish()?;
        Ok(tx)
    }
}

/// A template transaction that may or may not decode structurally
///
/// Opaque entries keep the raw serialization; the id comes from the template
/// (the parent node already told us the hash, we never need to recompute it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTransaction {
    Decoded(Transaction),
    Opaque(Bytes),
}

impl RawTransaction {
    /// Decode if possible, otherwise keep the bytes as-is
    pub fn parse(bytes: Bytes) -> Self {
        match Transaction::from_bytes(&bytes) {
            Ok(tx) => RawTransaction::Decoded(tx),
            Err(_) => RawTransaction::Opaque(bytes),
        }
    }

    /// The exact bytes that go into a block
    pub fn raw_bytes(&self) -> Bytes {
        match self {
            RawTransaction::Decoded(tx) => Bytes::from(tx.to_bytes()),
            RawTransaction::Opaque(bytes) => bytes.clone(),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, RawTransaction::Opaque(_))
    }
}
