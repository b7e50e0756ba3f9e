//! Share-network wire protocol
//!
//! Frames are `magic(8) command(12, nul-padded ascii) length(u32 LE)
//! checksum(first 4 of hash256(payload)) payload`. Payloads use the
//! consensus codec. The framing codec plugs into `tokio_util`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tokio_util::codec::{Decoder, Encoder};

use crate::primitives::block::BlockHeader;
use crate::primitives::encode::{CodecError, Reader, Writer};
use crate::primitives::hash::{hash256, Hash256};
use crate::share::codec::{pack_share, unpack_share};
use crate::share::Share;

/// Hard cap on one frame's payload
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;
/// Most hashes any single tx-announcement message may carry
pub const MAX_TX_ANNOUNCE: usize = 10_000;
/// Most shares in one `shares` or `sharereply` message
pub const MAX_SHARES_PER_MESSAGE: usize = 256;
/// Most peer addresses per `addrs`
pub const MAX_ADDRS: usize = 1000;

/// A peer address with freshness metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub timestamp: u64,
    pub addr: SocketAddr,
}

/// Messages of the share network
#[derive(Debug, Clone, PartialEq)]
pub enum P2pMessage {
    Version {
        protocol_version: u32,
        subversion: String,
        best_share_hash: Option<Hash256>,
        /// Random per-connection value for self-connect detection
        nonce: u64,
    },
    Verack,
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    GetAddrs {
        count: u32,
    },
    Addrs {
        addrs: Vec<PeerAddr>,
    },
    Shares {
        shares: Vec<Share>,
    },
    ShareReq {
        id: u64,
        hashes: Vec<Hash256>,
        parents: u64,
        stops: Vec<Hash256>,
    },
    ShareReply {
        id: u64,
        result: ShareReplyResult,
        shares: Vec<Share>,
    },
    HaveTx {
        tx_hashes: Vec<Hash256>,
    },
    LosingTx {
        tx_hashes: Vec<Hash256>,
    },
    RememberTx {
        tx_hashes: Vec<Hash256>,
        txs: Vec<Bytes>,
    },
    ForgetTx {
        tx_hashes: Vec<Hash256>,
    },
    BestBlockHeader {
        header: BlockHeader,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareReplyResult {
    Ok,
    None,
}

impl P2pMessage {
    pub fn command(&self) -> &'static str {
        match self {
            P2pMessage::Version { .. } => "version",
            P2pMessage::Verack => "verack",
            P2pMessage::Ping { .. } => "ping",
            P2pMessage::Pong { .. } => "pong",
            P2pMessage::GetAddrs { .. } => "getaddrs",
            P2pMessage::Addrs { .. } => "addrs",
            P2pMessage::Shares { .. } => "shares",
            P2pMessage::ShareReq { .. } => "sharereq",
            P2pMessage::ShareReply { .. } => "sharereply",
            P2pMessage::HaveTx { .. } => "have_tx",
            P2pMessage::LosingTx { .. } => "losing_tx",
            P2pMessage::RememberTx { .. } => "remember_tx",
            P2pMessage::ForgetTx { .. } => "forget_tx",
            P2pMessage::BestBlockHeader { .. } => "bestblock",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            P2pMessage::Version {
                protocol_version,
                subversion,
                best_share_hash,
                nonce,
            } => {
                w.put_u32(*protocol_version);
                w.put_var_bytes(subversion.as_bytes());
                match best_share_hash {
                    Some(h) => w.put_hash(h),
                    None => w.put_hash(&Hash256::ZERO),
                }
                w.put_u64(*nonce);
            }
            P2pMessage::Verack => {}
            P2pMessage::Ping { nonce } | P2pMessage::Pong { nonce } => w.put_u64(*nonce),
            P2pMessage::GetAddrs { count } => w.put_u32(*count),
            P2pMessage::Addrs { addrs } => {
                w.put_varint(addrs.len() as u64);
                for entry in addrs {
                    w.put_u64(entry.timestamp);
                    put_socket_addr(&mut w, &entry.addr);
                }
            }
            P2pMessage::Shares { shares } => {
                w.put_varint(shares.len() as u64);
                for share in shares {
                    w.put_slice(&pack_share(share));
                }
            }
            P2pMessage::ShareReq {
                id,
                hashes,
                parents,
                stops,
            } => {
                w.put_u64(*id);
                put_hashes(&mut w, hashes);
                w.put_varint(*parents);
                put_hashes(&mut w, stops);
            }
            P2pMessage::ShareReply { id, result, shares } => {
                w.put_u64(*id);
                w.put_u8(match result {
                    ShareReplyResult::Ok => 0,
                    ShareReplyResult::None => 1,
                });
                w.put_varint(shares.len() as u64);
                for share in shares {
                    w.put_slice(&pack_share(share));
                }
            }
            P2pMessage::HaveTx { tx_hashes }
            | P2pMessage::LosingTx { tx_hashes }
            | P2pMessage::ForgetTx { tx_hashes } => put_hashes(&mut w, tx_hashes),
            P2pMessage::RememberTx { tx_hashes, txs } => {
                put_hashes(&mut w, tx_hashes);
                w.put_varint(txs.len() as u64);
                for tx in txs {
                    w.put_var_bytes(tx);
                }
            }
            P2pMessage::BestBlockHeader { header } => header.encode(&mut w),
        }
        w.into_bytes()
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => {
                let protocol_version = r.read_u32()?;
                let subversion = String::from_utf8(r.read_var_bytes(256)?.to_vec())
                    .map_err(|_| CodecError::Malformed("subversion utf8"))?;
                let hash = r.read_hash()?;
                let best_share_hash = if hash.is_zero() { None } else { Some(hash) };
                let nonce = r.read_u64()?;
                P2pMessage::Version {
                    protocol_version,
                    subversion,
                    best_share_hash,
                    nonce,
                }
            }
            "verack" => P2pMessage::Verack,
            "ping" => P2pMessage::Ping {
                nonce: r.read_u64()?,
            },
            "pong" => P2pMessage::Pong {
                nonce: r.read_u64()?,
            },
            "getaddrs" => P2pMessage::GetAddrs {
                count: r.read_u32()?,
            },
            "addrs" => {
                let count = r.read_count(MAX_ADDRS)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = r.read_u64()?;
                    let addr = read_socket_addr(&mut r)?;
                    addrs.push(PeerAddr { timestamp, addr });
                }
                P2pMessage::Addrs { addrs }
            }
            "shares" => P2pMessage::Shares {
                shares: read_shares(&mut r)?,
            },
            "sharereq" => {
                let id = r.read_u64()?;
                let hashes = read_hashes(&mut r)?;
                let parents = r.read_varint()?;
                let stops = read_hashes(&mut r)?;
                P2pMessage::ShareReq {
                    id,
                    hashes,
                    parents,
                    stops,
                }
            }
            "sharereply" => {
                let id = r.read_u64()?;
                let result = match r.read_u8()? {
                    0 => ShareReplyResult::Ok,
                    1 => ShareReplyResult::None,
                    _ => return Err(CodecError::Malformed("sharereply result")),
                };
                let shares = read_shares(&mut r)?;
                P2pMessage::ShareReply { id, result, shares }
            }
            "have_tx" => P2pMessage::HaveTx {
                tx_hashes: read_hashes(&mut r)?,
            },
            "losing_tx" => P2pMessage::LosingTx {
                tx_hashes: read_hashes(&mut r)?,
            },
            "remember_tx" => {
                let tx_hashes = read_hashes(&mut r)?;
                let count = r.read_count(MAX_TX_ANNOUNCE)?;
                let mut txs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    txs.push(r.read_var_bytes(MAX_PAYLOAD)?);
                }
                P2pMessage::RememberTx { tx_hashes, txs }
            }
            "forget_tx" => P2pMessage::ForgetTx {
                tx_hashes: read_hashes(&mut r)?,
            },
            "bestblock" => P2pMessage::BestBlockHeader {
                header: BlockHeader::decode(&mut r)?,
            },
            _ => return Err(CodecError::Malformed("unknown command")),
        };
        r.finish()?;
        Ok(message)
    }
}

fn put_hashes(w: &mut Writer, hashes: &[Hash256]) {
    w.put_varint(hashes.len() as u64);
    for h in hashes {
        w.put_hash(h);
    }
}

fn read_hashes(r: &mut Reader<'_>) -> Result<Vec<Hash256>, CodecError> {
    let count = r.read_count(MAX_TX_ANNOUNCE)?;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(r.read_hash()?);
    }
    Ok(out)
}

fn read_shares(r: &mut Reader<'_>) -> Result<Vec<Share>, CodecError> {
    let count = r.read_count(MAX_SHARES_PER_MESSAGE)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(unpack_share(r)?);
    }
    Ok(out)
}

/// Addresses travel as 16-byte IPv6 (v4-mapped) plus big-endian port,
/// matching the parent network's convention
fn put_socket_addr(w: &mut Writer, addr: &SocketAddr) {
    let v6 = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    w.put_slice(&v6.octets());
    w.put_slice(&addr.port().to_be_bytes());
}

fn read_socket_addr(r: &mut Reader<'_>) -> Result<SocketAddr, CodecError> {
    let octets: [u8; 16] = r
        .read_bytes(16)?
        .try_into()
        .map_err(|_| CodecError::UnexpectedEof)?;
    let port_bytes = r.read_bytes(2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    let v6 = Ipv6Addr::from(octets);
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Length-delimited frame codec bound to one network's wire prefix
pub struct FrameCodec {
    wire_prefix: [u8; 8],
}

impl FrameCodec {
    pub fn new(wire_prefix: [u8; 8]) -> Self {
        Self { wire_prefix }
    }
}

const HEADER_LEN: usize = 8 + 12 + 4 + 4;

impl Encoder<P2pMessage> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, message: P2pMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = message.encode_payload();
        let mut command = [0u8; 12];
        let name = message.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        let checksum = hash256(&payload);

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&self.wire_prefix);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum.0[..4]);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = P2pMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<P2pMessage>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[..8] != self.wire_prefix {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad wire magic",
            ));
        }
        let length = u32::from_le_bytes([src[20], src[21], src[22], src[23]]) as usize;
        if length > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized frame",
            ));
        }
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let command_bytes = &src[8..20];
        let command_end = command_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(command_bytes.len());
        let command = std::str::from_utf8(&command_bytes[..command_end])
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad command encoding")
            })?
            .to_string();
        let checksum: [u8; 4] = src[24..28].try_into().expect("fixed slice");

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        if hash256(&payload).0[..4] != checksum {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad frame checksum",
            ));
        }
        let message = P2pMessage::decode_payload(&command, &payload).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad payload: {}", e),
            )
        })?;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::testutil::sample_share;
    use crate::share::ShareVersion;

    fn round_trip(message: P2pMessage) {
        let mut codec = FrameCodec::new(*b"testwire");
        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_round_trips() {
        round_trip(P2pMessage::Version {
            protocol_version: 3600,
            subversion: "peerpool-node/0.1.0".to_string(),
            best_share_hash: Some(hash256(b"tip")),
            nonce: 0xdead_beef,
        });
        round_trip(P2pMessage::Verack);
        round_trip(P2pMessage::Ping { nonce: 7 });
        round_trip(P2pMessage::Addrs {
            addrs: vec![PeerAddr {
                timestamp: 1_700_000_000,
                addr: "10.1.2.3:7903".parse().unwrap(),
            }],
        });
        round_trip(P2pMessage::Shares {
            shares: vec![sample_share(ShareVersion::V36)],
        });
        round_trip(P2pMessage::ShareReq {
            id: 1,
            hashes: vec![hash256(b"a")],
            parents: 100,
            stops: vec![hash256(b"b")],
        });
        round_trip(P2pMessage::RememberTx {
            tx_hashes: vec![hash256(b"t")],
            txs: vec![Bytes::from_static(&[1, 2, 3])],
        });
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = FrameCodec::new(*b"testwire");
        let mut buf = BytesMut::new();
        codec
            .encode(P2pMessage::Ping { nonce: 1 }, &mut buf)
            .unwrap();
        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn corrupt_checksum_rejected() {
        let mut codec = FrameCodec::new(*b"testwire");
        let mut buf = BytesMut::new();
        codec
            .encode(P2pMessage::Ping { nonce: 1 }, &mut buf)
            .unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut codec = FrameCodec::new(*b"testwire");
        let mut buf = BytesMut::new();
        codec.encode(P2pMessage::Verack, &mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(codec.decode(&mut buf).is_err());
    }
}
