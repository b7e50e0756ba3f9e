//! Address and output-script translation
//!
//! Pure functions between parent-chain address strings and the scripts a
//! coinbase pays to. Handles base58check (P2PKH, P2SH) and bech32/bech32m
//! (P2WPKH, P2WSH, P2TR). Merged mining asks `convertible_pubkey_hash` to
//! decide whether a payout address can be re-expressed on another chain.

use bech32::{FromBase32, ToBase32, Variant};
use bytes::Bytes;
use thiserror::Error;

/// Per-chain address encoding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParams {
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    pub bech32_hrp: &'static str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address does not parse on this network")]
    Unparseable,
    #[error("unsupported witness program")]
    UnsupportedWitness,
}

/// Script templates this resolver understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutScript {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
    P2wpkh([u8; 20]),
    P2wsh([u8; 32]),
    P2tr([u8; 32]),
}

impl PayoutScript {
    pub fn to_script(&self) -> Bytes {
        let mut out = Vec::new();
        match self {
            PayoutScript::P2pkh(h) => {
                out.extend_from_slice(&[0x76, 0xa9, 0x14]); // DUP HASH160 PUSH20
                out.extend_from_slice(h);
                out.extend_from_slice(&[0x88, 0xac]); // EQUALVERIFY CHECKSIG
            }
            PayoutScript::P2sh(h) => {
                out.extend_from_slice(&[0xa9, 0x14]); // HASH160 PUSH20
                out.extend_from_slice(h);
                out.push(0x87); // EQUAL
            }
            PayoutScript::P2wpkh(h) => {
                out.extend_from_slice(&[0x00, 0x14]);
                out.extend_from_slice(h);
            }
            PayoutScript::P2wsh(h) => {
                out.extend_from_slice(&[0x00, 0x20]);
                out.extend_from_slice(h);
            }
            PayoutScript::P2tr(h) => {
                out.extend_from_slice(&[0x51, 0x20]); // OP_1 PUSH32
                out.extend_from_slice(h);
            }
        }
        Bytes::from(out)
    }

    /// Recognize one of the supported templates in raw script bytes
    pub fn from_script(script: &[u8]) -> Option<PayoutScript> {
        match script {
            [0x76, 0xa9, 0x14, h @ .., 0x88, 0xac] if h.len() == 20 => {
                Some(PayoutScript::P2pkh(h.try_into().ok()?))
            }
            [0xa9, 0x14, h @ .., 0x87] if h.len() == 20 => {
                Some(PayoutScript::P2sh(h.try_into().ok()?))
            }
            [0x00, 0x14, h @ ..] if h.len() == 20 => Some(PayoutScript::P2wpkh(h.try_into().ok()?)),
            [0x00, 0x20, h @ ..] if h.len() == 32 => Some(PayoutScript::P2wsh(h.try_into().ok()?)),
            [0x51, 0x20, h @ ..] if h.len() == 32 => Some(PayoutScript::P2tr(h.try_into().ok()?)),
            _ => None,
        }
    }
}

/// Translate an address string into its output script
pub fn address_to_script(address: &str, params: &AddressParams) -> Result<Bytes, AddressError> {
    // bech32 first: the HRP check is cheap and unambiguous
    if let Ok((hrp, data, variant)) = bech32::decode(address) {
        if hrp != params.bech32_hrp {
            return Err(AddressError::Unparseable);
        }
        if data.is_empty() {
            return Err(AddressError::Unparseable);
        }
        let witness_version = data[0].to_u8();
        let program =
            Vec::<u8>::from_base32(&data[1..]).map_err(|_| AddressError::Unparseable)?;
        return match (witness_version, program.len(), variant) {
            (0, 20, Variant::Bech32) => Ok(PayoutScript::P2wpkh(
                program.as_slice().try_into().unwrap(),
            )
            .to_script()),
            (0, 32, Variant::Bech32) => {
                Ok(PayoutScript::P2wsh(program.as_slice().try_into().unwrap()).to_script())
            }
            (1, 32, Variant::Bech32m) => {
                Ok(PayoutScript::P2tr(program.as_slice().try_into().unwrap()).to_script())
            }
            _ => Err(AddressError::UnsupportedWitness),
        };
    }

    let payload = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|_| AddressError::Unparseable)?;
    if payload.len() != 21 {
        return Err(AddressError::Unparseable);
    }
    let hash: [u8; 20] = payload[1..].try_into().unwrap();
    if payload[0] == params.p2pkh_version {
        Ok(PayoutScript::P2pkh(hash).to_script())
    } else if payload[0] == params.p2sh_version {
        Ok(PayoutScript::P2sh(hash).to_script())
    } else {
        Err(AddressError::Unparseable)
    }
}

/// Translate an output script back into an address, when one exists
pub fn script_to_address(script: &[u8], params: &AddressParams) -> Option<String> {
    match PayoutScript::from_script(script)? {
        PayoutScript::P2pkh(h) => {
            let mut payload = vec![params.p2pkh_version];
            payload.extend_from_slice(&h);
            Some(bs58::encode(payload).with_check().into_string())
        }
        PayoutScript::P2sh(h) => {
            let mut payload = vec![params.p2sh_version];
            payload.extend_from_slice(&h);
            Some(bs58::encode(payload).with_check().into_string())
        }
        PayoutScript::P2wpkh(h) => {
            let mut data = vec![bech32::u5::try_from_u8(0).ok()?];
            data.extend(h.to_base32());
            bech32::encode(params.bech32_hrp, data, Variant::Bech32).ok()
        }
        PayoutScript::P2wsh(h) => {
            let mut data = vec![bech32::u5::try_from_u8(0).ok()?];
            data.extend(h.to_base32());
            bech32::encode(params.bech32_hrp, data, Variant::Bech32).ok()
        }
        PayoutScript::P2tr(h) => {
            let mut data = vec![bech32::u5::try_from_u8(1).ok()?];
            data.extend(h.to_base32());
            bech32::encode(params.bech32_hrp, data, Variant::Bech32m).ok()
        }
    }
}

/// Pubkey hash extractable for cross-chain conversion, if any
///
/// Only key-hash scripts (P2PKH, P2WPKH) can be re-expressed on another
/// chain; script hashes and taproot outputs cannot.
pub fn convertible_pubkey_hash(script: &[u8]) -> Option<[u8; 20]> {
    match PayoutScript::from_script(script)? {
        PayoutScript::P2pkh(h) | PayoutScript::P2wpkh(h) => Some(h),
        _ => None,
    }
}

/// Synthesize a P2PKH script on another chain from a pubkey hash
pub fn synthesize_p2pkh(pubkey_hash: [u8; 20]) -> Bytes {
    PayoutScript::P2pkh(pubkey_hash).to_script()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PARAMS: AddressParams = AddressParams {
        p2pkh_version: 0x30,
        p2sh_version: 0x32,
        bech32_hrp: "ltc",
    };

    #[test]
    fn p2pkh_round_trip() {
        let script = PayoutScript::P2pkh([7u8; 20]).to_script();
        let address = script_to_address(&script, &TEST_PARAMS).unwrap();
        assert_eq!(address_to_script(&address, &TEST_PARAMS).unwrap(), script);
    }

    #[test]
    fn p2wpkh_round_trip() {
        let script = PayoutScript::P2wpkh([9u8; 20]).to_script();
        let address = script_to_address(&script, &TEST_PARAMS).unwrap();
        assert!(address.starts_with("ltc1"));
        assert_eq!(address_to_script(&address, &TEST_PARAMS).unwrap(), script);
    }

    #[test]
    fn p2tr_round_trip() {
        let script = PayoutScript::P2tr([3u8; 32]).to_script();
        let address = script_to_address(&script, &TEST_PARAMS).unwrap();
        assert_eq!(address_to_script(&address, &TEST_PARAMS).unwrap(), script);
    }

    #[test]
    fn wrong_network_rejected() {
        let script = PayoutScript::P2wpkh([9u8; 20]).to_script();
        let address = script_to_address(&script, &TEST_PARAMS).unwrap();
        let other = AddressParams {
            bech32_hrp: "dash",
            ..TEST_PARAMS
        };
        assert_eq!(
            address_to_script(&address, &other),
            Err(AddressError::Unparseable)
        );
    }

    #[test]
    fn convertibility() {
        assert!(convertible_pubkey_hash(&PayoutScript::P2pkh([1; 20]).to_script()).is_some());
        assert!(convertible_pubkey_hash(&PayoutScript::P2wpkh([1; 20]).to_script()).is_some());
        assert!(convertible_pubkey_hash(&PayoutScript::P2sh([1; 20]).to_script()).is_none());
        assert!(convertible_pubkey_hash(&PayoutScript::P2tr([1; 32]).to_script()).is_none());
    }

    #[test]
    fn garbage_rejected() {
        assert!(address_to_script("not-an-address", &TEST_PARAMS).is_err());
        assert!(PayoutScript::from_script(&[0xde, 0xad]).is_none());
    }
}
