//! Target and work arithmetic
//!
//! Conversions between compact "bits", 256-bit targets, expected attempt
//! counts, and the difficulty numbers miners see. Scrypt-facing difficulty
//! is scaled by `DUMB_SCRYPT_DIFF` to line up with SHA-256d conventions.

use uint::construct_uint;

use super::hash::Hash256;

construct_uint! {
    /// 256-bit unsigned integer for targets and cumulative work
    pub struct U256(4);
}

/// The target corresponding to difficulty 1 (compact 0x1d00ffff)
pub fn diff1_target() -> U256 {
    compact_to_target(0x1d00ffff)
}

/// Multiplier aligning Scrypt share difficulty with SHA-256d conventions
pub const DUMB_SCRYPT_DIFF: u64 = 1 << 16;

/// Decode compact "bits" into a target
///
/// Returns zero for zero/negative mantissas; saturates on exponent overflow
/// rather than wrapping.
pub fn compact_to_target(bits: u32) -> U256 {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return U256::zero();
    }
    let mantissa = U256::from(mantissa);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else if exponent > 32 {
        // A 23-bit mantissa shifted past byte 29 leaves the 256-bit range
        U256::MAX
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Encode a target in compact "bits" form (lossy, round-down)
pub fn target_to_compact(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bits_len = target.bits();
    let mut exponent = (bits_len + 7) / 8;
    let mut mantissa = if exponent <= 3 {
        (target << (8 * (3 - exponent))).low_u32()
    } else {
        (target >> (8 * (exponent - 3))).low_u32()
    };
    // High bit of the mantissa signals negative; bump the exponent instead
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }
    ((exponent as u32) << 24) | mantissa
}

/// Expected number of hash attempts to find a value at or under `target`
///
/// attempts = 2^256 / (target + 1), computed without overflowing 256 bits.
pub fn target_to_average_attempts(target: U256) -> U256 {
    if target == U256::MAX {
        return U256::one();
    }
    (U256::MAX - target) / (target + U256::one()) + U256::one()
}

/// Inverse of `target_to_average_attempts` (round-down)
pub fn average_attempts_to_target(attempts: U256) -> U256 {
    if attempts <= U256::one() {
        return U256::MAX;
    }
    (U256::MAX - (attempts - U256::one())) / attempts
}

/// Interpret a PoW hash as a 256-bit little-endian number
pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(&hash.0)
}

/// True when a PoW hash meets (is at or under) the target
pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    hash_to_u256(hash) <= *target
}

/// Difficulty number for a target, relative to difficulty 1
pub fn target_to_difficulty(target: U256) -> f64 {
    if target.is_zero() {
        return f64::INFINITY;
    }
    u256_to_f64(diff1_target()) / u256_to_f64(target)
}

/// Target for a difficulty number; zero and negative clamp to the maximum target
pub fn difficulty_to_target(difficulty: f64) -> U256 {
    if !(difficulty > 0.0) {
        return U256::MAX;
    }
    // Fixed-point divide: diff1 << 24 over difficulty scaled by 2^24 keeps
    // the integer path exact for any difficulty a miner can negotiate.
    let scaled = (difficulty * (1u64 << 24) as f64) as u128;
    if scaled == 0 {
        return U256::MAX;
    }
    let numerator = diff1_target() << 24;
    let target = numerator / U256::from(scaled);
    if target.is_zero() {
        U256::one()
    } else {
        target
    }
}

/// Scrypt-facing variant: miner-visible difficulty is 2^16 times larger
pub fn scrypt_difficulty_to_target(difficulty: f64) -> U256 {
    difficulty_to_target(difficulty * DUMB_SCRYPT_DIFF as f64)
}

/// Scrypt-facing variant of `target_to_difficulty`
pub fn target_to_scrypt_difficulty(target: U256) -> f64 {
    target_to_difficulty(target) / DUMB_SCRYPT_DIFF as f64
}

/// Lossy conversion for ratio computations (never used in consensus paths)
pub fn u256_to_f64(v: U256) -> f64 {
    let bits = v.bits();
    if bits <= 128 {
        v.low_u128() as f64
    } else {
        let shift = bits - 128;
        (v >> shift).low_u128() as f64 * (2f64).powi(shift as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff1_compact_round_trip() {
        let t = compact_to_target(0x1d00ffff);
        assert_eq!(target_to_compact(t), 0x1d00ffff);
    }

    #[test]
    fn compact_small_exponent() {
        // exponent 1: only the mantissa's top byte survives the shift
        let t = compact_to_target(0x01120000);
        assert_eq!(t, U256::from(0x12u64));
        let t = compact_to_target(0x03123456);
        assert_eq!(t, U256::from(0x123456u64));
        assert_eq!(target_to_compact(t), 0x03123456);
    }

    #[test]
    fn attempts_inverse_law() {
        for bits in [0x1d00ffffu32, 0x1c0fffff, 0x207fffff] {
            let t = compact_to_target(bits);
            let a = target_to_average_attempts(t);
            let back = average_attempts_to_target(a);
            // Round-trip is within one unit of rounding in the last place
            assert!(back >= t || t - back <= U256::one());
        }
    }

    #[test]
    fn max_target_is_one_attempt() {
        assert_eq!(target_to_average_attempts(U256::MAX), U256::one());
    }

    #[test]
    fn difficulty_one_is_diff1() {
        let t = difficulty_to_target(1.0);
        let ratio = target_to_difficulty(t);
        assert!((ratio - 1.0).abs() < 1e-6);
    }

    #[test]
    fn higher_difficulty_is_lower_target() {
        assert!(difficulty_to_target(400.0) < difficulty_to_target(100.0));
    }

    #[test]
    fn scrypt_difficulty_scales() {
        let base = difficulty_to_target(DUMB_SCRYPT_DIFF as f64);
        assert_eq!(scrypt_difficulty_to_target(1.0), base);
    }

    #[test]
    fn hash_meets_target_boundary() {
        let mut h = Hash256::ZERO;
        h.0[31] = 0x01; // most significant byte
        let just_below = hash_to_u256(&h) - U256::one();
        assert!(!hash_meets_target(&h, &just_below));
        assert!(hash_meets_target(&h, &hash_to_u256(&h)));
    }
}
