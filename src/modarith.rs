//! Division-free modular reduction by word-sized primes.
//!
//! The mod phase reduces one large integer (the aligned block target) modulo
//! every prime in a multi-gigabyte table. Hardware 128/64 division is far too
//! slow for that, so each prime gets a single precomputed 64-bit reciprocal
//! of its normalized form `p << clz(p)`; reduction then costs a few multiplies
//! and shifts per limb.
//!
//! ## Reference
//!
//! - Niels Möller and Torbjörn Granlund, "Improved Division by Invariant
//!   Integers", IEEE Transactions on Computers, 60(2):165–175, 2011
//!   (algorithm 4, the 2/1 division with a precomputed reciprocal).

/// Reciprocal of the normalized divisor `p << clz(p)`:
/// `floor((2^128 - 1) / (p << clz(p))) - 2^64`.
pub fn reciprocal(p: u64) -> u64 {
    debug_assert!(p > 1);
    let d = p << p.leading_zeros();
    ((u128::MAX / d as u128) - (1u128 << 64)) as u64
}

/// Remainder of the two-limb value `nh * 2^64 + nl` divided by the normalized
/// divisor `d`, using its reciprocal `v`. Requires `nh < d` and `d` with its
/// top bit set.
#[inline]
fn div2by1_rem(nh: u64, nl: u64, d: u64, v: u64) -> u64 {
    debug_assert!(nh < d);
    debug_assert!(d >> 63 == 1);
    // q = (v + 2^64) * nh + nl; the high half is a quotient estimate that is
    // at most 1 too small after the +1 below.
    let q = (v as u128) * (nh as u128) + (((nh as u128) << 64) | nl as u128);
    let q1 = ((q >> 64) as u64).wrapping_add(1);
    let q0 = q as u64;
    let mut r = nl.wrapping_sub(q1.wrapping_mul(d));
    if r > q0 {
        r = r.wrapping_add(d);
    }
    if r >= d {
        r -= d;
    }
    r
}

/// Remainder of a little-endian limb vector modulo `p`, using the
/// precomputed reciprocal `v` of `p`'s normalized form.
pub fn rem_limbs(limbs: &[u64], p: u64, v: u64) -> u64 {
    let s = p.leading_zeros();
    let d = p << s;
    // Process the left-shifted value 64 bits at a time, most significant
    // chunk first. The spill-over top chunk is below 2^s <= 2^63 <= d.
    let mut r = match limbs.last() {
        Some(&hi) if s > 0 => hi >> (64 - s),
        _ => 0,
    };
    for i in (0..limbs.len()).rev() {
        let lo = if i > 0 { limbs[i - 1] } else { 0 };
        let chunk = if s == 0 {
            limbs[i]
        } else {
            (limbs[i] << s) | (lo >> (64 - s))
        };
        r = div2by1_rem(r, chunk, d, v);
    }
    r >> s
}

/// Remainder of a little-endian limb vector modulo `p`, plain u128 division.
/// Fallback for primes without a precomputed reciprocal.
pub fn rem_limbs_plain(limbs: &[u64], p: u64) -> u64 {
    let mut r = 0u128;
    for &l in limbs.iter().rev() {
        r = ((r << 64) | l as u128) % p as u128;
    }
    r as u64
}

/// `(a * b) mod p` for `a < p` and arbitrary `b`, via the reciprocal `v`.
#[inline]
pub fn mul_rem(a: u64, b: u64, p: u64, v: u64) -> u64 {
    debug_assert!(a < p);
    let s = p.leading_zeros();
    let d = p << s;
    // Keep one factor pre-shifted so the 2/1 division reduces against the
    // normalized divisor and the true remainder falls out with one shift.
    let prod = ((a << s) as u128) * b as u128;
    div2by1_rem((prod >> 64) as u64, prod as u64, d, v) >> s
}

#[cfg(test)]
mod tests {
    use super::*;
    use rug::integer::Order;
    use rug::Integer;

    const MODULI: [u64; 12] = [
        3, 5, 7, 13, 97, 251, 65_537, 1_000_003, 2_147_483_647, 8_589_934_583_u64,
        137_438_953_481, 9_223_372_036_854_775_783,
    ];

    fn big(limbs: &[u64]) -> Integer {
        Integer::from_digits(limbs, Order::Lsf)
    }

    #[test]
    fn rem_limbs_matches_bigint_remainder() {
        let samples: Vec<Vec<u64>> = vec![
            vec![],
            vec![0],
            vec![1],
            vec![u64::MAX],
            vec![0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210],
            vec![u64::MAX; 5],
            vec![42, 0, 0, 7, u64::MAX, 1],
        ];
        for limbs in &samples {
            for &p in &MODULI {
                let v = reciprocal(p);
                let expected = big(limbs) % p;
                assert_eq!(
                    rem_limbs(limbs, p, v),
                    expected.to_u64().unwrap(),
                    "limbs {:x?} mod {}",
                    limbs,
                    p
                );
            }
        }
    }

    #[test]
    fn plain_and_reciprocal_paths_agree() {
        let limbs = [0xdead_beef_cafe_f00d_u64, 0x1234_5678_9abc_def0, 17];
        for &p in &MODULI {
            assert_eq!(rem_limbs(&limbs, p, reciprocal(p)), rem_limbs_plain(&limbs, p));
        }
    }

    #[test]
    fn mul_rem_matches_u128_arithmetic() {
        for &p in &MODULI {
            let v = reciprocal(p);
            for &a in &[0u64, 1, 2, p / 2, p - 1] {
                for &b in &[0u64, 1, 7, 0x1234_5678, u64::MAX - 3, u64::MAX] {
                    let expected = ((a as u128 * b as u128) % p as u128) as u64;
                    assert_eq!(mul_rem(a, b, p, v), expected, "{} * {} mod {}", a, b, p);
                }
            }
        }
    }

    /// The smallest table prime: p = 2 normalizes to 2^63 and its reciprocal
    /// must still reduce correctly.
    #[test]
    fn smallest_prime() {
        let v = reciprocal(2);
        assert_eq!(rem_limbs(&[5], 2, v), 1);
        assert_eq!(rem_limbs(&[u64::MAX, u64::MAX], 2, v), 1);
        assert_eq!(mul_rem(1, u64::MAX, 2, v), 1);
    }

    #[test]
    fn empty_limbs_are_zero() {
        assert_eq!(rem_limbs(&[], 97, reciprocal(97)), 0);
        assert_eq!(rem_limbs_plain(&[], 97), 0);
    }
}
