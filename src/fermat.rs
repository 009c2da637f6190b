//! Fermat probable-prime testing.
//!
//! The verifier only ever needs probable primes: a composite slipping through
//! base-2 Fermat is caught upstream by whoever validates the submitted work,
//! so a single-base test is the fastest filter with acceptable error.

use rug::Integer;

/// Widest candidate (in bits) accepted by the batched path.
pub const MAX_BATCH_BITS: u32 = 2048;

/// Base-2 Fermat test: n is probably prime if 2^(n-1) ≡ 1 (mod n).
pub fn is_probable_prime(n: &Integer) -> bool {
    if *n < 2 {
        return false;
    }
    let exp = Integer::from(n - 1u32);
    match Integer::from(2).pow_mod(&exp, n) {
        Ok(r) => r == 1,
        Err(_) => false,
    }
}

/// Test a full verification batch at once.
///
/// The batch contract mirrors a rectangular SIMD kernel: every candidate must
/// occupy the same number of bits, and none may exceed [`MAX_BATCH_BITS`].
/// Returns None when the batch does not satisfy the contract; the caller then
/// falls back to per-candidate scalar tests.
pub fn test_batch(candidates: &[Integer]) -> Option<Vec<bool>> {
    let bits = candidates.first()?.significant_bits();
    if bits > MAX_BATCH_BITS {
        return None;
    }
    if candidates.iter().any(|c| c.significant_bits() != bits) {
        return None;
    }
    Some(candidates.iter().map(is_probable_prime).collect())
}
