//! Block target derivation.
//!
//! A block defines its mathematical target as a fixed bit layout: a leading 1,
//! eight zero bits, the 256 bits of the proof-of-work hash taken LSB-first per
//! byte, and enough trailing zeros to reach `difficulty` significant bits.
//! Candidates are then offsets above that target, pre-aligned to the primorial
//! so the sieve only ever walks multiples of it.

use crate::params::ZEROS_BEFORE_HASH;
use anyhow::{ensure, Result};
use rug::Integer;

/// Minimum difficulty expressible by the target layout.
pub const MIN_DIFFICULTY: u32 = 1 + ZEROS_BEFORE_HASH + 256;

/// Build the block target from the header hash and difficulty.
pub fn target_from_block(pow_hash: &[u8; 32], difficulty: u32) -> Result<Integer> {
    ensure!(
        difficulty >= MIN_DIFFICULTY,
        "difficulty {} below the minimum {}",
        difficulty,
        MIN_DIFFICULTY
    );
    let mut target = Integer::from(1);
    target <<= ZEROS_BEFORE_HASH;
    for i in 0..256usize {
        target <<= 1;
        if (pow_hash[i / 8] >> (i % 8)) & 1 == 1 {
            target += 1;
        }
    }
    target <<= difficulty - MIN_DIFFICULTY;
    Ok(target)
}

/// Distance from the target up to the first candidate of sieve worker 0:
/// the smallest non-negative value aligning `target` to a multiple of the
/// primorial, plus the first primorial offset.
pub fn remainder_primorial(target: &Integer, primorial: &Integer, first_offset: u64) -> Integer {
    let rem = Integer::from(target % primorial);
    let mut rem = Integer::from(primorial - rem);
    rem %= primorial;
    rem += first_offset;
    rem
}
