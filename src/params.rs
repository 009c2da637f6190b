//! Miner configuration and derived sieve geometry.
//!
//! `MinerOptions` is what callers fill in (or take the defaults of);
//! `MinerParams` is the validated, resolved form the engine runs on. All
//! geometry that other modules rely on — sieve size, segment count, worker
//! offset deltas, half-step lattice indices — is derived once here so the hot
//! paths never re-check anything.

use anyhow::{ensure, Result};
use std::path::PathBuf;

/// Hard cap on the number of sieve workers (parallel sieve instances).
pub const MAX_SIEVE_WORKERS: usize = 16;
/// Candidate indices carried by one verification job.
pub const WORK_INDEXES: usize = 64;
/// Number of double-buffered per-block work slots.
pub const WORK_SLOTS: usize = 2;
/// Ring size of the store-amortizing pending buffer used while sieving.
pub const PENDING_SIZE: usize = 16;
/// Capacity of the per-thread spill stack for once-only prime hits.
pub const OFFSET_STACK_SIZE: usize = 16384;
/// Zero bits inserted between the leading 1 and the hash in the target.
pub const ZEROS_BEFORE_HASH: u32 = 8;
/// Reciprocal precomputation is valid up to p = 2^37; this is the
/// corresponding prime-table index bound.
pub const PRECOMP_INDEX_LIMIT: usize = 5_586_502_348;

/// The default constellation: sextuplets p, p+4, p+6, p+10, p+12, p+16,
/// given as step offsets between consecutive members.
pub const SEXTUPLET_PATTERN: [u64; 6] = [0, 4, 2, 4, 2, 4];

/// Known sextuplet bases usable as primorial offsets for the default
/// pattern. Each is the start of an actual prime sextuplet whose members all
/// exceed the largest default primorial prime, so every offset is admissible
/// modulo the primorial.
pub const SEXTUPLET_OFFSETS: [u64; 8] = [
    1_091_257, 1_615_837, 1_954_357, 2_822_707, 2_839_927, 3_243_337, 3_400_207, 6_005_887,
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Submit only full-length (or `tuple_length_min`) constellations.
    Solo,
    /// Submit gap-tolerant shares of length >= 4.
    Pool,
    /// No upstream: log found tuples and optionally append them to a file.
    Benchmark,
}

/// User-facing miner configuration.
#[derive(Clone, Debug)]
pub struct MinerOptions {
    pub threads: usize,
    /// Number of parallel sieve instances; 0 selects automatically from the
    /// thread count and prime table size.
    pub sieve_workers: usize,
    pub sieve_bits: u32,
    /// Per-block candidate-index range covered by the segmented sieve.
    pub max_increments: u64,
    pub prime_table_limit: u64,
    /// Number of leading table primes multiplied into the primorial.
    pub primorial_number: usize,
    /// One admissible offset per sieve worker, ascending.
    pub primorial_offsets: Vec<u64>,
    /// Constellation step offsets; `pattern[0]` must be 0.
    pub pattern: Vec<u64>,
    pub mode: Mode,
    pub tuple_length_min: u8,
    /// Gate for the batched verification path.
    pub batch_verify: bool,
    /// Benchmark mode: append found tuples here.
    pub tuples_file: Option<PathBuf>,
}

impl Default for MinerOptions {
    fn default() -> Self {
        MinerOptions {
            threads: 8,
            sieve_workers: 0,
            sieve_bits: 25,
            max_increments: 1 << 29,
            prime_table_limit: 1 << 31,
            primorial_number: 40,
            primorial_offsets: SEXTUPLET_OFFSETS.to_vec(),
            pattern: SEXTUPLET_PATTERN.to_vec(),
            mode: Mode::Benchmark,
            tuple_length_min: 6,
            batch_verify: true,
            tuples_file: None,
        }
    }
}

/// Validated configuration plus everything derived from it.
#[derive(Clone, Debug)]
pub struct MinerParams {
    pub threads: usize,
    pub sieve_workers: usize,
    pub sieve_bits: u32,
    pub sieve_size: u64,
    pub sieve_words: usize,
    pub max_increments: u64,
    pub max_iter: u64,
    pub prime_table_limit: u64,
    pub primorial_number: usize,
    pub primorial_offsets: Vec<u64>,
    pub pattern: Vec<u64>,
    /// `pattern[f] / 2`, the index into the 4-entry inverse lattice.
    pub half_pattern: Vec<usize>,
    /// Sum of all step offsets.
    pub tuple_span: u64,
    /// `offsets[w] - offsets[w-1] - tuple_span` for w in 1..sieve_workers.
    pub offset_diffs: Vec<u64>,
    /// `offsets[w] - offsets[0]` for each sieve worker.
    pub offset_to_first: Vec<u64>,
    pub mode: Mode,
    pub tuple_length_min: u8,
    pub batch_verify: bool,
    pub tuples_file: Option<PathBuf>,
}

impl MinerOptions {
    /// Validate and derive the run-time parameter set.
    pub fn resolve(&self) -> Result<MinerParams> {
        ensure!(self.threads >= 1, "at least one thread is required");
        ensure!(
            (10..=30).contains(&self.sieve_bits),
            "sieve_bits {} outside supported range 10..=30",
            self.sieve_bits
        );
        let sieve_size = 1u64 << self.sieve_bits;
        ensure!(
            self.max_increments >= sieve_size && self.max_increments % sieve_size == 0,
            "max_increments must be a positive multiple of the sieve size"
        );
        // Candidate indices travel as 32-bit values.
        ensure!(
            self.max_increments <= 1 << 32,
            "max_increments above 2^32 is not representable"
        );
        ensure!(self.prime_table_limit >= 1024, "prime table limit too small");
        ensure!(self.primorial_number >= 1, "primorial number must be >= 1");

        ensure!(!self.pattern.is_empty(), "constellation pattern is empty");
        ensure!(
            self.pattern[0] == 0,
            "constellation pattern must start at offset 0"
        );
        for &step in &self.pattern[1..] {
            // The mod phase moves between offset families with a 4-entry
            // multiple-of-inverse lattice, which only covers half-steps <= 3.
            ensure!(
                step > 0 && step % 2 == 0 && step <= 6,
                "pattern step {} unsupported (steps must be even and <= 6)",
                step
            );
        }
        let half_pattern: Vec<usize> = self.pattern.iter().map(|&o| (o >> 1) as usize).collect();
        let tuple_span: u64 = self.pattern.iter().sum();

        ensure!(
            (1..=self.pattern.len() as u8).contains(&self.tuple_length_min),
            "tuple_length_min must be between 1 and the pattern length"
        );

        let mut sieve_workers = self.sieve_workers;
        if sieve_workers == 0 {
            sieve_workers = (self.threads / 5).max(1)
                + ((self.prime_table_limit + 0x8000_0000) >> 33) as usize;
        }
        sieve_workers = sieve_workers
            .min(MAX_SIEVE_WORKERS)
            .min(self.primorial_offsets.len());
        ensure!(sieve_workers >= 1, "no primorial offsets configured");

        for w in 1..sieve_workers {
            ensure!(
                self.primorial_offsets[w] > self.primorial_offsets[w - 1] + tuple_span,
                "primorial offsets must be ascending with gaps wider than the tuple span"
            );
        }
        let offset_diffs: Vec<u64> = (1..sieve_workers)
            .map(|w| self.primorial_offsets[w] - self.primorial_offsets[w - 1] - tuple_span)
            .collect();
        let offset_to_first: Vec<u64> = (0..sieve_workers)
            .map(|w| self.primorial_offsets[w] - self.primorial_offsets[0])
            .collect();

        Ok(MinerParams {
            threads: self.threads,
            sieve_workers,
            sieve_bits: self.sieve_bits,
            sieve_size,
            sieve_words: (sieve_size / 64) as usize,
            max_increments: self.max_increments,
            max_iter: self.max_increments / sieve_size,
            prime_table_limit: self.prime_table_limit,
            primorial_number: self.primorial_number,
            primorial_offsets: self.primorial_offsets[..sieve_workers].to_vec(),
            pattern: self.pattern.clone(),
            half_pattern,
            tuple_span,
            offset_diffs,
            offset_to_first,
            mode: self.mode,
            tuple_length_min: self.tuple_length_min,
            batch_verify: self.batch_verify,
            tuples_file: self.tuples_file.clone(),
        })
    }
}

impl MinerParams {
    /// Empirical memory-usage estimate in MiB, calibrated for sextuplet
    /// patterns. Returns None for other pattern lengths.
    pub fn estimated_memory_mib(&self) -> Option<f64> {
        if self.pattern.len() != 6 {
            return None;
        }
        let ptl_m = self.prime_table_limit as f64 / 1_048_576.0;
        let base = 1.68 * ptl_m.powf(0.954);
        let per_worker = if ptl_m < 768.0 {
            1.26 * ptl_m + 16.0
        } else {
            560.0 * ptl_m.ln() - 2780.0
        };
        Some(base + self.sieve_workers as f64 * per_worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_resolve() {
        let params = MinerOptions::default().resolve().unwrap();
        assert_eq!(params.pattern, SEXTUPLET_PATTERN);
        assert_eq!(params.half_pattern, vec![0, 2, 1, 2, 1, 2]);
        assert_eq!(params.tuple_span, 16);
        assert_eq!(params.sieve_size, 1 << 25);
        assert_eq!(params.max_iter, (1 << 29) / (1 << 25));
        assert!(params.sieve_workers >= 1 && params.sieve_workers <= MAX_SIEVE_WORKERS);
    }

    #[test]
    fn auto_sieve_workers_grow_with_table_size() {
        let small = MinerOptions {
            prime_table_limit: 1 << 28,
            ..Default::default()
        };
        let large = MinerOptions {
            prime_table_limit: 1 << 31,
            ..Default::default()
        };
        let ws = small.resolve().unwrap().sieve_workers;
        let wl = large.resolve().unwrap().sieve_workers;
        assert!(wl >= ws, "larger tables should not get fewer workers");
    }

    #[test]
    fn sieve_workers_capped_by_offsets() {
        let options = MinerOptions {
            sieve_workers: 8,
            primorial_offsets: vec![1_091_257, 1_615_837],
            ..Default::default()
        };
        assert_eq!(options.resolve().unwrap().sieve_workers, 2);
    }

    #[test]
    fn offset_deltas_subtract_tuple_span() {
        let options = MinerOptions {
            sieve_workers: 3,
            ..Default::default()
        };
        let params = options.resolve().unwrap();
        assert_eq!(params.offset_diffs[0], 1_615_837 - 1_091_257 - 16);
        assert_eq!(params.offset_to_first[0], 0);
        assert_eq!(params.offset_to_first[1], 1_615_837 - 1_091_257);
    }

    #[test]
    fn odd_pattern_step_rejected() {
        let options = MinerOptions {
            pattern: vec![0, 4, 3],
            ..Default::default()
        };
        assert!(options.resolve().is_err());
    }

    #[test]
    fn wide_pattern_step_rejected() {
        // Half-steps above 3 are outside the inverse lattice.
        let options = MinerOptions {
            pattern: vec![0, 8],
            ..Default::default()
        };
        assert!(options.resolve().is_err());
    }

    #[test]
    fn misaligned_increments_rejected() {
        let options = MinerOptions {
            sieve_bits: 20,
            max_increments: (1 << 20) + 12,
            ..Default::default()
        };
        assert!(options.resolve().is_err());
    }

    #[test]
    fn memory_estimate_only_for_sextuplets() {
        let params = MinerOptions::default().resolve().unwrap();
        assert!(params.estimated_memory_mib().unwrap() > 0.0);

        let octuplet = MinerOptions {
            pattern: vec![0, 2, 4, 2, 4, 6, 2, 6],
            tuple_length_min: 8,
            primorial_offsets: vec![1_418_575_498_577],
            ..Default::default()
        };
        assert_eq!(octuplet.resolve().unwrap().estimated_memory_mib(), None);
    }
}
