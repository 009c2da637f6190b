//! Work interchange with the outside world.
//!
//! The miner core never talks to a pool or node itself; it pulls candidate
//! blocks from a [`WorkSource`] and hands results back through it. The same
//! trait also carries the per-test statistics hook so a frontend can compute
//! candidate rates and tuple ratios without the core knowing how they are
//! displayed.

use rug::Integer;

/// One unit of work as seen by the miner, plus the fields it writes back.
#[derive(Clone, Debug, Default)]
pub struct WorkData {
    pub height: u32,
    pub difficulty: u32,
    /// 256-bit header pre-image digest the target is built from.
    pub pow_hash: [u8; 32],
    /// Output: little-endian offset of the found constellation base above the
    /// target.
    pub n_offset: [u8; 32],
    /// Output: length of the found tuple.
    pub tuple_length: u8,
    /// Benchmark override: use this integer as the target instead of deriving
    /// one from `pow_hash`/`difficulty`.
    pub bench_target: Option<Integer>,
}

/// Upstream supplier of blocks and sink for results.
///
/// `get_work` may block; returning false terminates the miner. `submit_work`
/// is fire-and-forget. `inc_tuple_count(0)` is invoked once per Fermat
/// attempt and `inc_tuple_count(k)` once for every candidate reaching tuple
/// length k.
pub trait WorkSource: Sync {
    fn get_work(&self, work: &mut WorkData) -> bool;
    fn submit_work(&self, work: &WorkData);
    fn inc_tuple_count(&self, length: usize);
}
