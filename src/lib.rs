//! # Constel — prime-constellation mining core
//!
//! A CPU miner for proof-of-work schemes whose unit of work is a prime
//! constellation: a fixed pattern of small offsets added to a base integer
//! such that every member is a probable prime. Given a block defining a large
//! target integer and a difficulty, the engine finds offsets above the target
//! whose candidates carry constellations of the requested length.
//!
//! ## Module Organization
//!
//! - [`primes`] — sieve-of-Eratosthenes prime table.
//! - [`modarith`] — reciprocal-based reduction of big integers by table
//!   primes (the mod phase's inner loop).
//! - [`target`] — block target derivation and primorial alignment.
//! - [`fermat`] — scalar and batched base-2 Fermat testing.
//! - [`miner`] — the three-phase pipeline (mod / sieve / check), worker
//!   pool, and per-block orchestration.
//! - [`params`] — configuration and derived sieve geometry.
//! - [`work`] — the [`work::WorkSource`] trait connecting the core to a
//!   pool, node, or benchmark driver.
//! - [`stats`] — atomic tuple counters and the progress reporter.
//!
//! ## Pipeline
//!
//! Per block: derive the target, align it to the primorial, fan prime-table
//! ranges out as mod jobs, sieve each instance segment by segment, and
//! Fermat-walk the surviving candidates. All phases run on one symmetric
//! thread pool fed through bounded queues; an adaptive controller keeps
//! enough verification work in flight to cover the sieve gap between blocks.

pub mod fermat;
pub mod miner;
pub mod modarith;
pub mod params;
pub mod primes;
pub mod stats;
pub mod target;
pub mod work;

pub use miner::Miner;
pub use params::{MinerOptions, Mode};
pub use work::{WorkData, WorkSource};
