//! The candidate-generation pipeline.
//!
//! Mining one block is a three-phase affair spread over a symmetric pool of
//! worker threads:
//!
//! 1. **mod** — for every table prime, compute where each offset family of
//!    each sieve worker first lands in the candidate-index space. Small
//!    primes go into a dense per-prime offset table; primes above the
//!    per-block range hit at most once and spill into per-segment buckets.
//! 2. **sieve** — turn the offset tables into a composite bitmap one segment
//!    at a time, apply the spill buckets, and scan the zero bits into
//!    verification jobs of up to [`WORK_INDEXES`] candidate indices.
//! 3. **check** — reconstruct each candidate integer, Fermat-test it, walk
//!    the remaining constellation offsets, and submit anything long enough.
//!
//! The thread that calls [`Miner::run`] is the master: it publishes per-block
//! state into one of two double-buffered slots, fans out mod jobs, enforces
//! the mod-before-sieve barrier with per-sieve locks, and retunes the
//! in-flight work target from queue depths after every block. Every other
//! thread just loops over the bounded job queues. Block staleness is a
//! monotonic height counter checked cooperatively at the start of every
//! expensive stretch; stale work is simply dropped, never submitted.

use crate::fermat;
use crate::modarith;
use crate::params::{
    MinerOptions, MinerParams, Mode, OFFSET_STACK_SIZE, PENDING_SIZE, PRECOMP_INDEX_LIMIT,
    WORK_INDEXES, WORK_SLOTS,
};
use crate::primes;
use crate::target;
use crate::work::{WorkData, WorkSource};
use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use rug::integer::Order;
use rug::Integer;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

const MOD_QUEUE_DEPTH: usize = 1024;
const PRIORITY_QUEUE_DEPTH: usize = 1024;
const VERIFY_QUEUE_DEPTH: usize = 4096;
const DONE_QUEUE_DEPTH: usize = 9216;

/// A unit of work flowing through the job queues.
enum Job {
    /// Compute first sieve indices for primes in `[start, end)`.
    Mod {
        slot: usize,
        start: usize,
        end: usize,
    },
    /// Run the full segmented sieve of one sieve instance.
    Sieve { slot: usize, sieve_id: usize },
    /// Fermat-test a batch of candidate indices.
    Check(CheckJob),
    /// No-op used to wake a thread blocked on the queues.
    Wake,
}

struct CheckJob {
    slot: usize,
    /// Segment the indices were extracted from.
    segment: u64,
    /// Which sieve worker (and therefore primorial offset) produced them.
    offset_id: usize,
    indexes: Vec<u32>,
}

/// Completion tokens consumed by the master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Done {
    /// A check job of the given slot retired.
    Tests(usize),
    SieveDone,
    /// A mod job covering primes from `start` finished.
    ModDone { start: usize },
}

struct Channels {
    mod_tx: Sender<Job>,
    mod_rx: Receiver<Job>,
    prio_tx: Sender<Job>,
    prio_rx: Receiver<Job>,
    verify_tx: Sender<Job>,
    verify_rx: Receiver<Job>,
    done_tx: Sender<Done>,
    done_rx: Receiver<Done>,
}

impl Channels {
    fn new() -> Channels {
        let (mod_tx, mod_rx) = bounded(MOD_QUEUE_DEPTH);
        let (prio_tx, prio_rx) = bounded(PRIORITY_QUEUE_DEPTH);
        let (verify_tx, verify_rx) = bounded(VERIFY_QUEUE_DEPTH);
        let (done_tx, done_rx) = bounded(DONE_QUEUE_DEPTH);
        Channels {
            mod_tx,
            mod_rx,
            prio_tx,
            prio_rx,
            verify_tx,
            verify_rx,
            done_tx,
            done_rx,
        }
    }
}

/// One sieve worker's buffers. The dense offset table and the spill buckets
/// are written during the mod phase (disjoint prime ranges, slots reserved
/// through the atomic counters) and consumed by whichever thread runs the
/// sieve job; `mod_lock` is how the master delays that consumption until the
/// whole mod phase has landed.
struct SieveInstance {
    id: usize,
    mod_lock: Mutex<()>,
    bitmap: Mutex<Vec<u64>>,
    /// `offsets[i * pattern_len + f]`: next sieve index of family f of prime i.
    offsets: Vec<AtomicU32>,
    /// `segment_hits[segment][slot]`: once-only hits, valid up to the
    /// matching `segment_counts` entry.
    segment_hits: Vec<Vec<AtomicU32>>,
    segment_counts: Vec<AtomicU64>,
}

/// Per-block state double-buffered across [`WORK_SLOTS`] slots.
struct WorkSlot {
    state: RwLock<SlotState>,
    height: AtomicU32,
    outstanding: AtomicU64,
}

#[derive(Default)]
struct SlotState {
    target: Integer,
    remainder_primorial: Integer,
    block: WorkData,
}

/// Thread-local spill buffers for once-only prime hits, allocated once per
/// worker at spawn.
struct SpillBufs {
    stacks: Vec<Vec<u32>>,
    counts: Vec<Vec<u64>>,
}

impl SpillBufs {
    fn new(workers: usize, segments: usize) -> SpillBufs {
        SpillBufs {
            stacks: (0..workers)
                .map(|_| Vec::with_capacity(OFFSET_STACK_SIZE))
                .collect(),
            counts: (0..workers).map(|_| vec![0u64; segments]).collect(),
        }
    }

    fn reset(&mut self) {
        for s in &mut self.stacks {
            s.clear();
        }
        for c in &mut self.counts {
            c.fill(0);
        }
    }
}

/// Store-amortizing ring buffer for bitmap writes. Slot value 0 doubles as
/// the empty sentinel; a dropped hit at index 0 is caught by the Fermat
/// stage.
struct Pending {
    ring: [u32; PENDING_SIZE],
    pos: usize,
}

impl Pending {
    fn new() -> Pending {
        Pending {
            ring: [0; PENDING_SIZE],
            pos: 0,
        }
    }

    #[inline]
    fn add(&mut self, bitmap: &mut [u64], ent: u32, sieve_size: u64) {
        let old = self.ring[self.pos];
        if old != 0 {
            let old = if (old as u64) < sieve_size {
                old
            } else {
                warn!(
                    index = old,
                    sieve_size,
                    "pending store out of range, clamping; check hardware stability"
                );
                sieve_size as u32 - 1
            };
            bitmap[(old >> 6) as usize] |= 1 << (old & 63);
        }
        self.ring[self.pos] = ent;
        self.pos = (self.pos + 1) & (PENDING_SIZE - 1);
    }

    fn flush(&mut self, bitmap: &mut [u64], sieve_size: u64) {
        for &old in &self.ring {
            if old != 0 {
                debug_assert!((old as u64) < sieve_size);
                bitmap[(old >> 6) as usize] |= 1 << (old & 63);
            }
        }
        self.ring = [0; PENDING_SIZE];
        self.pos = 0;
    }
}

/// Master-local flow control over how many check jobs may be in flight.
struct FlowControl {
    max_work_out: u32,
    allowed_fails: u32,
}

/// Retune the in-flight target after a block, from the verify-queue depth at
/// block start (`cur`) and its minimum during the sieve drain (`min`).
fn retune(flow: &mut FlowControl, cur: u32, min: u32, threads: u32, sieve_workers: u32) {
    if cur > flow.max_work_out.saturating_sub(2 * threads) {
        if min == 0 {
            // Hit the target but drained dry: supply more, amount unknown.
            flow.max_work_out += 4 * threads * sieve_workers;
        } else {
            // Steer towards a minimum depth of 4 * threads.
            let target = flow.max_work_out.saturating_sub(min) + 8 * threads;
            flow.max_work_out = (flow.max_work_out + target) / 2;
        }
    } else if min > 4 * threads {
        let target = cur.saturating_sub(min) + 10 * threads;
        flow.max_work_out = (flow.max_work_out + target) / 2;
    } else if min == 0 && cur > 0 {
        flow.allowed_fails -= 1;
        if flow.allowed_fails == 0 {
            flow.allowed_fails = 5;
            warn!("unable to generate enough verification work to keep threads busy");
        }
    }
    flow.max_work_out = flow
        .max_work_out
        .min((DONE_QUEUE_DEPTH as u32).saturating_sub(9 * threads));
}

pub struct Miner {
    params: MinerParams,
    primes: Vec<u64>,
    n_primes: usize,
    starting_prime_index: usize,
    /// First prime index whose prime can hit each block at most once.
    sparse_limit: usize,
    entries_per_segment: usize,
    primorial: Integer,
    /// `primorial^-1 mod primes[i]`; entries below the primorial are unused.
    inverts: Vec<u64>,
    /// Granlund-Möller reciprocals, one 64-bit constant per prime.
    recips: Vec<u64>,
    sieves: Vec<SieveInstance>,
    slots: [WorkSlot; WORK_SLOTS],
    current_height: AtomicU32,
    running: AtomicBool,
    ch: Channels,
    tuple_file_lock: Mutex<()>,
}

impl Miner {
    /// Build all tables and buffers. This is the expensive, one-off part:
    /// the prime table, the primorial, the inverse and reciprocal tables
    /// (sharded over rayon), and the per-sieve-worker allocations.
    pub fn new(options: &MinerOptions) -> Result<Miner> {
        let params = options.resolve()?;
        info!(
            threads = params.threads,
            sieve_workers = params.sieve_workers,
            pattern = ?params.pattern,
            "miner configuration resolved"
        );
        if let Some(mib) = params.estimated_memory_mib() {
            if mib < 128.0 {
                info!("estimated memory usage: < 128 MiB");
            } else {
                info!("estimated memory usage: {:.0} MiB (reduce the prime table limit to lower this)", mib);
            }
        }

        let started = Instant::now();
        info!(limit = params.prime_table_limit, "generating prime table");
        let primes = primes::generate_primes(params.prime_table_limit);
        let mut n_primes = primes.len();
        info!(
            count = n_primes,
            elapsed = ?started.elapsed(),
            "prime table ready"
        );
        ensure!(
            params.primorial_number < n_primes,
            "prime table too small for primorial number {}",
            params.primorial_number
        );

        let mut primorial = Integer::from(primes[0]);
        for &p in &primes[1..params.primorial_number] {
            primorial *= p;
        }
        info!(
            bits = primorial.significant_bits(),
            "primorial computed"
        );

        let starting_prime_index = params.primorial_number;
        let started = Instant::now();
        let mut inverts = vec![0u64; n_primes];
        {
            use rayon::prelude::*;
            inverts[starting_prime_index..]
                .par_iter_mut()
                .zip(primes[starting_prime_index..].par_iter())
                .try_for_each(|(slot, &p)| -> Result<()> {
                    let modulus = Integer::from(p);
                    let inv = primorial
                        .invert_ref(&modulus)
                        .ok_or_else(|| anyhow!("primorial has no inverse modulo {}", p))?;
                    *slot = Integer::from(inv)
                        .to_u64()
                        .context("modular inverse exceeds one word")?;
                    Ok(())
                })?;
        }
        let precomp_limit = n_primes.min(PRECOMP_INDEX_LIMIT);
        let recips: Vec<u64> = {
            use rayon::prelude::*;
            primes[..precomp_limit]
                .par_iter()
                .map(|&p| modarith::reciprocal(p))
                .collect()
        };
        info!(elapsed = ?started.elapsed(), "division data precomputed");

        // Split the table: primes below the per-block range land in the dense
        // offset table, the rest hit at most once per block and get bucketed
        // per segment.
        let mut prime_store_size = 0usize;
        let mut sparse_limit = 0usize;
        let mut high_floats = 0f64;
        let tuple_len_f = params.pattern.len() as f64;
        for (i, &p) in primes.iter().enumerate().take(n_primes).skip(5) {
            if p < params.max_increments {
                prime_store_size += 1;
            } else {
                if sparse_limit == 0 {
                    sparse_limit = i & !1;
                }
                high_floats += tuple_len_f * params.max_increments as f64 / p as f64;
            }
        }
        if sparse_limit == 0 {
            n_primes &= !1;
            sparse_limit = n_primes;
        }
        let high_entries = high_floats.ceil() as u64;
        let entries_per_segment = if high_entries == 0 {
            1
        } else {
            let e = high_entries / params.max_iter + 4;
            (e + (e >> 3)) as usize
        };
        debug!(
            sparse_limit,
            entries_per_segment, prime_store_size, "sieve split points"
        );

        let offsets_len = (prime_store_size + 1024) * params.pattern.len();
        debug!(
            sieve_bytes = params.sieve_words * 8 * params.sieve_workers,
            offset_bytes = offsets_len * 4 * params.sieve_workers,
            segment_hit_bytes =
                entries_per_segment * params.max_iter as usize * 4 * params.sieve_workers,
            "allocating sieve buffers"
        );
        let sieves: Vec<SieveInstance> = (0..params.sieve_workers)
            .map(|id| SieveInstance {
                id,
                mod_lock: Mutex::new(()),
                bitmap: Mutex::new(vec![0u64; params.sieve_words]),
                offsets: (0..offsets_len).map(|_| AtomicU32::new(0)).collect(),
                segment_hits: (0..params.max_iter)
                    .map(|_| (0..entries_per_segment).map(|_| AtomicU32::new(0)).collect())
                    .collect(),
                segment_counts: (0..params.max_iter).map(|_| AtomicU64::new(0)).collect(),
            })
            .collect();

        Ok(Miner {
            params,
            primes,
            n_primes,
            starting_prime_index,
            sparse_limit,
            entries_per_segment,
            primorial,
            inverts,
            recips,
            sieves,
            slots: [
                WorkSlot {
                    state: RwLock::new(SlotState::default()),
                    height: AtomicU32::new(0),
                    outstanding: AtomicU64::new(0),
                },
                WorkSlot {
                    state: RwLock::new(SlotState::default()),
                    height: AtomicU32::new(0),
                    outstanding: AtomicU64::new(0),
                },
            ],
            current_height: AtomicU32::new(0),
            running: AtomicBool::new(false),
            ch: Channels::new(),
            tuple_file_lock: Mutex::new(()),
        })
    }

    pub fn params(&self) -> &MinerParams {
        &self.params
    }

    /// Signal that the chain tip moved; all in-flight work for other heights
    /// is abandoned at the next cancellation point.
    pub fn update_height(&self, height: u32) {
        self.current_height.store(height, Ordering::Release);
    }

    /// Check jobs currently queued or executing, across both slots.
    pub fn outstanding_tests(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.outstanding.load(Ordering::Relaxed))
            .sum()
    }

    /// Mine blocks from `source` until it reports no more work. The calling
    /// thread orchestrates; `threads - 1` spawned workers plus the remaining
    /// capacity of the caller's pool run the actual jobs.
    pub fn run(&self, source: &dyn WorkSource) {
        let mut first = WorkData::default();
        if !source.get_work(&mut first) {
            return;
        }
        self.running.store(true, Ordering::Release);
        thread::scope(|s| {
            for _ in 0..self.params.threads {
                s.spawn(move || self.worker_loop(source));
            }
            self.master_loop(source, first);
            self.running.store(false, Ordering::Release);
            for _ in 0..self.params.threads {
                self.ch
                    .prio_tx
                    .send(Job::Wake)
                    .expect("job queue disconnected");
            }
        });
    }

    // ── Worker side ─────────────────────────────────────────────────

    fn worker_loop(&self, source: &dyn WorkSource) {
        let mut spill = SpillBufs::new(self.params.sieve_workers, self.params.max_iter as usize);
        while self.running.load(Ordering::Acquire) {
            match self.next_job() {
                Job::Mod { slot, start, end } => {
                    self.update_remainders(slot, start, end, &mut spill);
                    self.ch
                        .done_tx
                        .send(Done::ModDone { start })
                        .expect("done queue disconnected");
                }
                Job::Sieve { slot, sieve_id } => {
                    self.run_sieve(sieve_id, slot);
                    self.ch
                        .done_tx
                        .send(Done::SieveDone)
                        .expect("done queue disconnected");
                }
                Job::Check(job) => {
                    let slot = job.slot;
                    self.verify_candidates(job, source);
                    self.ch
                        .done_tx
                        .send(Done::Tests(slot))
                        .expect("done queue disconnected");
                }
                Job::Wake => {}
            }
        }
    }

    /// Pop the next job: the mod queue has priority, then the sieve/wake
    /// lane, then verification work; block on all three otherwise.
    fn next_job(&self) -> Job {
        if let Ok(job) = self.ch.mod_rx.try_recv() {
            return job;
        }
        if let Ok(job) = self.ch.prio_rx.try_recv() {
            return job;
        }
        select! {
            recv(self.ch.mod_rx) -> job => job.expect("job queue disconnected"),
            recv(self.ch.prio_rx) -> job => job.expect("job queue disconnected"),
            recv(self.ch.verify_rx) -> job => job.expect("job queue disconnected"),
        }
    }

    // ── Mod phase ───────────────────────────────────────────────────

    /// For every prime in `[start, end)`, deposit the first sieve index of
    /// each offset family of each sieve worker into the dense offset table
    /// (small primes) or the per-segment spill buckets (once-only primes).
    fn update_remainders(&self, slot: usize, start: usize, end: usize, spill: &mut SpillBufs) {
        let (tar, height) = {
            let st = self.slots[slot].state.read().unwrap();
            (
                Integer::from(&st.target + &st.remainder_primorial),
                st.block.height,
            )
        };
        let tar_limbs: Vec<u64> = tar.to_digits(Order::Lsf);
        let workers = self.params.sieve_workers;
        spill.reset();

        for i in start..end {
            let p = self.primes[i];
            let inv0 = self.inverts[i];
            let once_only = i >= self.sparse_limit;

            // First-family index for sieve worker 0: the smallest j with
            // primorial * j + tar divisible by p.
            let rem = if i < self.recips.len() {
                modarith::rem_limbs(&tar_limbs, p, self.recips[i])
            } else {
                modarith::rem_limbs_plain(&tar_limbs, p)
            };
            let pa = p - rem;
            let mut index: u64 = if pa == p {
                0
            } else if i < self.recips.len() {
                modarith::mul_rem(pa, inv0, p, self.recips[i])
            } else {
                ((pa as u128 * inv0 as u128) % p as u128) as u64
            };
            debug_assert!(index < p);

            // Multiples of the inverse for half-steps 1..=3; moving from one
            // offset family to the next subtracts one of these.
            let mut invert = [inv0, 0, 0, 0];
            invert[1] = invert[0] << 1;
            if invert[1] >= p {
                invert[1] -= p;
            }
            invert[2] = invert[1] << 1;
            if invert[2] >= p {
                invert[2] -= p;
            }
            invert[3] = invert[1] + invert[2];
            if invert[3] >= p {
                invert[3] -= p;
            }

            if !self.add_to_offsets(0, i, p, &invert, &mut index, once_only, height, spill) {
                spill.reset();
                return;
            }
            if workers == 1 {
                continue;
            }

            // Shift the running index from one sieve worker's base to the
            // next; the delta only changes when the offset spacing does.
            let mut r = 0u64;
            for w in 1..workers {
                let diff = self.params.offset_diffs[w - 1];
                if w == 1 || diff != self.params.offset_diffs[w - 2] {
                    r = if diff < p {
                        if i < self.recips.len() {
                            modarith::mul_rem(diff, inv0, p, self.recips[i])
                        } else {
                            ((diff as u128 * inv0 as u128) % p as u128) as u64
                        }
                    } else {
                        ((diff as u128 * inv0 as u128) % p as u128) as u64
                    };
                }
                if index < r {
                    index += p;
                }
                index -= r;
                if !self.add_to_offsets(w, i, p, &invert, &mut index, once_only, height, spill) {
                    spill.reset();
                    return;
                }
            }
        }

        if end > self.sparse_limit {
            for w in 0..workers {
                if !spill.stacks[w].is_empty() {
                    self.put_offsets_in_segments(w, spill);
                }
            }
        }
    }

    /// Walk the offset families of one prime for one sieve worker, leaving
    /// `index` at the last family. Returns false if the block went stale.
    #[allow(clippy::too_many_arguments)]
    fn add_to_offsets(
        &self,
        w: usize,
        prime_index: usize,
        p: u64,
        invert: &[u64; 4],
        index: &mut u64,
        once_only: bool,
        height: u32,
        spill: &mut SpillBufs,
    ) -> bool {
        let pattern_len = self.params.pattern.len();
        if !once_only {
            let offsets = &self.sieves[w].offsets;
            let base = prime_index * pattern_len;
            offsets[base].store(*index as u32, Ordering::Relaxed);
            for f in 1..pattern_len {
                let step = invert[self.params.half_pattern[f]];
                if *index < step {
                    *index += p;
                }
                *index -= step;
                offsets[base + f].store(*index as u32, Ordering::Relaxed);
            }
        } else {
            if spill.stacks[w].len() + pattern_len >= OFFSET_STACK_SIZE {
                if self.current_height.load(Ordering::Acquire) != height {
                    return false;
                }
                self.put_offsets_in_segments(w, spill);
            }
            if *index < self.params.max_increments {
                spill.counts[w][(*index >> self.params.sieve_bits) as usize] += 1;
                spill.stacks[w].push(*index as u32);
            }
            for f in 1..pattern_len {
                let step = invert[self.params.half_pattern[f]];
                if *index < step {
                    *index += p;
                }
                *index -= step;
                if *index < self.params.max_increments {
                    spill.counts[w][(*index >> self.params.sieve_bits) as usize] += 1;
                    spill.stacks[w].push(*index as u32);
                }
            }
        }
        true
    }

    /// Flush one worker's spill stack into its segment-hit buckets. Slots
    /// are reserved with one atomic add per segment, so concurrent mod
    /// workers never collide. Bucket overflow means the sizing estimate was
    /// violated and the block state would be corrupt: abort.
    fn put_offsets_in_segments(&self, w: usize, spill: &mut SpillBufs) {
        let sieve = &self.sieves[w];
        let counts = &mut spill.counts[w];
        let stack = &mut spill.stacks[w];
        for (segment, count) in counts.iter_mut().enumerate() {
            let reserved = sieve.segment_counts[segment].fetch_add(*count, Ordering::Relaxed);
            let total = reserved + *count;
            assert!(
                total < self.entries_per_segment as u64,
                "segment {} hit bucket overflow: {} >= {}",
                segment,
                total,
                self.entries_per_segment
            );
            *count = reserved;
        }
        let mask = self.params.sieve_size as u32 - 1;
        for &index in stack.iter() {
            let segment = (index >> self.params.sieve_bits) as usize;
            let slot = counts[segment] as usize;
            sieve.segment_hits[segment][slot].store(index & mask, Ordering::Relaxed);
            counts[segment] += 1;
        }
        stack.clear();
        counts.fill(0);
    }

    // ── Sieve phase ─────────────────────────────────────────────────

    /// Sieve all segments of one instance, emitting check jobs as candidate
    /// indices are extracted.
    fn run_sieve(&self, sieve_id: usize, slot: usize) {
        let sieve = &self.sieves[sieve_id];
        let height = self.slots[slot].height.load(Ordering::Acquire);
        let mut bitmap = sieve.bitmap.lock().unwrap();
        let pattern_len = self.params.pattern.len();
        let sieve_size = self.params.sieve_size;
        // Held from the first segment-hit application to the end of the
        // block so the master's mod-phase barrier works.
        let mut mod_guard = None;

        for segment in 0..self.params.max_iter {
            if self.current_height.load(Ordering::Acquire) != height {
                break;
            }
            bitmap.fill(0);

            // Align the dense loop to an even prime index, processing any
            // leading prime directly.
            let mut start_i = self.starting_prime_index;
            while start_i & 1 != 0 {
                let p = self.primes[start_i];
                for f in 0..pattern_len {
                    let cell = &sieve.offsets[start_i * pattern_len + f];
                    let mut off = cell.load(Ordering::Relaxed) as u64;
                    while off < sieve_size {
                        bitmap[(off >> 6) as usize] |= 1 << (off & 63);
                        off += p;
                    }
                    cell.store((off - sieve_size) as u32, Ordering::Relaxed);
                }
                start_i += 1;
            }

            self.process_sieve(&mut bitmap, &sieve.offsets, start_i, self.sparse_limit);

            // All spill buckets for this instance are final once the master
            // releases this lock.
            if segment == 0 {
                mod_guard = Some(sieve.mod_lock.lock().unwrap());
            }
            let mut pending = Pending::new();
            let count = sieve.segment_counts[segment as usize].load(Ordering::Relaxed) as usize;
            for s in 0..count {
                let hit = sieve.segment_hits[segment as usize][s].load(Ordering::Relaxed);
                pending.add(&mut bitmap, hit, sieve_size);
            }
            pending.flush(&mut bitmap, sieve_size);

            if self.current_height.load(Ordering::Acquire) != height {
                break;
            }

            // Candidate extraction: negate so clear bits become set, then
            // peel indices with the usual ctz loop.
            let mut indexes: Vec<u32> = Vec::with_capacity(WORK_INDEXES);
            let mut stale = false;
            'extraction: for (word_index, &word) in bitmap.iter().enumerate() {
                let mut bits = !word;
                while bits != 0 {
                    let index = (word_index as u32) * 64 + bits.trailing_zeros();
                    bits &= bits - 1;
                    indexes.push(index);
                    if indexes.len() == WORK_INDEXES {
                        if self.current_height.load(Ordering::Acquire) != height {
                            stale = true;
                            break 'extraction;
                        }
                        self.slots[slot].outstanding.fetch_add(1, Ordering::Relaxed);
                        let job = CheckJob {
                            slot,
                            segment,
                            offset_id: sieve_id,
                            indexes: std::mem::replace(
                                &mut indexes,
                                Vec::with_capacity(WORK_INDEXES),
                            ),
                        };
                        self.ch
                            .verify_tx
                            .send(Job::Check(job))
                            .expect("verify queue disconnected");
                    }
                }
            }
            if stale || self.current_height.load(Ordering::Acquire) != height {
                break;
            }
            if !indexes.is_empty() {
                self.slots[slot].outstanding.fetch_add(1, Ordering::Relaxed);
                self.ch
                    .verify_tx
                    .send(Job::Check(CheckJob {
                        slot,
                        segment,
                        offset_id: sieve_id,
                        indexes,
                    }))
                    .expect("verify queue disconnected");
            }
        }
        drop(mod_guard);
    }

    /// Dense sieving: mark every multiple of every stored offset family
    /// below the segment boundary, leaving each entry positioned for the
    /// next segment.
    fn process_sieve(
        &self,
        bitmap: &mut [u64],
        offsets: &[AtomicU32],
        start_i: usize,
        end_i: usize,
    ) {
        let pattern_len = self.params.pattern.len();
        let sieve_size = self.params.sieve_size;
        let mut pending = Pending::new();
        for i in start_i..end_i {
            let p = self.primes[i];
            for f in 0..pattern_len {
                let cell = &offsets[i * pattern_len + f];
                let mut off = cell.load(Ordering::Relaxed) as u64;
                while off < sieve_size {
                    pending.add(bitmap, off as u32, sieve_size);
                    off += p;
                }
                cell.store((off - sieve_size) as u32, Ordering::Relaxed);
            }
        }
        pending.flush(bitmap, sieve_size);
    }

    // ── Check phase ─────────────────────────────────────────────────

    /// Fermat-test a job's candidates and walk the constellation offsets of
    /// the survivors, submitting tuples that meet the mode's threshold.
    fn verify_candidates(&self, job: CheckJob, source: &dyn WorkSource) {
        let (target, remainder_primorial, height, mut block) = {
            let st = self.slots[job.slot].state.read().unwrap();
            (
                st.target.clone(),
                st.remainder_primorial.clone(),
                st.block.height,
                st.block.clone(),
            )
        };
        let mut ploop = Integer::from(&self.primorial * (job.segment * self.params.sieve_size));
        ploop += &remainder_primorial;
        ploop += &target;
        ploop += self.params.offset_to_first[job.offset_id];

        // Batched first test when the job is full; the batch contract may
        // refuse (ragged widths), in which case each candidate is tested in
        // the walk below instead.
        let mut first_test_done = false;
        let mut survivors = job.indexes;
        if self.params.batch_verify && survivors.len() == WORK_INDEXES {
            let candidates: Vec<Integer> = survivors
                .iter()
                .map(|&idx| {
                    let mut c = Integer::from(&self.primorial * idx as u64);
                    c += &ploop;
                    c
                })
                .collect();
            if let Some(results) = fermat::test_batch(&candidates) {
                first_test_done = true;
                for _ in 0..survivors.len() {
                    source.inc_tuple_count(0);
                }
                survivors = survivors
                    .iter()
                    .zip(&results)
                    .filter(|&(_, &passed)| passed)
                    .map(|(&idx, _)| idx)
                    .collect();
            }
        }

        let pattern = &self.params.pattern;
        for idx in survivors {
            if self.current_height.load(Ordering::Acquire) != height {
                break;
            }
            let mut candidate = Integer::from(&self.primorial * idx as u64);
            candidate += &ploop;
            if !first_test_done {
                source.inc_tuple_count(0);
                if !fermat::is_probable_prime(&candidate) {
                    continue;
                }
            }
            let candidate_offset = Integer::from(&candidate - &target);

            let mut tuple_length = 1usize;
            source.inc_tuple_count(1);
            let mut offset_sum = 0u64;
            for f in 1..pattern.len() {
                if self.current_height.load(Ordering::Acquire) != height {
                    break;
                }
                offset_sum += pattern[f];
                candidate += pattern[f];
                if fermat::is_probable_prime(&candidate) {
                    tuple_length += 1;
                    source.inc_tuple_count(tuple_length);
                } else if self.params.mode == Mode::Pool {
                    // A share only needs length 4; keep walking while that
                    // is still reachable.
                    let remaining = pattern.len() - 1 - f;
                    if tuple_length + remaining < 4 {
                        break;
                    }
                } else {
                    break;
                }
            }

            let enough = match self.params.mode {
                Mode::Pool => tuple_length >= 4,
                _ => tuple_length >= self.params.tuple_length_min as usize,
            };
            if !enough || self.current_height.load(Ordering::Acquire) != height {
                continue;
            }

            block.n_offset = [0u8; 32];
            let digits = candidate_offset.to_digits::<u8>(Order::Lsf);
            let len = digits.len().min(32);
            block.n_offset[..len].copy_from_slice(&digits[..len]);
            block.tuple_length = tuple_length as u8;
            if self.params.mode == Mode::Benchmark {
                let base = Integer::from(&candidate - offset_sum);
                info!(tuple_length, n = %base, "constellation found");
                if let Some(path) = &self.params.tuples_file {
                    self.append_tuple(path, tuple_length, &base);
                }
            }
            source.submit_work(&block);
        }
    }

    fn append_tuple(&self, path: &Path, tuple_length: usize, base: &Integer) {
        let _guard = self.tuple_file_lock.lock().unwrap();
        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}-tuple: {}", tuple_length, base));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "unable to append tuple");
        }
    }

    // ── Master side ─────────────────────────────────────────────────

    /// Publish a block into a slot: derive (or take) its target, align it to
    /// the primorial, and reset the spill buckets.
    fn publish(&self, slot: usize, block: &WorkData) -> Result<()> {
        let target = match &block.bench_target {
            Some(t) => t.clone(),
            None => target::target_from_block(&block.pow_hash, block.difficulty)?,
        };
        let remainder_primorial = target::remainder_primorial(
            &target,
            &self.primorial,
            self.params.primorial_offsets[0],
        );
        for sieve in &self.sieves {
            for count in &sieve.segment_counts {
                count.store(0, Ordering::Relaxed);
            }
        }
        let mut st = self.slots[slot].state.write().unwrap();
        st.target = target;
        st.remainder_primorial = remainder_primorial;
        st.block = block.clone();
        self.slots[slot].height.store(block.height, Ordering::Release);
        Ok(())
    }

    fn master_loop(&self, source: &dyn WorkSource, first: WorkData) {
        let threads = self.params.threads as u32;
        let mut flow = FlowControl {
            max_work_out: (threads * 32 * self.params.sieve_workers as u32)
                .min(DONE_QUEUE_DEPTH as u32 - 256),
            allowed_fails: 5,
        };
        let mut block = first;
        let mut slot = 0usize;
        let mut old_height: Option<u32> = None;
        loop {
            let started = Instant::now();
            let is_new_height = old_height != Some(block.height);
            match self.publish(slot, &block) {
                Ok(()) => {
                    self.process_one_block(slot, is_new_height, &mut flow);
                    old_height = Some(block.height);
                    debug!(
                        height = block.height,
                        elapsed = ?started.elapsed(),
                        max_work_out = flow.max_work_out,
                        "block dispatched"
                    );
                    while self.slots[slot].outstanding.load(Ordering::Relaxed)
                        > flow.max_work_out as u64
                    {
                        self.drain_one();
                    }
                    slot = (slot + 1) % WORK_SLOTS;
                    while self.slots[slot].outstanding.load(Ordering::Relaxed) > 0 {
                        self.drain_one();
                    }
                }
                Err(e) => warn!(error = %e, "skipping unusable block"),
            }
            if !source.get_work(&mut block) {
                break;
            }
        }
        for slot in 0..WORK_SLOTS {
            while self.slots[slot].outstanding.load(Ordering::Relaxed) > 0 {
                self.drain_one();
            }
        }
    }

    /// Drive one published block through the mod and sieve phases, then
    /// retune the flow control. Returns once every mod and sieve job has
    /// completed; check jobs keep draining in the background.
    fn process_one_block(&self, slot: usize, is_new_height: bool, flow: &mut FlowControl) {
        let cur_work_out = self.ch.verify_rx.len() as u32;
        let increment = (self.n_primes / (self.params.threads * 8)).max(1);
        let mut n_low = 0i32;
        let mut n_high = 0i32;
        let mut n_sieve = 0i32;

        let mut base = self.starting_prime_index;
        while base < self.n_primes {
            let end = (base + increment).min(self.n_primes);
            self.ch
                .mod_tx
                .send(Job::Mod {
                    slot,
                    start: base,
                    end,
                })
                .expect("mod queue disconnected");
            // Guarantee a sleeping thread notices the mod work.
            self.ch
                .prio_tx
                .send(Job::Wake)
                .expect("job queue disconnected");
            if base < self.sparse_limit {
                n_low += 1;
            } else {
                n_high += 1;
            }
            base = end;
        }

        // The dense offset tables must be complete before any sieve starts.
        while n_low > 0 {
            match self.ch.done_rx.recv().expect("done queue disconnected") {
                Done::Tests(i) => {
                    self.slots[i].outstanding.fetch_sub(1, Ordering::Relaxed);
                }
                Done::ModDone { start } => {
                    if start < self.sparse_limit {
                        n_low -= 1;
                    } else {
                        n_high -= 1;
                    }
                }
                Done::SieveDone => n_sieve -= 1,
            }
        }
        debug_assert_eq!(self.slots[slot].outstanding.load(Ordering::Relaxed), 0);

        // Hold every instance's mod lock across the sieve enqueue so no
        // sieve can consume its spill buckets before the sparse mod work
        // also lands.
        let guards: Vec<_> = self
            .sieves
            .iter()
            .map(|s| s.mod_lock.lock().unwrap())
            .collect();
        for sieve in &self.sieves {
            self.ch
                .prio_tx
                .send(Job::Sieve {
                    slot,
                    sieve_id: sieve.id,
                })
                .expect("job queue disconnected");
            n_sieve += 1;
        }

        while n_high > 0 {
            match self.ch.done_rx.recv().expect("done queue disconnected") {
                Done::Tests(i) => {
                    self.slots[i].outstanding.fetch_sub(1, Ordering::Relaxed);
                }
                Done::ModDone { .. } => n_high -= 1,
                Done::SieveDone => n_sieve -= 1,
            }
        }
        drop(guards);

        let mut min_work_out = cur_work_out.min(self.ch.verify_rx.len() as u32);
        while n_sieve > 0 {
            match self.ch.done_rx.recv().expect("done queue disconnected") {
                Done::Tests(i) => {
                    self.slots[i].outstanding.fetch_sub(1, Ordering::Relaxed);
                }
                Done::SieveDone => n_sieve -= 1,
                Done::ModDone { .. } => debug_assert!(false, "mod completion after drain"),
            }
            min_work_out = min_work_out.min(self.ch.verify_rx.len() as u32);
        }

        let block_still_current = self.current_height.load(Ordering::Acquire)
            == self.slots[slot].height.load(Ordering::Acquire);
        if block_still_current && !is_new_height {
            retune(
                flow,
                cur_work_out,
                min_work_out,
                self.params.threads as u32,
                self.params.sieve_workers as u32,
            );
        }
    }

    fn drain_one(&self) {
        match self.ch.done_rx.recv().expect("done queue disconnected") {
            Done::Tests(slot) => {
                self.slots[slot].outstanding.fetch_sub(1, Ordering::Relaxed);
            }
            // Mod and sieve completions are always consumed inside
            // process_one_block.
            Done::SieveDone | Done::ModDone { .. } => debug_assert!(false),
        }
    }
}
