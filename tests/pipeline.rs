//! End-to-end pipeline tests: drive the miner through its public interface
//! with scripted work sources and check what comes back out.

use constel::{Miner, MinerOptions, Mode, WorkData, WorkSource};
use rug::integer::Order;
use rug::Integer;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

/// Hands out a fixed list of blocks, then ends the run; records every
/// submission and counts Fermat attempts.
struct ScriptedSource {
    blocks: Mutex<Vec<WorkData>>,
    submissions: Mutex<Vec<WorkData>>,
    attempts: AtomicUsize,
}

impl ScriptedSource {
    fn new(mut blocks: Vec<WorkData>) -> ScriptedSource {
        blocks.reverse();
        ScriptedSource {
            blocks: Mutex::new(blocks),
            submissions: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    fn submissions(&self) -> Vec<WorkData> {
        self.submissions.lock().unwrap().clone()
    }
}

impl WorkSource for ScriptedSource {
    fn get_work(&self, work: &mut WorkData) -> bool {
        match self.blocks.lock().unwrap().pop() {
            Some(block) => {
                *work = block;
                true
            }
            None => false,
        }
    }

    fn submit_work(&self, work: &WorkData) {
        self.submissions.lock().unwrap().push(work.clone());
    }

    fn inc_tuple_count(&self, length: usize) {
        if length == 0 {
            self.attempts.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }
}

fn bench_block(height: u32, target: Integer) -> WorkData {
    WorkData {
        height,
        bench_target: Some(target),
        ..WorkData::default()
    }
}

fn offset_integer(n_offset: &[u8; 32]) -> Integer {
    Integer::from_digits(n_offset, Order::Lsf)
}

/// Plant the sextuplet base 16057 (16057 + 0,4,6,10,12,16 are all prime) a
/// known number of primorial steps above the target and expect it back.
#[test]
fn finds_planted_sextuplet() {
    let base = 16057u64;
    let primorial = 30u64; // primorial number 3
    let offset = base % primorial;
    let steps = 100u64;
    let target = Integer::from(base - offset - steps * primorial);

    let options = MinerOptions {
        threads: 2,
        sieve_workers: 1,
        sieve_bits: 10,
        max_increments: 1 << 10,
        prime_table_limit: 1024,
        primorial_number: 3,
        primorial_offsets: vec![offset],
        pattern: vec![0, 4, 2, 4, 2, 4],
        mode: Mode::Solo,
        tuple_length_min: 6,
        batch_verify: true,
        tuples_file: None,
    };
    let miner = Miner::new(&options).unwrap();
    miner.update_height(1);
    let source = ScriptedSource::new(vec![bench_block(1, target.clone())]);
    miner.run(&source);

    let expected_offset = Integer::from(base) - &target;
    let submissions = source.submissions();
    assert!(
        submissions
            .iter()
            .any(|s| s.tuple_length == 6 && offset_integer(&s.n_offset) == expected_offset),
        "sextuplet at {} not submitted (got {:?})",
        base,
        submissions
            .iter()
            .map(|s| (s.tuple_length, offset_integer(&s.n_offset)))
            .collect::<Vec<_>>()
    );
    assert!(source.attempts.load(AtomicOrdering::Relaxed) > 0);
    assert_eq!(miner.outstanding_tests(), 0);
}

/// Same end-to-end flow with an octuplet pattern, a sparse prime region, and
/// multiple sieve segments: base 15760091 carries the constellation
/// (0, 2, 6, 8, 12, 18, 20, 26).
#[test]
fn finds_planted_octuplet() {
    let base = 15_760_091u64;
    let primorial = 2310u64; // primorial number 5
    let offset = base % primorial; // 1271
    let steps = 5000u64;
    let target = Integer::from(base - offset - steps * primorial);

    let options = MinerOptions {
        threads: 4,
        sieve_workers: 1,
        sieve_bits: 16,
        max_increments: 1 << 18,
        prime_table_limit: 1 << 20,
        primorial_number: 5,
        primorial_offsets: vec![offset],
        pattern: vec![0, 2, 4, 2, 4, 6, 2, 6],
        mode: Mode::Solo,
        tuple_length_min: 8,
        batch_verify: true,
        tuples_file: None,
    };
    let miner = Miner::new(&options).unwrap();
    miner.update_height(7);
    let source = ScriptedSource::new(vec![bench_block(7, target.clone())]);
    miner.run(&source);

    let expected_offset = Integer::from(base) - &target;
    assert!(
        source
            .submissions()
            .iter()
            .any(|s| s.tuple_length == 8 && offset_integer(&s.n_offset) == expected_offset),
        "octuplet at {} not submitted",
        base
    );
    assert_eq!(miner.outstanding_tests(), 0);
}

/// A height change mid-block: the stale block must produce no submissions,
/// the run must still drain to zero outstanding tests, and the miner must be
/// ready for the next block.
#[test]
fn stale_block_is_abandoned_cleanly() {
    let options = MinerOptions {
        threads: 2,
        sieve_workers: 1,
        sieve_bits: 14,
        max_increments: 1 << 16,
        prime_table_limit: 1 << 21,
        primorial_number: 10,
        primorial_offsets: vec![1_091_257],
        pattern: vec![0, 4, 2, 4, 2, 4],
        mode: Mode::Solo,
        tuple_length_min: 6,
        batch_verify: true,
        tuples_file: None,
    };
    let miner = Miner::new(&options).unwrap();
    let target = (Integer::from(1) << 200u32) + 12345u32;
    miner.update_height(1);
    let source = ScriptedSource::new(vec![bench_block(1, target)]);

    std::thread::scope(|s| {
        let handle = s.spawn(|| miner.run(&source));
        std::thread::sleep(Duration::from_millis(5));
        miner.update_height(2);
        handle.join().unwrap();
    });

    assert!(source.submissions().is_empty());
    assert_eq!(miner.outstanding_tests(), 0);
}

/// Two blocks back to back exercise the double-buffered slots; everything
/// must drain between and after them. A twin pattern keeps the candidate
/// supply dense enough that both blocks are guaranteed to produce tests.
#[test]
fn consecutive_blocks_share_the_pipeline() {
    let options = MinerOptions {
        threads: 2,
        sieve_workers: 1,
        sieve_bits: 10,
        max_increments: 1 << 10,
        prime_table_limit: 1024,
        primorial_number: 3,
        // 11 and 13 are both coprime to 30, so the twin family is admissible.
        primorial_offsets: vec![11],
        pattern: vec![0, 2],
        mode: Mode::Solo,
        tuple_length_min: 2,
        batch_verify: true,
        tuples_file: None,
    };
    let miner = Miner::new(&options).unwrap();
    miner.update_height(3);
    let source = ScriptedSource::new(vec![
        bench_block(3, Integer::from(1_000_000u64)),
        bench_block(3, Integer::from(50_000_000u64)),
    ]);
    miner.run(&source);

    assert!(source.blocks.lock().unwrap().is_empty());
    assert!(source.attempts.load(AtomicOrdering::Relaxed) > 0);
    assert_eq!(miner.outstanding_tests(), 0);
}
