//! Benchmark driver for the mining core.
//!
//! Feeds the miner synthetic blocks (random proof-of-work hashes at a fixed
//! height and difficulty) and reports candidate rates and found tuples. Real
//! deployments replace this binary's [`WorkSource`] with a pool or node
//! client; the engine does not care which.

use anyhow::Result;
use clap::Parser;
use constel::stats::TupleStats;
use constel::{Miner, MinerOptions, Mode, WorkData, WorkSource};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "constel", about = "Benchmark the prime-constellation mining core")]
struct Cli {
    /// Worker thread count
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Parallel sieve instances (0 = pick automatically)
    #[arg(long, default_value_t = 0)]
    sieve_workers: usize,

    /// log2 of the sieve segment size in bits
    #[arg(long, default_value_t = 25)]
    sieve_bits: u32,

    /// Prime table limit
    #[arg(long, default_value_t = 1u64 << 31)]
    prime_table_limit: u64,

    /// Number of leading primes in the primorial
    #[arg(long, default_value_t = 40)]
    primorial_number: usize,

    /// Constellation step offsets, comma separated (default: sextuplets)
    #[arg(long, value_delimiter = ',')]
    pattern: Option<Vec<u64>>,

    /// Primorial offsets, comma separated, one per sieve worker
    #[arg(long, value_delimiter = ',')]
    primorial_offsets: Option<Vec<u64>>,

    /// Difficulty of the synthetic blocks (target bit length)
    #[arg(long, default_value_t = 1024)]
    difficulty: u32,

    /// Minimum tuple length worth reporting
    #[arg(long, default_value_t = 6)]
    tuple_length_min: u8,

    /// Append found tuples to this file
    #[arg(long)]
    tuples_file: Option<PathBuf>,

    /// Disable the batched verification path
    #[arg(long)]
    no_batch_verify: bool,

    /// Stop after this many seconds (default: run until interrupted)
    #[arg(long)]
    duration: Option<u64>,

    /// Seconds between progress reports
    #[arg(long, default_value_t = 30)]
    report_interval: u64,
}

/// Synthetic block supplier: same height forever, fresh random hash per
/// block.
struct BenchmarkSource {
    stats: Arc<TupleStats>,
    difficulty: u32,
    deadline: Option<Instant>,
    submitted: AtomicU64,
}

impl WorkSource for BenchmarkSource {
    fn get_work(&self, work: &mut WorkData) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        work.height = 1;
        work.difficulty = self.difficulty;
        work.bench_target = None;
        rand::thread_rng().fill_bytes(&mut work.pow_hash);
        true
    }

    fn submit_work(&self, work: &WorkData) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        info!(tuple_length = work.tuple_length, "tuple submitted");
    }

    fn inc_tuple_count(&self, length: usize) {
        self.stats.record(length);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();

    let defaults = MinerOptions::default();
    let options = MinerOptions {
        threads: cli.threads,
        sieve_workers: cli.sieve_workers,
        sieve_bits: cli.sieve_bits,
        prime_table_limit: cli.prime_table_limit,
        primorial_number: cli.primorial_number,
        pattern: cli.pattern.unwrap_or(defaults.pattern.clone()),
        primorial_offsets: cli
            .primorial_offsets
            .unwrap_or(defaults.primorial_offsets.clone()),
        mode: Mode::Benchmark,
        tuple_length_min: cli.tuple_length_min,
        batch_verify: !cli.no_batch_verify,
        tuples_file: cli.tuples_file,
        ..defaults
    };

    let miner = Miner::new(&options)?;
    let stats = TupleStats::new(miner.params().pattern.len());
    let reporter = stats.start_reporter(Duration::from_secs(cli.report_interval));

    let source = BenchmarkSource {
        stats: Arc::clone(&stats),
        difficulty: cli.difficulty,
        deadline: cli.duration.map(|s| Instant::now() + Duration::from_secs(s)),
        submitted: AtomicU64::new(0),
    };
    // The benchmark never reorganizes: every block lives at height 1.
    miner.update_height(1);
    info!(difficulty = cli.difficulty, "starting benchmark");
    miner.run(&source);

    stats.stop();
    let _ = reporter.join();
    stats.log_status();
    info!(
        submitted = source.submitted.load(Ordering::Relaxed),
        "benchmark finished"
    );
    Ok(())
}
