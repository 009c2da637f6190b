//! Tuple-count statistics shared between verifier threads and a reporter.
//!
//! Counter 0 is the number of Fermat attempts; counter k the number of
//! candidates that reached tuple length k. Updates are lock-free atomics so
//! dozens of verifier threads can record without contention; a background
//! thread periodically logs the derived rate, prime ratio, and the estimated
//! mean time to find a full-length tuple.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

pub struct TupleStats {
    counts: Vec<AtomicU64>,
    start: Instant,
    shutdown: AtomicBool,
}

impl TupleStats {
    /// `tuple_length` is the longest length tracked (the pattern length).
    pub fn new(tuple_length: usize) -> Arc<Self> {
        Arc::new(TupleStats {
            counts: (0..=tuple_length).map(|_| AtomicU64::new(0)).collect(),
            start: Instant::now(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn record(&self, length: usize) {
        if let Some(c) = self.counts.get(length) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counts(&self) -> Vec<u64> {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub fn candidates_per_second(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.counts[0].load(Ordering::Relaxed) as f64 / elapsed
    }

    /// Estimated mean seconds between full-length finds, extrapolated from
    /// the candidate-to-prime ratio. None until enough data exists.
    pub fn estimated_find_time(&self) -> Option<f64> {
        let tested = self.counts[0].load(Ordering::Relaxed);
        let primes = self.counts.get(1)?.load(Ordering::Relaxed);
        if tested == 0 || primes == 0 {
            return None;
        }
        let cps = self.candidates_per_second();
        if cps <= 0.0 {
            return None;
        }
        let r = tested as f64 / primes as f64;
        Some(r.powi(self.counts.len() as i32 - 1) / cps)
    }

    pub fn start_reporter(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let stats = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(interval);
            if stats.shutdown.load(Ordering::Relaxed) {
                break;
            }
            stats.log_status();
        })
    }

    pub fn log_status(&self) {
        let counts = self.counts();
        match self.estimated_find_time() {
            Some(eta) => info!(
                cps = format_args!("{:.1}", self.candidates_per_second()),
                ratio = format_args!(
                    "{:.2}",
                    counts[0] as f64 / counts[1].max(1) as f64
                ),
                tuples = ?counts,
                eta = %format_duration(eta),
                "search progress"
            ),
            None => info!(
                cps = format_args!("{:.1}", self.candidates_per_second()),
                tuples = ?counts,
                "search progress"
            ),
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Human-readable duration from seconds.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.0} ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{:.2} s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.2} min", seconds / 60.0)
    } else if seconds < 86_400.0 {
        format!("{:.2} h", seconds / 3600.0)
    } else if seconds < 31_556_952.0 {
        format!("{:.2} d", seconds / 86_400.0)
    } else {
        format!("{:.2} y", seconds / 31_556_952.0)
    }
}
