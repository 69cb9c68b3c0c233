//! Progress accounting and reporting hooks.
//!
//! `ProgressTracker` holds the run's counters. Only the executor advances
//! them; any other thread (a periodic logger, a UI) may take a
//! `ProgressSnapshot` at any time without blocking it, since every counter
//! is an atomic.
//!
//! `ProgressObserver` decouples the engine from whatever displays progress
//! (console output in the CLI, a recorder in tests).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::model::{Manifest, PlanKind, TransferResult};

/// Point-in-time view of a run's progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub files_completed: u64,
    pub files_total: u64,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    /// Wall-clock time since the run started
    pub elapsed: Duration,
    totals_known: bool,
}

impl ProgressSnapshot {
    /// Completion in percent, clamped to 0..=100.
    ///
    /// Byte-weighted when the run has bytes to move, file-weighted otherwise.
    /// A run with nothing to move is complete once its totals are known.
    pub fn percentage(&self) -> f64 {
        if !self.totals_known {
            return 0.0;
        }
        let ratio = if self.bytes_total > 0 {
            self.bytes_completed as f64 / self.bytes_total as f64
        } else if self.files_total > 0 {
            self.files_completed as f64 / self.files_total as f64
        } else {
            1.0
        };
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    /// Bytes per second since the run started.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_completed as f64 / secs
        } else {
            0.0
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed.as_secs()
    }
}

/// Counters for one run.
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    totals_known: AtomicBool,
    files_total: AtomicU64,
    bytes_total: AtomicU64,
    files_completed: AtomicU64,
    bytes_completed: AtomicU64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Start the clock; totals are unknown until [`set_totals`](Self::set_totals).
    pub fn new() -> Self {
        ProgressTracker {
            started: Instant::now(),
            totals_known: AtomicBool::new(false),
            files_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
            bytes_completed: AtomicU64::new(0),
        }
    }

    /// Record what the run is expected to move (once analysis is done).
    pub fn set_totals(&self, bytes: u64, files: u64) {
        self.bytes_total.store(bytes, Ordering::Relaxed);
        self.files_total.store(files, Ordering::Relaxed);
        self.totals_known.store(true, Ordering::Release);
    }

    /// Count a completed unit of work.
    pub fn advance(&self, bytes: u64, files: u64) {
        self.bytes_completed.fetch_add(bytes, Ordering::Relaxed);
        self.files_completed.fetch_add(files, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            totals_known: self.totals_known.load(Ordering::Acquire),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_total: self.files_total.load(Ordering::Relaxed),
            bytes_completed: self.bytes_completed.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Receives run events from the engine.
///
/// Called synchronously from the executor's thread; keep implementations
/// cheap.
pub trait ProgressObserver: Send + Sync {
    /// Analysis and planning are done; transfers are about to start.
    fn on_run_started(&self, manifest: &Manifest, plan: PlanKind);

    /// A unit (a file, an archive, a chunk) is about to be processed.
    fn on_unit_started(&self, unit: &str);

    /// A unit reached the target.
    fn on_unit_completed(&self, unit: &str, progress: &ProgressSnapshot);

    /// A unit failed for good; the run continues with the next one.
    fn on_unit_failed(&self, unit: &str, error: &EngineError);

    /// The run's result has been finalized.
    fn on_run_completed(&self, result: &TransferResult);
}
