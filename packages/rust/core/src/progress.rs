//! Run counters and periodic progress reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

/// Point-in-time view of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Records finished in this run, whatever the outcome.
    pub completed: usize,
    /// Records this run will process.
    pub total: usize,
    pub written: usize,
    /// Records with at least one retry-ledger entry, written or not.
    pub retried: usize,
    /// Records neither written nor sent to the retry ledger.
    pub dropped: usize,
    /// Retry-ledger lines; a record failing two stages adds two.
    pub retry_entries: usize,
    pub elapsed: Duration,
    /// Estimated time left, once at least one record has finished.
    pub eta: Option<Duration>,
    /// Estimated USD spent so far.
    pub cost: f64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

/// Receives periodic snapshots from the pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
    /// Called once after the last record.
    fn finish(&self, snapshot: &ProgressSnapshot);
}

/// Reports through `tracing` at info level.
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, s: &ProgressSnapshot) {
        info!(
            completed = s.completed,
            total = s.total,
            percent = format_args!("{:.1}", s.percent()),
            remaining = s.remaining(),
            eta_secs = s.eta.map(|d| d.as_secs()),
            written = s.written,
            retried = s.retried,
            dropped = s.dropped,
            retry_entries = s.retry_entries,
            cost_usd = format_args!("{:.4}", s.cost),
            "progress"
        );
    }

    fn finish(&self, s: &ProgressSnapshot) {
        info!(
            completed = s.completed,
            written = s.written,
            retried = s.retried,
            dropped = s.dropped,
            retry_entries = s.retry_entries,
            elapsed_secs = s.elapsed.as_secs_f64(),
            "run finished"
        );
    }
}

/// No-op reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn report(&self, _snapshot: &ProgressSnapshot) {}
    fn finish(&self, _snapshot: &ProgressSnapshot) {}
}

/// Lock-free outcome counters shared by the workers.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    written: AtomicUsize,
    retried: AtomicUsize,
    dropped: AtomicUsize,
    retry_entries: AtomicUsize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            retried: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            retry_entries: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// A record appended to the output; `retried` when an earlier stage
    /// also sent it to the retry ledger.
    pub fn record_written(&self, retried: bool) {
        self.written.fetch_add(1, Ordering::Relaxed);
        if retried {
            self.retried.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A record that ended in the retry ledger instead of the output.
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// One retry-ledger line. Does not complete the record on its own.
    pub fn record_retry_entry(&self) {
        self.retry_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cost: f64) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed();
        let eta = (completed > 0).then(|| {
            let per_record = elapsed.as_secs_f64() / completed as f64;
            Duration::from_secs_f64(per_record * self.total.saturating_sub(completed) as f64)
        });

        ProgressSnapshot {
            completed,
            total: self.total,
            written: self.written.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retry_entries: self.retry_entries.load(Ordering::Relaxed),
            elapsed,
            eta,
            cost,
        }
    }
}
