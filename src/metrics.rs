//! Process-local counters for the handful of events the design calls out as
//! worth observing. No ecosystem metrics crate in the retrieval pack ships as
//! a plain fetchable dependency (convex's `metrics`/`prometheus` crates are
//! internal path/git crates), so this is a small atomic-counter facade in the
//! same spirit: named counters, registered once, read through a snapshot.
//! It does not gate or alter control flow anywhere it's called from.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub replica_write_failures_total: AtomicU64,
    pub journal_entries_pending: AtomicU64,
    pub lock_wait_seconds_total: AtomicU64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            replica_write_failures_total: AtomicU64::new(0),
            journal_entries_pending: AtomicU64::new(0),
            lock_wait_seconds_total: AtomicU64::new(0),
        }
    }

    pub fn record_replica_write_failure(&self) {
        self.replica_write_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn journal_entry_submitted(&self) {
        self.journal_entries_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn journal_entry_replayed(&self) {
        self.journal_entries_pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self, elapsed: std::time::Duration) {
        self.lock_wait_seconds_total.fetch_add(elapsed.as_secs(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            replica_write_failures_total: self.replica_write_failures_total.load(Ordering::Relaxed),
            journal_entries_pending: self.journal_entries_pending.load(Ordering::Relaxed),
            lock_wait_seconds_total: self.lock_wait_seconds_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CountersSnapshot {
    pub replica_write_failures_total: u64,
    pub journal_entries_pending: u64,
    pub lock_wait_seconds_total: u64,
}

/// Single process-wide instance; a plain `static` of atomics needs no
/// `lazy_static` wrapper.
pub static COUNTERS: Counters = Counters::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn replica_write_failure_increments() {
        let counters = Counters::new();
        counters.record_replica_write_failure();
        counters.record_replica_write_failure();
        assert_eq!(counters.snapshot().replica_write_failures_total, 2);
    }

    #[test]
    fn journal_pending_tracks_submit_and_replay() {
        let counters = Counters::new();
        counters.journal_entry_submitted();
        counters.journal_entry_submitted();
        counters.journal_entry_replayed();
        assert_eq!(counters.snapshot().journal_entries_pending, 1);
    }

    #[test]
    fn lock_wait_accumulates_seconds() {
        let counters = Counters::new();
        counters.record_lock_wait(Duration::from_secs(2));
        counters.record_lock_wait(Duration::from_secs(3));
        assert_eq!(counters.snapshot().lock_wait_seconds_total, 5);
    }
}
