//! Activity counters aggregated by the heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic and gauge counters shared across the mount's workers.
#[derive(Debug, Default)]
pub struct ActivityCounters {
    /// Kernel callbacks served since the last heartbeat.
    pub callbacks_served: AtomicU64,
    /// Objects fetched from the object service since the last heartbeat.
    pub objects_fetched: AtomicU64,
    /// Bytes downloaded since the last heartbeat.
    pub bytes_downloaded: AtomicU64,
    /// Journal appends since the last heartbeat.
    pub journal_appends: AtomicU64,
    /// Gauge: queued + running background operations.
    pub background_ops: AtomicU64,
    /// Gauge: object fetches currently in flight.
    pub fetches_inflight: AtomicU64,
}

/// A point-in-time copy emitted by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub callbacks_served: u64,
    pub objects_fetched: u64,
    pub bytes_downloaded: u64,
    pub journal_appends: u64,
    pub background_ops: u64,
    pub fetches_inflight: u64,
}

impl ActivityCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Reads and resets the per-interval counters; gauges are read
    /// without reset.
    pub fn snapshot_and_reset(&self) -> CounterSnapshot {
        CounterSnapshot {
            callbacks_served: self.callbacks_served.swap(0, Ordering::Relaxed),
            objects_fetched: self.objects_fetched.swap(0, Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.swap(0, Ordering::Relaxed),
            journal_appends: self.journal_appends.swap(0, Ordering::Relaxed),
            background_ops: self.background_ops.load(Ordering::Relaxed),
            fetches_inflight: self.fetches_inflight.load(Ordering::Relaxed),
        }
    }
}
