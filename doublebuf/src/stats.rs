//! Coordinator counters.
//!
//! Updated with relaxed atomics from producers and the drain task; a
//! [`CoordinatorStats`] snapshot is not a consistent cut across fields.

use std::sync::atomic::{AtomicU64, Ordering};

use minstant::Instant;

/// Point-in-time copy of a coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Items accepted by `add_task`.
    pub items_enqueued: u64,
    /// Items passed to the handler in a batch that succeeded.
    pub items_handled: u64,
    /// Batches the handler completed successfully.
    pub batches_handled: u64,
    /// Batches whose handler call returned an error or panicked.
    pub failed_batches: u64,
    /// Number of times the drain loop was started from idle.
    pub drain_loops: u64,
    /// Largest batch handed to the handler.
    pub max_batch_len: u64,
    /// Total time spent inside the handler, in microseconds.
    pub handler_micros: u64,
    /// Longest single handler call, in microseconds.
    pub max_handler_micros: u64,
}

impl CoordinatorStats {
    /// Mean items per successful batch, or 0 before the first one.
    #[must_use]
    pub fn mean_batch_len(&self) -> f64 {
        if self.batches_handled == 0 {
            0.0
        } else {
            self.items_handled as f64 / self.batches_handled as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    items_enqueued: AtomicU64,
    items_handled: AtomicU64,
    batches_handled: AtomicU64,
    failed_batches: AtomicU64,
    drain_loops: AtomicU64,
    max_batch_len: AtomicU64,
    handler_micros: AtomicU64,
    max_handler_micros: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn record_enqueued(&self) {
        self.items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drain_loop(&self) {
        self.drain_loops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished handler call that started at `started`.
    pub(crate) fn record_batch(&self, batch_len: usize, started: Instant, ok: bool) {
        let micros = started.elapsed().as_micros() as u64;
        self.handler_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_handler_micros.fetch_max(micros, Ordering::Relaxed);
        self.max_batch_len.fetch_max(batch_len as u64, Ordering::Relaxed);
        if ok {
            self.batches_handled.fetch_add(1, Ordering::Relaxed);
            self.items_handled.fetch_add(batch_len as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_handled: self.items_handled.load(Ordering::Relaxed),
            batches_handled: self.batches_handled.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            drain_loops: self.drain_loops.load(Ordering::Relaxed),
            max_batch_len: self.max_batch_len.load(Ordering::Relaxed),
            handler_micros: self.handler_micros.load(Ordering::Relaxed),
            max_handler_micros: self.max_handler_micros.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_zeroed() {
        let counters = StatsCounters::default();
        assert_eq!(counters.snapshot(), CoordinatorStats::default());
        assert_eq!(counters.snapshot().mean_batch_len(), 0.0);
    }

    #[test]
    fn test_failed_batch_not_counted_as_handled() {
        let counters = StatsCounters::default();
        counters.record_batch(4, Instant::now(), true);
        counters.record_batch(10, Instant::now(), false);
        counters.record_failure();

        let stats = counters.snapshot();
        assert_eq!(stats.batches_handled, 1);
        assert_eq!(stats.items_handled, 4);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.max_batch_len, 10);
        assert_eq!(stats.mean_batch_len(), 4.0);
    }
}
