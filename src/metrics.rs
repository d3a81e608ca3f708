//! Pool-level metrics: counters plus an execution-time histogram.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Runtime counters for one pool.
#[derive(Debug)]
pub struct PoolMetrics {
    units_enqueued: AtomicU64,
    units_dispatched: AtomicU64,
    units_completed: AtomicU64,
    // Unit execution times in nanoseconds, claim to queue drain.
    exec_histogram: RwLock<Histogram<u64>>,
    start_time: Instant,
}

impl PoolMetrics {
    pub fn new() -> Self {
        // 3 significant figures, up to one hour in nanoseconds.
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("histogram bounds are statically valid");

        Self {
            units_enqueued: AtomicU64::new(0),
            units_dispatched: AtomicU64::new(0),
            units_completed: AtomicU64::new(0),
            exec_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_enqueued(&self) {
        self.units_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.units_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, exec_ns: u64) {
        self.units_completed.fetch_add(1, Ordering::Relaxed);
        let mut hist = self.exec_histogram.write();
        let _ = hist.record(exec_ns);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hist = self.exec_histogram.read();
        MetricsSnapshot {
            units_enqueued: self.units_enqueued.load(Ordering::Relaxed),
            units_dispatched: self.units_dispatched.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            exec_p50_ns: hist.value_at_quantile(0.5),
            exec_p99_ns: hist.value_at_quantile(0.99),
            exec_max_ns: hist.max(),
            uptime_ns: self.start_time.elapsed().as_nanos() as u64,
        }
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of pool metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub units_enqueued: u64,
    pub units_dispatched: u64,
    pub units_completed: u64,
    pub exec_p50_ns: u64,
    pub exec_p99_ns: u64,
    pub exec_max_ns: u64,
    pub uptime_ns: u64,
}
