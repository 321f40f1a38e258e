use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Counters for the two storage tiers
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_errors: AtomicU64,
    pub durable_reads: AtomicU64,
    pub durable_writes: AtomicU64,
    pub durable_errors: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
        warn!("State cache error recorded");
    }

    pub fn record_durable_read(&self) {
        self.durable_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_write(&self) {
        self.durable_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_error(&self) {
        self.durable_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            durable_reads: self.durable_reads.load(Ordering::Relaxed),
            durable_writes: self.durable_writes.load(Ordering::Relaxed),
            durable_errors: self.durable_errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "State store metrics: cache_hits={}, cache_misses={}, cache_errors={}, durable_reads={}, durable_writes={}, durable_errors={}",
            stats.cache_hits,
            stats.cache_misses,
            stats.cache_errors,
            stats.durable_reads,
            stats.durable_writes,
            stats.durable_errors
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub durable_reads: u64,
    pub durable_writes: u64,
    pub durable_errors: u64,
}

/// Time an operation and log its duration when finished or dropped
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {}
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        tracing::debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}
