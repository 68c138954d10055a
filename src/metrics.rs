use crate::store::StoreOp;
use crate::striped::StripedStat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub increments: u64,
    pub upserts: u64,
    pub lazy_creates: u64,
    pub create_races: u64,
    pub initializations: u64,
    pub aggregate_reads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    pub retries: u64,
}

/// Metrics for counter operations
#[derive(Debug)]
pub struct CounterMetrics {
    /// Successful writer calls, with their latency in nanoseconds
    pub increments: StripedStat,
    /// Writes applied through the atomic upsert primitive
    pub upserts: StripedStat,
    /// Shards created by the writer on first touch
    pub lazy_creates: AtomicU64,
    /// Lazy creates that lost a race and fell back to an increment
    pub create_races: AtomicU64,
    /// Initializer batches committed
    pub initializations: AtomicU64,
    /// Reader calls answered from the store, with their latency in nanoseconds
    pub aggregate_reads: StripedStat,
    pub cache_hits: StripedStat,
    pub cache_misses: StripedStat,
    /// Operations that surfaced an error
    pub failures: AtomicU64,
    /// Store reads retried by the retry decorator
    pub retries: AtomicU64,
    start_time: Instant,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self {
            increments: StripedStat::new(),
            upserts: StripedStat::new(),
            lazy_creates: AtomicU64::new(0),
            create_races: AtomicU64::new(0),
            initializations: AtomicU64::new(0),
            aggregate_reads: StripedStat::new(),
            cache_hits: StripedStat::new(),
            cache_misses: StripedStat::new(),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a successful writer call
    pub fn record_increment(&self, latency: Duration) {
        self.increments.record(nanos(latency));
        trace!(
            counter_op = "increment",
            latency_ns = nanos(latency)
        );
    }

    pub fn record_upsert(&self) {
        self.upserts.bump();
    }

    pub fn record_lazy_create(&self) {
        self.lazy_creates.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "lazy_create");
    }

    pub fn record_create_race(&self) {
        self.create_races.fetch_add(1, Ordering::Relaxed);
        debug!(counter_op = "create_race");
    }

    pub fn record_initialization(&self) {
        self.initializations.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "initialize");
    }

    /// Record a reader call that scanned the store
    pub fn record_aggregate_read(&self, latency: Duration) {
        self.aggregate_reads.record(nanos(latency));
        trace!(
            counter_op = "aggregate_read",
            latency_ns = nanos(latency)
        );
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.bump();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.bump();
    }

    pub fn record_failure(&self, operation: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "failure", operation = operation);
    }

    pub fn record_retry(&self, op: StoreOp, attempt: u32) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        debug!(store_op = %op, attempt = attempt, "retry");
    }

    /// Average writer latency in milliseconds
    pub fn avg_write_latency_ms(&self) -> f64 {
        self.increments.mean().map_or(0.0, |ns| ns / 1_000_000.0)
    }

    /// Average reader latency in milliseconds
    pub fn avg_read_latency_ms(&self) -> f64 {
        self.aggregate_reads.mean().map_or(0.0, |ns| ns / 1_000_000.0)
    }

    /// Cache hit rate as a percentage
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.count();
        let total = hits + self.cache_misses.count();
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            increments: self.increments.count(),
            upserts: self.upserts.count(),
            lazy_creates: self.lazy_creates.load(Ordering::Relaxed),
            create_races: self.create_races.load(Ordering::Relaxed),
            initializations: self.initializations.load(Ordering::Relaxed),
            aggregate_reads: self.aggregate_reads.count(),
            cache_hits: self.cache_hits.count(),
            cache_misses: self.cache_misses.count(),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    /// Log a summary of metrics
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            operation = "counter_metrics_summary",
            increments = s.increments,
            upserts = s.upserts,
            lazy_creates = s.lazy_creates,
            create_races = s.create_races,
            initializations = s.initializations,
            aggregate_reads = s.aggregate_reads,
            cache_hit_rate_pct = self.cache_hit_rate(),
            failures = s.failures,
            retries = s.retries,
            avg_write_latency_ms = self.avg_write_latency_ms(),
            avg_read_latency_ms = self.avg_read_latency_ms(),
            uptime_secs = self.start_time.elapsed().as_secs_f64(),
        );
    }
}

fn nanos(latency: Duration) -> u64 {
    u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX)
}

impl Default for CounterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
