//! Cache Metrics Module
//!
//! Per-node counters derived from entry store outcomes, plus running
//! latency averages for the calls made on this node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

// == Cache Metrics ==
/// Lock-free metrics collector shared by a node's store and cache handle.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    puts: AtomicU64,
    removals: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    put_time: LatencyTotals,
    get_time: LatencyTotals,
    remove_time: LatencyTotals,
}

#[derive(Debug, Default)]
struct LatencyTotals {
    nanos: AtomicU64,
    samples: AtomicU64,
}

impl LatencyTotals {
    fn record(&self, elapsed: Duration) {
        self.nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn average_micros(&self) -> f64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            0.0
        } else {
            self.nanos.load(Ordering::Relaxed) as f64 / samples as f64 / 1_000.0
        }
    }

    fn reset(&self) {
        self.nanos.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}

impl CacheMetrics {
    // == Constructor ==
    /// Creates a new collector with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    /// Capacity-driven removals only; explicit removes never land here.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_time(&self, elapsed: Duration) {
        self.put_time.record(elapsed);
    }

    pub fn record_get_time(&self, elapsed: Duration) {
        self.get_time.record(elapsed);
    }

    pub fn record_remove_time(&self, elapsed: Duration) {
        self.remove_time.record(elapsed);
    }

    // == Reset ==
    /// Zeroes every counter and latency accumulator.
    pub fn reset(&self) {
        for counter in [
            &self.puts,
            &self.removals,
            &self.hits,
            &self.misses,
            &self.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.put_time.reset();
        self.get_time.reset();
        self.remove_time.reset();
    }

    // == Snapshot ==
    /// Captures the current counters together with the live entry count.
    pub fn snapshot(&self, size: usize) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let (hit_percentage, miss_percentage) = percentages(hits, misses);

        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size,
            hit_percentage,
            miss_percentage,
            average_put_time_micros: self.put_time.average_micros(),
            average_get_time_micros: self.get_time.average_micros(),
            average_remove_time_micros: self.remove_time.average_micros(),
        }
    }
}

fn percentages(hits: u64, misses: u64) -> (f64, f64) {
    let total = hits + misses;
    if total == 0 {
        return (0.0, 0.0);
    }
    let hit = hits as f64 / total as f64 * 100.0;
    (hit, 100.0 - hit)
}

// == Metrics Snapshot ==
/// Point-in-time view of one node's metrics for one cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub removals: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Live entries on this node
    pub size: usize,
    /// hits / (hits + misses) * 100, or 0 when nothing was read
    pub hit_percentage: f64,
    pub miss_percentage: f64,
    pub average_put_time_micros: f64,
    pub average_get_time_micros: f64,
    pub average_remove_time_micros: f64,
}

impl MetricsSnapshot {
    /// Total reads that resolved to a hit or a miss.
    pub fn gets(&self) -> u64 {
        self.hits + self.misses
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        let snapshot = CacheMetrics::new().snapshot(0);
        assert_eq!(snapshot.puts, 0);
        assert_eq!(snapshot.removals, 0);
        assert_eq!(snapshot.gets(), 0);
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.hit_percentage, 0.0);
        assert_eq!(snapshot.miss_percentage, 0.0);
    }

    #[test]
    fn test_hit_percentage_all_hits() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        let snapshot = metrics.snapshot(1);
        assert_eq!(snapshot.hit_percentage, 100.0);
        assert_eq!(snapshot.miss_percentage, 0.0);
    }

    #[test]
    fn test_hit_percentage_mixed() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_miss();
        metrics.record_miss();
        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.hit_percentage, 25.0);
        assert_eq!(snapshot.miss_percentage, 75.0);
    }

    #[test]
    fn test_average_latencies() {
        let metrics = CacheMetrics::new();
        metrics.record_put_time(Duration::from_micros(10));
        metrics.record_put_time(Duration::from_micros(30));
        let snapshot = metrics.snapshot(0);
        assert!((snapshot.average_put_time_micros - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.average_get_time_micros, 0.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = CacheMetrics::new();
        metrics.record_put();
        metrics.record_removal();
        metrics.record_eviction();
        metrics.record_hit();
        metrics.record_remove_time(Duration::from_micros(5));

        metrics.reset();

        let snapshot = metrics.snapshot(3);
        assert_eq!(snapshot.puts, 0);
        assert_eq!(snapshot.removals, 0);
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.average_remove_time_micros, 0.0);
        assert_eq!(snapshot.size, 3);
    }
}
