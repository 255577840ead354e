//! Cache Metrics Collection
//!
//! Hit/miss accounting per tier, compute outcomes and latency averages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::record::HitSource;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup outcomes
    volatile_hits: AtomicU64,
    durable_hits: AtomicU64,
    similarity_hits: AtomicU64,
    misses: AtomicU64,

    // Compute
    computes: AtomicU64,
    compute_failures: AtomicU64,
    compute_timeouts: AtomicU64,
    flight_followers: AtomicU64,

    // Failure handling
    volatile_degradations: AtomicU64,
    durable_failures: AtomicU64,
    invalid_images: AtomicU64,
    corrupt_volatile_values: AtomicU64,

    // Maintenance
    invalidations: AtomicU64,
    records_swept: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    hit_latency_us: AtomicU64,
    compute_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request answered from cache
    pub fn record_hit(&self, source: HitSource, latency: Duration) {
        let counter = match source {
            HitSource::Volatile => &self.volatile_hits,
            HitSource::Durable => &self.durable_hits,
            HitSource::Similarity => &self.similarity_hits,
            HitSource::Computed => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if source != HitSource::Computed {
            self.update_latency_ema(&self.hit_latency_us, latency);
        }
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compute(&self, latency: Duration) {
        self.computes.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.compute_latency_us, latency);
    }

    pub fn record_compute_failure(&self) {
        self.compute_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compute_timeout(&self) {
        self.compute_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flight_follower(&self) {
        self.flight_followers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_volatile_degradation(&self) {
        self.volatile_degradations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_failure(&self) {
        self.durable_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_image(&self) {
        self.invalid_images.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_volatile_value(&self) {
        self.corrupt_volatile_values.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_swept(&self, count: u64) {
        self.records_swept.fetch_add(count, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.volatile_hits.load(Ordering::Relaxed)
            + self.durable_hits.load(Ordering::Relaxed)
            + self.similarity_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn computes(&self) -> u64 {
        self.computes.load(Ordering::Relaxed)
    }

    /// Share of answered requests that avoided a compute
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            volatile_hits: self.volatile_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            similarity_hits: self.similarity_hits.load(Ordering::Relaxed),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),

            computes: self.computes(),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            compute_timeouts: self.compute_timeouts.load(Ordering::Relaxed),
            flight_followers: self.flight_followers.load(Ordering::Relaxed),

            volatile_degradations: self.volatile_degradations.load(Ordering::Relaxed),
            durable_failures: self.durable_failures.load(Ordering::Relaxed),
            invalid_images: self.invalid_images.load(Ordering::Relaxed),
            corrupt_volatile_values: self.corrupt_volatile_values.load(Ordering::Relaxed),

            invalidations: self.invalidations.load(Ordering::Relaxed),
            records_swept: self.records_swept.load(Ordering::Relaxed),

            hit_latency: Duration::from_micros(self.hit_latency_us.load(Ordering::Relaxed)),
            compute_latency: Duration::from_micros(
                self.compute_latency_us.load(Ordering::Relaxed),
            ),
            in_flight: 0,
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.volatile_hits,
            &self.durable_hits,
            &self.similarity_hits,
            &self.misses,
            &self.computes,
            &self.compute_failures,
            &self.compute_timeouts,
            &self.flight_followers,
            &self.volatile_degradations,
            &self.durable_failures,
            &self.invalid_images,
            &self.corrupt_volatile_values,
            &self.invalidations,
            &self.records_swept,
            &self.hit_latency_us,
            &self.compute_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    // Lookups
    pub volatile_hits: u64,
    pub durable_hits: u64,
    pub similarity_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,

    // Compute
    pub computes: u64,
    pub compute_failures: u64,
    pub compute_timeouts: u64,
    pub flight_followers: u64,

    // Failures
    pub volatile_degradations: u64,
    pub durable_failures: u64,
    pub invalid_images: u64,
    pub corrupt_volatile_values: u64,

    // Maintenance
    pub invalidations: u64,
    pub records_swept: u64,

    // Latency
    pub hit_latency: Duration,
    pub compute_latency: Duration,

    /// Fingerprints with a compute in progress
    pub in_flight: u64,
}

impl MetricsSnapshot {
    /// Requests answered from either tier
    pub fn hits(&self) -> u64 {
        self.volatile_hits + self.durable_hits + self.similarity_hits
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(HitSource::Volatile, Duration::from_micros(50));
        metrics.record_hit(HitSource::Similarity, Duration::from_micros(50));
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_computed_source_counts_as_miss() {
        let metrics = CacheMetrics::new();
        metrics.record_hit(HitSource::Computed, Duration::from_millis(900));
        assert_eq!(metrics.hits(), 0);
        assert_eq!(metrics.misses(), 1);
        assert_eq!(metrics.snapshot().hit_latency, Duration::ZERO);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_compute(Duration::from_micros(100));
        assert_eq!(
            metrics.snapshot().compute_latency,
            Duration::from_micros(100)
        );

        // EMA should smooth values
        metrics.record_compute(Duration::from_micros(200));
        let latency = metrics.snapshot().compute_latency.as_micros();
        assert!(latency > 100 && latency < 200);
        assert_eq!(metrics.computes(), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(HitSource::Durable, Duration::from_micros(10));
        metrics.record_volatile_degradation();
        metrics.record_flight_follower();
        metrics.record_swept(4);
        metrics.record_invalidations(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.durable_hits, 1);
        assert_eq!(snapshot.hits(), 1);
        assert_eq!(snapshot.volatile_degradations, 1);
        assert_eq!(snapshot.flight_followers, 1);
        assert_eq!(snapshot.records_swept, 4);
        assert_eq!(snapshot.invalidations, 2);
        assert_eq!(snapshot.hit_ratio, 1.0);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(HitSource::Volatile, Duration::from_micros(10));
        metrics.record_compute_failure();
        metrics.record_invalid_image();

        metrics.reset();

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = tracker.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
    }
}
