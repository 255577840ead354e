//! Prometheus Exposition
//!
//! Mirrors [`MetricsSnapshot`] and tier statistics into a private
//! `prometheus::Registry` and renders the text format for `/metrics`.
//!
//! Counters are fed by the delta between consecutive snapshots, so the
//! exporter can be refreshed on every scrape without double counting.

use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::cache::{DurableStats, MetricsSnapshot, VolatileStats};
use crate::error::{Error, Result};

const NAMESPACE: &str = "lenscache";

/// Registry of cache metrics in Prometheus form
pub struct MetricsExporter {
    registry: Registry,
    lookups: IntCounterVec,
    computes: IntCounterVec,
    flight_followers: IntCounter,
    volatile_degradations: IntCounter,
    durable_failures: IntCounter,
    invalid_images: IntCounter,
    corrupt_volatile_values: IntCounter,
    invalidations: IntCounter,
    records_swept: IntCounter,
    in_flight: IntGauge,
    hit_ratio: Gauge,
    hit_latency: Gauge,
    compute_latency: Gauge,
    tier_entries: IntGaugeVec,
    last: Mutex<MetricsSnapshot>,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish_non_exhaustive()
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .map_err(prom_err)?;
    registry.register(Box::new(counter.clone())).map_err(prom_err)?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE)).map_err(prom_err)?;
    registry.register(Box::new(gauge.clone())).map_err(prom_err)?;
    Ok(gauge)
}

/// Counters only move forward; a reset snapshot counts from zero again
fn delta(current: u64, previous: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

impl MetricsExporter {
    /// Create an exporter with every metric registered
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lookups = IntCounterVec::new(
            Opts::new("lookups_total", "Requests answered, by outcome").namespace(NAMESPACE),
            &["outcome"],
        )
        .map_err(prom_err)?;
        registry.register(Box::new(lookups.clone())).map_err(prom_err)?;

        let computes = IntCounterVec::new(
            Opts::new("computes_total", "Compute calls, by status").namespace(NAMESPACE),
            &["status"],
        )
        .map_err(prom_err)?;
        registry.register(Box::new(computes.clone())).map_err(prom_err)?;

        let in_flight = IntGauge::with_opts(
            Opts::new("computes_in_flight", "Fingerprints with a compute in progress")
                .namespace(NAMESPACE),
        )
        .map_err(prom_err)?;
        registry.register(Box::new(in_flight.clone())).map_err(prom_err)?;

        let tier_entries = IntGaugeVec::new(
            Opts::new("tier_entries", "Entries held per tier").namespace(NAMESPACE),
            &["tier"],
        )
        .map_err(prom_err)?;
        registry.register(Box::new(tier_entries.clone())).map_err(prom_err)?;

        Ok(Self {
            flight_followers: counter(
                &registry,
                "flight_followers_total",
                "Requests that joined an in-progress compute",
            )?,
            volatile_degradations: counter(
                &registry,
                "volatile_degradations_total",
                "Volatile tier operations that failed or timed out",
            )?,
            durable_failures: counter(
                &registry,
                "durable_failures_total",
                "Durable tier operations that failed or timed out",
            )?,
            invalid_images: counter(
                &registry,
                "invalid_images_total",
                "Requests rejected before fingerprinting",
            )?,
            corrupt_volatile_values: counter(
                &registry,
                "corrupt_volatile_values_total",
                "Volatile values that failed to decode",
            )?,
            invalidations: counter(
                &registry,
                "invalidations_total",
                "Records removed by explicit or entity invalidation",
            )?,
            records_swept: counter(
                &registry,
                "records_swept_total",
                "Expired records removed by the sweeper",
            )?,
            hit_ratio: gauge(&registry, "hit_ratio", "Share of requests answered without compute")?,
            hit_latency: gauge(
                &registry,
                "hit_latency_seconds",
                "Moving average latency of cache hits",
            )?,
            compute_latency: gauge(
                &registry,
                "compute_latency_seconds",
                "Moving average latency of compute calls",
            )?,
            registry,
            lookups,
            computes,
            in_flight,
            tier_entries,
            last: Mutex::new(MetricsSnapshot::default()),
        })
    }

    /// Fold a snapshot into the registry
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        let mut last = self.last.lock();

        for (outcome, current, previous) in [
            ("volatile_hit", snapshot.volatile_hits, last.volatile_hits),
            ("durable_hit", snapshot.durable_hits, last.durable_hits),
            ("similar_hit", snapshot.similarity_hits, last.similarity_hits),
            ("miss", snapshot.misses, last.misses),
        ] {
            self.lookups
                .with_label_values(&[outcome])
                .inc_by(delta(current, previous));
        }

        for (status, current, previous) in [
            ("success", snapshot.computes, last.computes),
            ("failure", snapshot.compute_failures, last.compute_failures),
            ("timeout", snapshot.compute_timeouts, last.compute_timeouts),
        ] {
            self.computes
                .with_label_values(&[status])
                .inc_by(delta(current, previous));
        }

        for (counter, current, previous) in [
            (&self.flight_followers, snapshot.flight_followers, last.flight_followers),
            (
                &self.volatile_degradations,
                snapshot.volatile_degradations,
                last.volatile_degradations,
            ),
            (&self.durable_failures, snapshot.durable_failures, last.durable_failures),
            (&self.invalid_images, snapshot.invalid_images, last.invalid_images),
            (
                &self.corrupt_volatile_values,
                snapshot.corrupt_volatile_values,
                last.corrupt_volatile_values,
            ),
            (&self.invalidations, snapshot.invalidations, last.invalidations),
            (&self.records_swept, snapshot.records_swept, last.records_swept),
        ] {
            counter.inc_by(delta(current, previous));
        }

        self.in_flight.set(snapshot.in_flight as i64);
        self.hit_ratio.set(snapshot.hit_ratio);
        self.hit_latency.set(snapshot.hit_latency.as_secs_f64());
        self.compute_latency.set(snapshot.compute_latency.as_secs_f64());

        *last = snapshot.clone();
    }

    /// Record tier sizes
    pub fn update_tiers(&self, durable: &DurableStats, volatile: Option<&VolatileStats>) {
        self.tier_entries
            .with_label_values(&["durable"])
            .set(durable.record_count as i64);
        if let Some(volatile) = volatile {
            self.tier_entries
                .with_label_values(&["volatile"])
                .set(volatile.entry_count as i64);
        }
    }

    /// Update from `snapshot` and encode the whole registry
    pub fn render(&self, snapshot: &MetricsSnapshot) -> Result<Vec<u8>> {
        self.update(snapshot);
        self.encode()
    }

    /// Encode the registry in the text exposition format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        Ok(buffer)
    }

    /// `Content-Type` of [`encode`](Self::encode) output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rendered(exporter: &MetricsExporter, snapshot: &MetricsSnapshot) -> String {
        String::from_utf8(exporter.render(snapshot).unwrap()).unwrap()
    }

    #[test]
    fn test_render_contains_families() {
        let exporter = MetricsExporter::new().unwrap();
        let text = rendered(
            &exporter,
            &MetricsSnapshot {
                volatile_hits: 3,
                misses: 1,
                computes: 1,
                hit_ratio: 0.75,
                in_flight: 2,
                compute_latency: Duration::from_millis(1500),
                ..Default::default()
            },
        );

        assert!(text.contains("lenscache_lookups_total{outcome=\"volatile_hit\"} 3"));
        assert!(text.contains("lenscache_lookups_total{outcome=\"miss\"} 1"));
        assert!(text.contains("lenscache_computes_total{status=\"success\"} 1"));
        assert!(text.contains("lenscache_computes_in_flight 2"));
        assert!(text.contains("lenscache_hit_ratio 0.75"));
        assert!(text.contains("lenscache_compute_latency_seconds 1.5"));
    }

    #[test]
    fn test_counters_follow_deltas() {
        let exporter = MetricsExporter::new().unwrap();
        let mut snapshot = MetricsSnapshot {
            durable_hits: 2,
            records_swept: 4,
            ..Default::default()
        };
        exporter.update(&snapshot);
        exporter.update(&snapshot);

        snapshot.durable_hits = 5;
        let text = rendered(&exporter, &snapshot);
        assert!(text.contains("lenscache_lookups_total{outcome=\"durable_hit\"} 5"));
        assert!(text.contains("lenscache_records_swept_total 4"));
    }

    #[test]
    fn test_reset_snapshot_keeps_counters_monotonic() {
        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&MetricsSnapshot {
            misses: 10,
            ..Default::default()
        });
        let text = rendered(
            &exporter,
            &MetricsSnapshot {
                misses: 2,
                ..Default::default()
            },
        );
        assert!(text.contains("lenscache_lookups_total{outcome=\"miss\"} 12"));
    }

    #[test]
    fn test_tier_entries() {
        let exporter = MetricsExporter::new().unwrap();
        exporter.update_tiers(
            &DurableStats {
                record_count: 7,
                ..Default::default()
            },
            Some(&VolatileStats {
                entry_count: 3,
                ..Default::default()
            }),
        );
        let text = String::from_utf8(exporter.encode().unwrap()).unwrap();
        assert!(text.contains("lenscache_tier_entries{tier=\"durable\"} 7"));
        assert!(text.contains("lenscache_tier_entries{tier=\"volatile\"} 3"));
        assert!(exporter.content_type().starts_with("text/plain"));
    }
}
