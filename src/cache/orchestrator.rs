//! Analysis Cache - Two-Tier Orchestrator
//!
//! Answers "what is in this image" from the cheapest place that knows:
//!
//! ```text
//!  fingerprint ──▶ volatile[fp] ──▶ durable[fp] ──▶ durable.near(fp) ──▶ compute
//!                     hit              hit              hit              (single-flight)
//!                      │                │ backfill        │ backfill          │ write-back
//!                      ▼                ▼                 ▼                   ▼
//!                  ExactHit         ExactHit          SimilarHit            Miss
//! ```
//!
//! The durable tier is authoritative and its failures are fatal. The
//! volatile tier is an accelerator: errors and timeouts there degrade to a
//! miss. Every tier round-trip is bounded by `tier_timeout`, every compute
//! by `compute_timeout`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use super::codec::RecordCodec;
use super::durable::{DurableStats, DurableTier, InMemoryDurableStore};
use super::flight::{FlightRole, SingleFlight};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::record::{CacheRecord, HitKind, HitSource};
use super::volatile::{InMemoryVolatileStore, VolatileStats, VolatileTier};
use crate::adapters::NoopEventPublisher;
use crate::config::CacheConfig;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{AnalysisResult, ComputeCapability, EntityId, EventPublisher};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter, ImageFrame, ImageInput, PerceptualHasher};

/// Answer to one request
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    /// Record that answered the request
    pub record: CacheRecord,
    /// Exact, similar or computed
    pub hit: HitKind,
    /// Tier (or compute) that produced the answer
    pub source: HitSource,
    /// Fingerprint of the submitted image
    pub fingerprint: Fingerprint,
    /// Hamming distance between the query and the answering record
    pub distance: u32,
    /// Joined a computation started by another caller
    pub shared: bool,
    /// End-to-end latency
    pub latency: Duration,
}

impl AnalysisOutcome {
    pub fn result(&self) -> &AnalysisResult {
        &self.record.result
    }

    pub fn into_result(self) -> AnalysisResult {
        self.record.result
    }
}

/// Tier health for readiness probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub durable: bool,
    /// `None` when the volatile tier is disabled
    pub volatile: Option<bool>,
}

impl HealthStatus {
    /// Serving needs the durable tier only
    pub fn is_ready(&self) -> bool {
        self.durable
    }
}

#[derive(Clone)]
struct FlightOutput {
    record: CacheRecord,
    computed: bool,
}

struct CacheInner {
    config: CacheConfig,
    durable: Arc<dyn DurableTier>,
    volatile: Option<Arc<dyn VolatileTier>>,
    fingerprinter: Arc<dyn Fingerprinter>,
    events: Arc<dyn EventPublisher>,
    codec: RecordCodec,
    flights: SingleFlight<Fingerprint, FlightOutput>,
    /// Canonical fingerprint -> query fingerprints holding a volatile copy of it
    aliases: DashMap<Fingerprint, HashSet<Fingerprint>>,
    metrics: CacheMetrics,
}

/// Content-addressed analysis cache.
///
/// Cheap to clone; clones share tiers, in-flight computations and metrics.
#[derive(Clone)]
pub struct AnalysisCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for AnalysisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisCache")
            .field("config", &self.inner.config)
            .field("fingerprinter", &self.inner.fingerprinter.name())
            .field("volatile", &self.inner.volatile.is_some())
            .finish()
    }
}

impl AnalysisCache {
    /// Start building a cache
    pub fn builder(config: CacheConfig) -> AnalysisCacheBuilder {
        AnalysisCacheBuilder::new(config)
    }

    /// Cache over in-memory tiers (for testing and single-node use)
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        let bands = config.similarity_bands;
        Self::builder(config)
            .durable(Arc::new(InMemoryDurableStore::new(bands)))
            .volatile(Arc::new(InMemoryVolatileStore::new()))
            .build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Fingerprint an image frame
    pub fn fingerprint(&self, frame: &ImageFrame) -> Result<Fingerprint> {
        self.inner.fingerprint(frame)
    }

    /// Return the cached analysis for `image`, computing it at most once
    /// across concurrent callers when nothing close enough is cached.
    #[instrument(skip_all, fields(provider = %compute.name()))]
    pub async fn get_or_compute(
        &self,
        image: &ImageInput,
        compute: Arc<dyn ComputeCapability>,
    ) -> Result<AnalysisOutcome> {
        let started = Instant::now();
        let fingerprint = self.inner.fingerprint(&image.frame)?;
        self.resolve(fingerprint, image.encoded.clone(), compute, started)
            .await
    }

    /// Cache-only lookup; never computes
    #[instrument(skip_all)]
    pub async fn lookup(&self, image: &ImageInput) -> Result<Option<AnalysisOutcome>> {
        let started = Instant::now();
        let fingerprint = self.inner.fingerprint(&image.frame)?;
        self.inner.lookup(fingerprint, started).await
    }

    #[instrument(skip_all, fields(fingerprint = %fingerprint))]
    async fn resolve(
        &self,
        fingerprint: Fingerprint,
        image: Bytes,
        compute: Arc<dyn ComputeCapability>,
        started: Instant,
    ) -> Result<AnalysisOutcome> {
        if let Some(outcome) = self.inner.lookup(fingerprint, started).await? {
            debug!(
                hit = %outcome.hit,
                source = %outcome.source,
                distance = outcome.distance,
                "Served from cache"
            );
            return Ok(outcome);
        }

        let inner = Arc::clone(&self.inner);
        let (result, role) = self
            .inner
            .flights
            .run(fingerprint, move || {
                async move { inner.fill(fingerprint, image, compute).await }.boxed()
            })
            .await;

        let shared = role == FlightRole::Follower;
        if shared {
            self.inner.metrics.record_flight_follower();
        }
        let output = result?;
        let (hit, source) = if output.computed {
            (HitKind::Miss, HitSource::Computed)
        } else {
            (HitKind::ExactHit, HitSource::Durable)
        };
        let mut outcome = self
            .inner
            .answered(output.record, hit, source, fingerprint, 0, started);
        outcome.shared = shared;
        Ok(outcome)
    }

    /// Remove the record for `fingerprint` from both tiers.
    /// Returns true if a durable record existed.
    #[instrument(skip_all, fields(fingerprint = %fingerprint))]
    pub async fn invalidate(&self, fingerprint: Fingerprint) -> Result<bool> {
        let inner = &self.inner;
        inner.evict_volatile(fingerprint).await;
        let removed = inner
            .durable_call("delete", inner.durable.delete(&fingerprint))
            .await?;
        if removed {
            inner.metrics.record_invalidations(1);
            inner
                .publish(CacheEvent::record_invalidated(fingerprint, "explicit"))
                .await;
            info!("Record invalidated");
        }
        Ok(removed)
    }

    /// Remove every record linked to `entity` (the catalog entry was wrong).
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn invalidate_entity(&self, entity: &EntityId) -> Result<usize> {
        let inner = &self.inner;
        let removed = inner
            .durable_call("delete_linked", inner.durable.delete_linked(entity))
            .await?;
        for fingerprint in &removed {
            inner.evict_volatile(*fingerprint).await;
        }
        if !removed.is_empty() {
            inner.metrics.record_invalidations(removed.len() as u64);
            let reason = format!("entity {} corrected", entity);
            inner
                .publish_all(
                    removed
                        .iter()
                        .map(|fp| CacheEvent::record_invalidated(*fp, reason.clone()))
                        .collect(),
                )
                .await;
            info!(count = removed.len(), "Invalidated records linked to entity");
        }
        Ok(removed.len())
    }

    /// Catalog entry deleted: keep the analyses, drop the back-references.
    #[instrument(skip_all, fields(entity = %entity))]
    pub async fn on_entity_deleted(&self, entity: &EntityId) -> Result<usize> {
        let inner = &self.inner;
        let cleared = inner
            .durable_call("clear_entity_links", inner.durable.clear_entity_links(entity))
            .await?;
        for fingerprint in &cleared {
            inner.evict_volatile(*fingerprint).await;
        }
        if !cleared.is_empty() {
            inner
                .publish(CacheEvent::entity_links_cleared(
                    entity.clone(),
                    cleared.len() as u64,
                ))
                .await;
            info!(count = cleared.len(), "Cleared entity back-references");
        }
        Ok(cleared.len())
    }

    /// Point a record at a catalog entity. Returns false if no record exists.
    #[instrument(skip_all, fields(fingerprint = %fingerprint, entity = %entity))]
    pub async fn link_entity(&self, fingerprint: Fingerprint, entity: EntityId) -> Result<bool> {
        let inner = &self.inner;
        let linked = inner
            .durable_call(
                "set_entity_link",
                inner.durable.set_entity_link(&fingerprint, Some(entity)),
            )
            .await?;
        if linked {
            inner.evict_volatile(fingerprint).await;
        }
        Ok(linked)
    }

    /// Extend a live record's lifetime by a full `durable_ttl` from now.
    /// Tombstoned records are not revived.
    #[instrument(skip_all, fields(fingerprint = %fingerprint))]
    pub async fn refresh_ttl(&self, fingerprint: Fingerprint) -> Result<Option<CacheRecord>> {
        let inner = &self.inner;
        let now = Utc::now();
        let record = match inner
            .durable_call("get", inner.durable.get(&fingerprint))
            .await?
        {
            Some(record) if !record.is_expired(now) => record,
            _ => return Ok(None),
        };

        let refreshed = record.refreshed(inner.config.durable_ttl, now)?;
        inner
            .durable_call("upsert", inner.durable.upsert(refreshed.clone()))
            .await?;
        inner.evict_volatile(fingerprint).await;
        debug!(expires_at = %refreshed.expires_at, "Record lifetime extended");
        Ok(Some(refreshed))
    }

    /// Physically remove tombstoned durable records
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<u64> {
        let inner = &self.inner;
        let removed = inner
            .durable_call("delete_expired", inner.durable.delete_expired(Utc::now()))
            .await?;
        for fingerprint in &removed {
            inner.aliases.remove(fingerprint);
        }

        let count = removed.len() as u64;
        if count > 0 {
            inner.metrics.record_swept(count);
            inner.publish(CacheEvent::records_swept(count)).await;
            info!(removed = count, "Swept expired records");
        }
        Ok(count)
    }

    /// Probe both tiers
    pub async fn health(&self) -> HealthStatus {
        let inner = &self.inner;
        let durable = inner
            .durable_call("health_check", inner.durable.health_check())
            .await
            .is_ok();
        let volatile = match &inner.volatile {
            Some(tier) => Some(
                matches!(
                    tokio::time::timeout(inner.config.tier_timeout, tier.health_check()).await,
                    Ok(Ok(()))
                ),
            ),
            None => None,
        };
        HealthStatus { durable, volatile }
    }

    /// Get metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        snapshot.in_flight = self.inner.flights.in_flight() as u64;
        snapshot
    }

    pub fn durable_stats(&self) -> DurableStats {
        self.inner.durable.stats()
    }

    pub fn volatile_stats(&self) -> Option<VolatileStats> {
        self.inner.volatile.as_ref().map(|tier| tier.stats())
    }
}

impl CacheInner {
    fn fingerprint(&self, frame: &ImageFrame) -> Result<Fingerprint> {
        self.fingerprinter.fingerprint(frame).map_err(|e| {
            self.metrics.record_invalid_image();
            debug!(error = %e, "Rejected image");
            e
        })
    }

    async fn lookup(
        &self,
        fingerprint: Fingerprint,
        started: Instant,
    ) -> Result<Option<AnalysisOutcome>> {
        let now = Utc::now();

        if let Some(record) = self.volatile_get(fingerprint, now).await {
            // keyed by the query itself; a similarity backfill keeps its distance
            let distance = fingerprint.hamming_distance(&record.fingerprint);
            return Ok(Some(self.answered(
                record,
                HitKind::ExactHit,
                HitSource::Volatile,
                fingerprint,
                distance,
                started,
            )));
        }

        if let Some(record) = self
            .durable_call("get", self.durable.get(&fingerprint))
            .await?
        {
            if !record.is_expired(now) {
                self.volatile_put(fingerprint, &record, now).await;
                return Ok(Some(self.answered(
                    record,
                    HitKind::ExactHit,
                    HitSource::Durable,
                    fingerprint,
                    0,
                    started,
                )));
            }
            debug!(expires_at = %record.expires_at, "Ignoring tombstoned record");
        }

        let threshold = self.config.similarity_threshold_bits;
        let near = self
            .durable_call(
                "find_near",
                self.durable.find_near(&fingerprint, threshold, now),
            )
            .await?
            .filter(|m| m.distance <= threshold && !m.record.is_expired(now));

        if let Some(found) = near {
            self.volatile_put(fingerprint, &found.record, now).await;
            if self.volatile.is_some() && found.record.fingerprint != fingerprint {
                self.aliases
                    .entry(found.record.fingerprint)
                    .or_default()
                    .insert(fingerprint);
            }
            self.publish(CacheEvent::similarity_matched(
                fingerprint,
                found.record.fingerprint,
                found.distance,
            ))
            .await;
            return Ok(Some(self.answered(
                found.record,
                HitKind::SimilarHit,
                HitSource::Similarity,
                fingerprint,
                found.distance,
                started,
            )));
        }

        Ok(None)
    }

    /// Body of a single-flight computation
    async fn fill(
        &self,
        fingerprint: Fingerprint,
        image: Bytes,
        compute: Arc<dyn ComputeCapability>,
    ) -> Result<FlightOutput> {
        // a flight that just finished may have stored it after our lookup
        let now = Utc::now();
        if let Some(record) = self
            .durable_call("get", self.durable.get(&fingerprint))
            .await?
        {
            if !record.is_expired(now) {
                return Ok(FlightOutput {
                    record,
                    computed: false,
                });
            }
        }

        let provider = compute.name().to_string();
        let timeout = self.config.compute_timeout;
        let tracker = LatencyTracker::start();
        let result = match tokio::time::timeout(timeout, compute.compute(image)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.metrics.record_compute_failure();
                warn!(provider = %provider, error = %e, "Compute failed");
                return Err(match e {
                    Error::ComputeFailed { .. } | Error::ComputeTimeout { .. } => e,
                    other => Error::compute_failed(&provider, other.to_string()),
                });
            }
            Err(_) => {
                self.metrics.record_compute_timeout();
                warn!(provider = %provider, ?timeout, "Compute timed out");
                return Err(Error::ComputeTimeout { timeout });
            }
        };
        let elapsed = tracker.elapsed();
        self.metrics.record_compute(elapsed);

        let now = Utc::now();
        let record = CacheRecord::new(fingerprint, result, self.config.durable_ttl, now)?;
        self.durable_call("upsert", self.durable.upsert(record.clone()))
            .await?;
        self.volatile_put(fingerprint, &record, now).await;

        let compute_ms = elapsed.as_millis() as u64;
        self.publish(CacheEvent::record_created(fingerprint, &provider, compute_ms))
            .await;
        info!(
            fingerprint = %fingerprint,
            provider = %provider,
            compute_ms,
            "Stored new analysis"
        );

        Ok(FlightOutput {
            record,
            computed: true,
        })
    }

    fn answered(
        &self,
        record: CacheRecord,
        hit: HitKind,
        source: HitSource,
        fingerprint: Fingerprint,
        distance: u32,
        started: Instant,
    ) -> AnalysisOutcome {
        let latency = started.elapsed();
        self.metrics.record_hit(source, latency);
        AnalysisOutcome {
            record,
            hit,
            source,
            fingerprint,
            distance,
            shared: false,
            latency,
        }
    }

    // =========================================================================
    // Tier access
    // =========================================================================

    async fn durable_call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.tier_timeout;
        let err = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(Error::DurableTierUnavailable(reason))) => {
                Error::DurableTierUnavailable(format!("{}: {}", operation, reason))
            }
            Ok(Err(e)) => Error::DurableTierUnavailable(format!("{}: {}", operation, e)),
            Err(_) => Error::DurableTierUnavailable(format!(
                "{}: timed out after {:?}",
                operation, timeout
            )),
        };
        self.metrics.record_durable_failure();
        error!(operation, error = %err, "Durable tier call failed");
        Err(err)
    }

    /// `None` means the call failed and the request continues without it
    async fn volatile_call<T, F>(&self, operation: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.tier_timeout;
        let reason = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", timeout),
        };
        self.metrics.record_volatile_degradation();
        warn!(operation, reason = %reason, "Volatile tier degraded, continuing without it");
        self.publish(CacheEvent::volatile_degraded(operation, reason))
            .await;
        None
    }

    async fn volatile_get(&self, key: Fingerprint, now: DateTime<Utc>) -> Option<CacheRecord> {
        let tier = self.volatile.as_ref()?;
        let value = self.volatile_call("get", tier.get(&key)).await??;
        match self.codec.decode(&value) {
            Ok(record) if !record.is_expired(now) => Some(record),
            Ok(_) => {
                self.volatile_call("delete", tier.delete(&key)).await;
                None
            }
            Err(e) => {
                self.metrics.record_corrupt_volatile_value();
                warn!(key = %key, error = %e, "Dropping undecodable volatile value");
                self.volatile_call("delete", tier.delete(&key)).await;
                None
            }
        }
    }

    async fn volatile_put(&self, key: Fingerprint, record: &CacheRecord, now: DateTime<Utc>) {
        let Some(tier) = self.volatile.as_ref() else {
            return;
        };
        let Some(remaining) = record.remaining_ttl(now) else {
            return;
        };
        let ttl = remaining.min(self.config.volatile_ttl);
        match self.codec.encode(record) {
            Ok(value) => {
                self.volatile_call("set", tier.set(&key, value, ttl)).await;
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode record for volatile tier"),
        }
    }

    /// Delete the volatile copy under `fingerprint` and under every query
    /// fingerprint that was backfilled from it
    async fn evict_volatile(&self, fingerprint: Fingerprint) {
        let mut keys = vec![fingerprint];
        if let Some((_, aliases)) = self.aliases.remove(&fingerprint) {
            keys.extend(aliases);
        }
        if let Some(tier) = self.volatile.as_ref() {
            for key in keys {
                self.volatile_call("delete", tier.delete(&key)).await;
            }
        }
    }

    async fn publish(&self, event: CacheEvent) {
        let timeout = self.config.tier_timeout;
        match tokio::time::timeout(timeout, self.events.publish(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to publish cache event"),
            Err(_) => warn!(?timeout, "Dropped cache event, publisher stalled"),
        }
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) {
        let timeout = self.config.tier_timeout;
        let count = events.len();
        match tokio::time::timeout(timeout, self.events.publish_all(events)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to publish cache events"),
            Err(_) => warn!(?timeout, count, "Dropped cache events, publisher stalled"),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Wires tiers, fingerprinter and event publisher into an [`AnalysisCache`]
pub struct AnalysisCacheBuilder {
    config: CacheConfig,
    durable: Option<Arc<dyn DurableTier>>,
    volatile: Option<Arc<dyn VolatileTier>>,
    fingerprinter: Arc<dyn Fingerprinter>,
    events: Arc<dyn EventPublisher>,
}

impl AnalysisCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            durable: None,
            volatile: None,
            fingerprinter: Arc::new(PerceptualHasher::new()),
            events: Arc::new(NoopEventPublisher),
        }
    }

    /// Authoritative store (required)
    pub fn durable(mut self, tier: Arc<dyn DurableTier>) -> Self {
        self.durable = Some(tier);
        self
    }

    /// Accelerator; ignored when `enable_volatile_tier` is false
    pub fn volatile(mut self, tier: Arc<dyn VolatileTier>) -> Self {
        self.volatile = Some(tier);
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<AnalysisCache> {
        self.config.validate()?;
        let durable = self
            .durable
            .ok_or_else(|| Error::Config("a durable tier is required".to_string()))?;
        let volatile = if self.config.enable_volatile_tier {
            self.volatile
        } else {
            None
        };

        if !self.config.banding_is_exhaustive() {
            warn!(
                threshold = self.config.similarity_threshold_bits,
                bands = self.config.similarity_bands,
                "Similarity threshold not below band count; near-duplicate search will scan every record"
            );
        }
        info!(
            fingerprinter = self.fingerprinter.name(),
            threshold = self.config.similarity_threshold_bits,
            volatile = volatile.is_some(),
            "Analysis cache ready"
        );

        Ok(AnalysisCache {
            inner: Arc::new(CacheInner {
                codec: RecordCodec::new(self.config.compression_threshold),
                config: self.config,
                durable,
                volatile,
                fingerprinter: self.fingerprinter,
                events: self.events,
                flights: SingleFlight::new(),
                aliases: DashMap::new(),
                metrics: CacheMetrics::new(),
            }),
        })
    }
}
