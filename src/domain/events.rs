//! Cache Events
//!
//! Immutable records of things that happened to cache records. Used for
//! audit logging and for decoupling side effects (catalog sync, analytics)
//! from the request path.
//!
//! # Example
//!
//! ```ignore
//! let event = CacheEvent::record_created(fingerprint, "openai");
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::EntityId;
use crate::fingerprint::Fingerprint;

/// Event representing a significant occurrence in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A fresh analysis was computed and stored.
    RecordCreated {
        fingerprint: Fingerprint,
        provider: String,
        compute_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A query was answered by a near-duplicate record.
    SimilarityMatched {
        query: Fingerprint,
        matched: Fingerprint,
        distance: u32,
        timestamp: DateTime<Utc>,
    },

    /// A record was removed on request.
    RecordInvalidated {
        fingerprint: Fingerprint,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A catalog entity vanished; back-references were cleared.
    EntityLinksCleared {
        entity_id: EntityId,
        records: u64,
        timestamp: DateTime<Utc>,
    },

    /// The sweeper removed tombstoned records.
    RecordsSwept {
        removed: u64,
        timestamp: DateTime<Utc>,
    },

    /// The volatile tier failed and the request fell back to the durable tier.
    VolatileTierDegraded {
        operation: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub fn record_created(
        fingerprint: Fingerprint,
        provider: impl Into<String>,
        compute_ms: u64,
    ) -> Self {
        CacheEvent::RecordCreated {
            fingerprint,
            provider: provider.into(),
            compute_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn similarity_matched(query: Fingerprint, matched: Fingerprint, distance: u32) -> Self {
        CacheEvent::SimilarityMatched {
            query,
            matched,
            distance,
            timestamp: Utc::now(),
        }
    }

    pub fn record_invalidated(fingerprint: Fingerprint, reason: impl Into<String>) -> Self {
        CacheEvent::RecordInvalidated {
            fingerprint,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn entity_links_cleared(entity_id: EntityId, records: u64) -> Self {
        CacheEvent::EntityLinksCleared {
            entity_id,
            records,
            timestamp: Utc::now(),
        }
    }

    pub fn records_swept(removed: u64) -> Self {
        CacheEvent::RecordsSwept {
            removed,
            timestamp: Utc::now(),
        }
    }

    pub fn volatile_degraded(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheEvent::VolatileTierDegraded {
            operation: operation.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::RecordCreated { .. } => "RecordCreated",
            CacheEvent::SimilarityMatched { .. } => "SimilarityMatched",
            CacheEvent::RecordInvalidated { .. } => "RecordInvalidated",
            CacheEvent::EntityLinksCleared { .. } => "EntityLinksCleared",
            CacheEvent::RecordsSwept { .. } => "RecordsSwept",
            CacheEvent::VolatileTierDegraded { .. } => "VolatileTierDegraded",
        }
    }

    /// Fingerprint the event is about, if any.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            CacheEvent::RecordCreated { fingerprint, .. }
            | CacheEvent::RecordInvalidated { fingerprint, .. } => Some(*fingerprint),
            CacheEvent::SimilarityMatched { query, .. } => Some(*query),
            _ => None,
        }
    }

    /// When the event occurred.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::RecordCreated { timestamp, .. }
            | CacheEvent::SimilarityMatched { timestamp, .. }
            | CacheEvent::RecordInvalidated { timestamp, .. }
            | CacheEvent::EntityLinksCleared { timestamp, .. }
            | CacheEvent::RecordsSwept { timestamp, .. }
            | CacheEvent::VolatileTierDegraded { timestamp, .. } => *timestamp,
        }
    }
}
