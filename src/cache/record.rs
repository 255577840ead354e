//! Cache Record Types
//!
//! The unit of storage shared by both tiers, plus the labels the
//! orchestrator attaches to every answer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ports::{AnalysisResult, EntityId};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// One stored analysis, keyed by the fingerprint it was computed for.
///
/// `expires_at > created_at` always holds. A record at or past `expires_at`
/// is tombstoned: it may still be stored but is never served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Row identity (stable across TTL refreshes)
    pub id: Uuid,
    /// Fingerprint the analysis was computed for
    pub fingerprint: Fingerprint,
    /// Provider output, returned verbatim
    pub result: AnalysisResult,
    /// First computation time
    pub created_at: DateTime<Utc>,
    /// End of life for both tiers
    pub expires_at: DateTime<Utc>,
    /// Weak back-reference into the equipment catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_entity_id: Option<EntityId>,
}

impl CacheRecord {
    /// Create a record that lives for `ttl` from `now`
    pub fn new(
        fingerprint: Fingerprint,
        result: AnalysisResult,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let expires_at = expiry(now, ttl)?;
        Self::with_times(fingerprint, result, now, expires_at)
    }

    /// Create a record with explicit timestamps (imports, tests)
    pub fn with_times(
        fingerprint: Fingerprint,
        result: AnalysisResult,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        if expires_at <= created_at {
            return Err(Error::Internal(format!(
                "record {} would expire at {} before creation at {}",
                fingerprint, expires_at, created_at
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            fingerprint,
            result,
            created_at,
            expires_at,
            linked_entity_id: None,
        })
    }

    /// Attach a catalog back-reference
    pub fn with_entity(mut self, entity: EntityId) -> Self {
        self.linked_entity_id = Some(entity);
        self
    }

    /// Tombstoned at `now`?
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Lifetime left at `now`, `None` once tombstoned
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Same record with `expires_at` pushed to `now + ttl`
    pub fn refreshed(&self, ttl: Duration, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = expiry(now, ttl)?;
        if expires_at <= self.created_at {
            return Err(Error::Internal(format!(
                "refresh of {} would expire before creation",
                self.fingerprint
            )));
        }
        Ok(Self {
            expires_at,
            ..self.clone()
        })
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    if ttl.is_zero() {
        return Err(Error::Config("record TTL must be greater than 0".to_string()));
    }
    let delta = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Config(format!("record TTL {:?} out of range: {}", ttl, e)))?;
    now.checked_add_signed(delta)
        .ok_or_else(|| Error::Config(format!("record TTL {:?} overflows the calendar", ttl)))
}

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitKind {
    /// The query fingerprint itself was cached
    ExactHit,
    /// A stored fingerprint within the similarity threshold was reused
    SimilarHit,
    /// Nothing usable was cached; the analysis was computed
    Miss,
}

impl std::fmt::Display for HitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HitKind::ExactHit => write!(f, "exact_hit"),
            HitKind::SimilarHit => write!(f, "similar_hit"),
            HitKind::Miss => write!(f, "miss"),
        }
    }
}

/// Where the answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitSource {
    /// Volatile tier, exact key
    Volatile,
    /// Durable tier, exact key
    Durable,
    /// Durable tier, similarity search
    Similarity,
    /// Compute capability
    Computed,
}

impl std::fmt::Display for HitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HitSource::Volatile => write!(f, "volatile"),
            HitSource::Durable => write!(f, "durable"),
            HitSource::Similarity => write!(f, "similarity"),
            HitSource::Computed => write!(f, "computed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn result() -> AnalysisResult {
        AnalysisResult::new("Cable Machine", "strength", "test")
    }

    #[test]
    fn test_new_record_lifetime() {
        let now = Utc::now();
        let record = CacheRecord::new(
            Fingerprint::from_bits(1),
            result(),
            Duration::from_secs(60),
            now,
        )
        .unwrap();

        assert_eq!(record.created_at, now);
        assert_eq!(record.expires_at, now + chrono::Duration::seconds(60));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::seconds(60)));
        assert_eq!(record.remaining_ttl(now), Some(Duration::from_secs(60)));
        assert_eq!(
            record.remaining_ttl(now + chrono::Duration::seconds(61)),
            None
        );
    }

    #[test]
    fn test_rejects_non_positive_lifetime() {
        let now = Utc::now();
        assert_matches!(
            CacheRecord::new(Fingerprint::from_bits(1), result(), Duration::ZERO, now),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheRecord::with_times(Fingerprint::from_bits(1), result(), now, now),
            Err(Error::Internal(_))
        );
    }

    #[test]
    fn test_lifetime_past_calendar_is_an_error() {
        let now = Utc::now();
        let huge = Duration::from_secs(100_000_000 * 86_400);
        assert_matches!(
            CacheRecord::new(Fingerprint::from_bits(1), result(), huge, now),
            Err(Error::Config(_))
        );

        let record =
            CacheRecord::new(Fingerprint::from_bits(1), result(), Duration::from_secs(1), now)
                .unwrap();
        assert_matches!(record.refreshed(huge, now), Err(Error::Config(_)));
    }

    #[test]
    fn test_refresh_keeps_identity() {
        let now = Utc::now();
        let record = CacheRecord::new(
            Fingerprint::from_bits(9),
            result(),
            Duration::from_secs(10),
            now,
        )
        .unwrap()
        .with_entity(EntityId::new("equip-9"));

        let later = now + chrono::Duration::seconds(5);
        let refreshed = record.refreshed(Duration::from_secs(10), later).unwrap();
        assert_eq!(refreshed.id, record.id);
        assert_eq!(refreshed.created_at, record.created_at);
        assert_eq!(refreshed.expires_at, later + chrono::Duration::seconds(10));
        assert_eq!(refreshed.linked_entity_id, Some(EntityId::new("equip-9")));
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = CacheRecord::new(
            Fingerprint::from_bits(0xabcd),
            result(),
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"fingerprint\":\"000000000000abcd\""));
        assert!(!json.contains("linkedEntityId"));
        let back: CacheRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_labels() {
        assert_eq!(HitKind::ExactHit.to_string(), "exact_hit");
        assert_eq!(HitKind::SimilarHit.to_string(), "similar_hit");
        assert_eq!(HitKind::Miss.to_string(), "miss");
        assert_eq!(HitSource::Similarity.to_string(), "similarity");
    }
}
