//! Durable Tier
//!
//! Authoritative record store. Supports exact lookup by fingerprint and
//! near-duplicate search by Hamming radius.
//!
//! # Design
//!
//! - Pluggable backend behind [`DurableTier`] (SQL table, document store...)
//! - [`InMemoryDurableStore`] keeps records in a `DashMap` and the band
//!   index behind a `parking_lot::RwLock`
//! - Tombstoned records stay physically present until
//!   [`delete_expired`](DurableTier::delete_expired) runs; readers filter them

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::record::CacheRecord;
use super::similarity::{select_nearest, BandIndex, Candidates, SimilarMatch};
use crate::domain::ports::EntityId;
use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Durable storage backend trait
#[async_trait]
pub trait DurableTier: Send + Sync {
    /// Exact lookup. Returns the stored row even if tombstoned.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheRecord>>;

    /// Best live record within `threshold` bits of `fingerprint`
    async fn find_near(
        &self,
        fingerprint: &Fingerprint,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<SimilarMatch>>;

    /// Insert or replace the record for its fingerprint.
    /// Returns true if an existing row was replaced.
    async fn upsert(&self, record: CacheRecord) -> Result<bool>;

    /// Remove one record
    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Remove every record tombstoned at `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<Fingerprint>>;

    /// Null out back-references to `entity`
    async fn clear_entity_links(&self, entity: &EntityId) -> Result<Vec<Fingerprint>>;

    /// Remove every record linked to `entity`
    async fn delete_linked(&self, entity: &EntityId) -> Result<Vec<Fingerprint>>;

    /// Set or clear one record's back-reference.
    /// Returns false if no record exists for `fingerprint`.
    async fn set_entity_link(
        &self,
        fingerprint: &Fingerprint,
        entity: Option<EntityId>,
    ) -> Result<bool>;

    /// Stored rows, tombstones included
    async fn len(&self) -> Result<u64>;

    /// Round-trip check for readiness probes
    async fn health_check(&self) -> Result<()>;

    /// Get storage statistics
    fn stats(&self) -> DurableStats;
}

/// Durable backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableStats {
    /// Rows currently stored
    pub record_count: u64,
    /// Exact lookups
    pub reads: u64,
    /// Similarity searches
    pub searches: u64,
    /// Candidates compared across all searches
    pub candidates_scanned: u64,
    /// Upserts
    pub writes: u64,
    /// Rows removed (explicit, linked and expired)
    pub deletes: u64,
}

/// In-memory durable store for tests and single-node deployments
pub struct InMemoryDurableStore {
    records: DashMap<Fingerprint, CacheRecord>,
    index: RwLock<BandIndex>,
    reads: AtomicU64,
    searches: AtomicU64,
    candidates_scanned: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SIMILARITY_BANDS)
    }
}

impl InMemoryDurableStore {
    /// Create a store whose similarity index uses `bands` bands
    pub fn new(bands: u32) -> Self {
        Self {
            records: DashMap::new(),
            index: RwLock::new(BandIndex::new(bands)),
            reads: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            candidates_scanned: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    fn remove_where<P>(&self, predicate: P) -> Vec<Fingerprint>
    where
        P: Fn(&CacheRecord) -> bool,
    {
        let doomed: Vec<Fingerprint> = self
            .records
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for fingerprint in doomed {
            let mut index = self.index.write();
            // re-check: the row may have been replaced since the scan
            if self
                .records
                .remove_if(&fingerprint, |_, record| predicate(record))
                .is_some()
            {
                index.remove(&fingerprint);
                removed.push(fingerprint);
            }
        }
        self.deletes
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }
}

#[async_trait]
impl DurableTier for InMemoryDurableStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.get(fingerprint).map(|r| r.value().clone()))
    }

    async fn find_near(
        &self,
        fingerprint: &Fingerprint,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<SimilarMatch>> {
        self.searches.fetch_add(1, Ordering::Relaxed);

        let candidates = self.index.read().candidates(fingerprint, threshold);
        let pool: Vec<CacheRecord> = match candidates {
            Candidates::Bucketed(fingerprints) => fingerprints
                .iter()
                .filter_map(|fp| self.records.get(fp).map(|r| r.value().clone()))
                .collect(),
            Candidates::FullScan => self.records.iter().map(|r| r.value().clone()).collect(),
        };
        self.candidates_scanned
            .fetch_add(pool.len() as u64, Ordering::Relaxed);

        Ok(select_nearest(fingerprint, threshold, now, &pool))
    }

    async fn upsert(&self, record: CacheRecord) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let fingerprint = record.fingerprint;
        // rows and index change together under the index lock
        let mut index = self.index.write();
        let replaced = self.records.insert(fingerprint, record).is_some();
        if !replaced {
            index.insert(fingerprint);
        }
        Ok(replaced)
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let mut index = self.index.write();
        if self.records.remove(fingerprint).is_some() {
            index.remove(fingerprint);
            self.deletes.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<Fingerprint>> {
        Ok(self.remove_where(|record| record.is_expired(now)))
    }

    async fn clear_entity_links(&self, entity: &EntityId) -> Result<Vec<Fingerprint>> {
        let mut cleared = Vec::new();
        for mut entry in self.records.iter_mut() {
            if entry.linked_entity_id.as_ref() == Some(entity) {
                entry.linked_entity_id = None;
                cleared.push(*entry.key());
            }
        }
        Ok(cleared)
    }

    async fn delete_linked(&self, entity: &EntityId) -> Result<Vec<Fingerprint>> {
        Ok(self.remove_where(|record| record.linked_entity_id.as_ref() == Some(entity)))
    }

    async fn set_entity_link(
        &self,
        fingerprint: &Fingerprint,
        entity: Option<EntityId>,
    ) -> Result<bool> {
        match self.records.get_mut(fingerprint) {
            Some(mut record) => {
                record.linked_entity_id = entity;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.records.len() as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> DurableStats {
        DurableStats {
            record_count: self.records.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            candidates_scanned: self.candidates_scanned.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::AnalysisResult;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_record(bits: u64) -> CacheRecord {
        CacheRecord::new(
            Fingerprint::from_bits(bits),
            AnalysisResult::new(format!("equipment-{:x}", bits), "test", "test"),
            Duration::from_secs(3600),
            Utc::now(),
        )
        .unwrap()
    }

    fn make_expired(bits: u64) -> CacheRecord {
        let now = Utc::now();
        CacheRecord::with_times(
            Fingerprint::from_bits(bits),
            AnalysisResult::new("Expired", "test", "test"),
            now - chrono::Duration::hours(2),
            now - chrono::Duration::hours(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = InMemoryDurableStore::default();
        let record = make_record(0xaa);

        assert!(!store.upsert(record.clone()).await.unwrap());
        assert_eq!(
            store.get(&record.fingerprint).await.unwrap(),
            Some(record.clone())
        );

        // same key again replaces
        let replacement = make_record(0xaa);
        assert!(store.upsert(replacement.clone()).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(
            store.get(&record.fingerprint).await.unwrap().unwrap().id,
            replacement.id
        );
    }

    #[tokio::test]
    async fn test_find_near() {
        let store = InMemoryDurableStore::default();
        store.upsert(make_record(0b1111_0000)).await.unwrap();
        store.upsert(make_record(u64::MAX)).await.unwrap();

        let found = store
            .find_near(&Fingerprint::from_bits(0b1111_0011), 5, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.record.fingerprint, Fingerprint::from_bits(0b1111_0000));
        assert_eq!(found.distance, 2);

        assert!(store
            .find_near(&Fingerprint::from_bits(0x00ff_00ff_0000_0000), 5, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_index_tracks_rows_under_concurrent_churn() {
        let store = Arc::new(InMemoryDurableStore::default());
        let keys: Vec<u64> = (0..8).map(|i| 0x5a5a_0000_0000_0000 | (i << 20)).collect();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let keys = keys.clone();
                tokio::spawn(async move {
                    for round in 0..300 {
                        let bits = keys[round % keys.len()];
                        store.upsert(make_record(bits)).await.unwrap();
                        store.delete(&Fingerprint::from_bits(bits)).await.unwrap();
                        store.upsert(make_record(bits)).await.unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let now = Utc::now();
        for bits in keys {
            let fingerprint = Fingerprint::from_bits(bits);
            let stored = store.get(&fingerprint).await.unwrap().is_some();
            let indexed = store.find_near(&fingerprint, 0, now).await.unwrap().is_some();
            assert_eq!(stored, indexed, "row {} and index disagree", fingerprint);
        }
    }

    #[tokio::test]
    async fn test_find_near_full_scan() {
        // threshold >= bands forces the linear path
        let store = InMemoryDurableStore::new(2);
        store.upsert(make_record(0)).await.unwrap();

        let found = store
            .find_near(&Fingerprint::from_bits(0b111), 3, Utc::now())
            .await
            .unwrap();
        assert_eq!(found.map(|m| m.distance), Some(3));
    }

    #[tokio::test]
    async fn test_find_near_ignores_tombstones() {
        let store = InMemoryDurableStore::default();
        store.upsert(make_expired(0b1)).await.unwrap();

        assert!(store
            .find_near(&Fingerprint::from_bits(0), 5, Utc::now())
            .await
            .unwrap()
            .is_none());
        // still physically present until swept
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = InMemoryDurableStore::default();
        store.upsert(make_expired(1)).await.unwrap();
        store.upsert(make_expired(2)).await.unwrap();
        store.upsert(make_record(3)).await.unwrap();

        let mut removed = store.delete_expired(Utc::now()).await.unwrap();
        removed.sort();
        assert_eq!(
            removed,
            vec![Fingerprint::from_bits(1), Fingerprint::from_bits(2)]
        );
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(!store.index.read().contains(&Fingerprint::from_bits(1)));
        assert_eq!(store.stats().deletes, 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryDurableStore::default();
        store.upsert(make_record(7)).await.unwrap();

        assert!(store.delete(&Fingerprint::from_bits(7)).await.unwrap());
        assert!(!store.delete(&Fingerprint::from_bits(7)).await.unwrap());
        assert!(store.index.read().is_empty());
    }

    #[tokio::test]
    async fn test_entity_links() {
        let store = InMemoryDurableStore::default();
        let rack = EntityId::new("squat-rack");
        store
            .upsert(make_record(1).with_entity(rack.clone()))
            .await
            .unwrap();
        store
            .upsert(make_record(2).with_entity(rack.clone()))
            .await
            .unwrap();
        store.upsert(make_record(3)).await.unwrap();

        let mut cleared = store.clear_entity_links(&rack).await.unwrap();
        cleared.sort();
        assert_eq!(
            cleared,
            vec![Fingerprint::from_bits(1), Fingerprint::from_bits(2)]
        );
        // records survive, only the reference is gone
        assert_eq!(store.len().await.unwrap(), 3);
        let record = store.get(&Fingerprint::from_bits(1)).await.unwrap().unwrap();
        assert_eq!(record.linked_entity_id, None);

        assert!(store
            .set_entity_link(&Fingerprint::from_bits(3), Some(rack.clone()))
            .await
            .unwrap());
        assert!(!store
            .set_entity_link(&Fingerprint::from_bits(99), Some(rack.clone()))
            .await
            .unwrap());

        let removed = store.delete_linked(&rack).await.unwrap();
        assert_eq!(removed, vec![Fingerprint::from_bits(3)]);
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = InMemoryDurableStore::default();
        store.upsert(make_record(1)).await.unwrap();
        store.get(&Fingerprint::from_bits(1)).await.unwrap();
        store.get(&Fingerprint::from_bits(2)).await.unwrap();
        store
            .find_near(&Fingerprint::from_bits(3), 5, Utc::now())
            .await
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.candidates_scanned, 1);
    }
}
