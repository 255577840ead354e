//! Near-Duplicate Search
//!
//! Banded index over fingerprints for Hamming-radius lookups.
//!
//! # Design
//!
//! The 64 bits are split into `bands` contiguous segments and every stored
//! fingerprint is bucketed by each segment value. Two fingerprints within
//! `d` bits of each other differ in at most `d` segments, so when
//! `d < bands` they share at least one bucket (pigeonhole) and the bucket
//! union is a complete candidate set. Larger radii fall back to a full scan.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::record::CacheRecord;
use crate::fingerprint::{Fingerprint, FINGERPRINT_BITS};

/// Candidate set returned by [`BandIndex::candidates`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// Every fingerprint within the radius is in this set (plus misses)
    Bucketed(Vec<Fingerprint>),
    /// Radius too wide for banding; the caller must scan everything
    FullScan,
}

/// Banded locality index
#[derive(Debug, Clone)]
pub struct BandIndex {
    bands: u32,
    /// One map per band: segment value -> fingerprints carrying it
    buckets: Vec<HashMap<u64, HashSet<Fingerprint>>>,
    members: HashSet<Fingerprint>,
}

impl BandIndex {
    /// Create an index with `bands` segments (clamped to 1..=64)
    pub fn new(bands: u32) -> Self {
        let bands = bands.clamp(1, FINGERPRINT_BITS);
        Self {
            bands,
            buckets: (0..bands).map(|_| HashMap::new()).collect(),
            members: HashSet::new(),
        }
    }

    pub fn bands(&self) -> u32 {
        self.bands
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.members.contains(fingerprint)
    }

    /// Whether a radius of `threshold` bits is answered from buckets alone
    pub fn is_exhaustive_for(&self, threshold: u32) -> bool {
        threshold < self.bands
    }

    /// Index a fingerprint. Returns false if it was already present.
    pub fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        if !self.members.insert(fingerprint) {
            return false;
        }
        for (index, buckets) in self.buckets.iter_mut().enumerate() {
            buckets
                .entry(fingerprint.band(index as u32, self.bands))
                .or_default()
                .insert(fingerprint);
        }
        true
    }

    /// Drop a fingerprint. Returns false if it was not indexed.
    pub fn remove(&mut self, fingerprint: &Fingerprint) -> bool {
        if !self.members.remove(fingerprint) {
            return false;
        }
        for (index, buckets) in self.buckets.iter_mut().enumerate() {
            let segment = fingerprint.band(index as u32, self.bands);
            if let Some(bucket) = buckets.get_mut(&segment) {
                bucket.remove(fingerprint);
                if bucket.is_empty() {
                    buckets.remove(&segment);
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.members.clear();
        for buckets in &mut self.buckets {
            buckets.clear();
        }
    }

    /// Fingerprints that may lie within `threshold` bits of `query`
    pub fn candidates(&self, query: &Fingerprint, threshold: u32) -> Candidates {
        if !self.is_exhaustive_for(threshold) {
            return Candidates::FullScan;
        }
        let mut seen = HashSet::new();
        for (index, buckets) in self.buckets.iter().enumerate() {
            if let Some(bucket) = buckets.get(&query.band(index as u32, self.bands)) {
                seen.extend(bucket.iter().copied());
            }
        }
        Candidates::Bucketed(seen.into_iter().collect())
    }
}

/// A near-duplicate chosen for a query
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMatch {
    pub record: CacheRecord,
    pub distance: u32,
}

/// Pick the best live record within `threshold` bits of `query`.
///
/// Ties on distance go to the newest record, then to the larger id so the
/// choice is deterministic.
pub fn select_nearest<'a, I>(
    query: &Fingerprint,
    threshold: u32,
    now: DateTime<Utc>,
    records: I,
) -> Option<SimilarMatch>
where
    I: IntoIterator<Item = &'a CacheRecord>,
{
    records
        .into_iter()
        .filter(|record| !record.is_expired(now))
        .map(|record| (record, query.hamming_distance(&record.fingerprint)))
        .filter(|(_, distance)| *distance <= threshold)
        .max_by_key(|(record, distance)| (Reverse(*distance), record.created_at, record.id))
        .map(|(record, distance)| SimilarMatch {
            record: record.clone(),
            distance,
        })
}
