//! Volatile Tier
//!
//! Best-effort key-value cache with per-entry TTL, consulted before the
//! durable tier. Values are opaque bytes produced by
//! [`RecordCodec`](super::codec::RecordCodec).
//!
//! Every failure here is survivable: the orchestrator treats errors and
//! timeouts as misses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Volatile key-value backend trait (Redis, Memcached, in-process...)
#[async_trait]
pub trait VolatileTier: Send + Sync {
    /// Fetch a live value
    async fn get(&self, key: &Fingerprint) -> Result<Option<Bytes>>;

    /// Store a value that disappears after `ttl`
    async fn set(&self, key: &Fingerprint, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove a value. Returns true if one was present.
    async fn delete(&self, key: &Fingerprint) -> Result<bool>;

    /// Drop everything
    async fn clear(&self) -> Result<()>;

    /// Round-trip check for readiness probes
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Get backend statistics
    fn stats(&self) -> VolatileStats;
}

/// Volatile backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolatileStats {
    /// Live entries (approximate; lazily expired)
    pub entry_count: u64,
    /// Total bytes held
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    /// Entries dropped because their TTL ran out
    pub expirations: u64,
}

struct VolatileEntry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process volatile tier backed by `DashMap`.
///
/// Expired entries are removed lazily on read and by [`purge_expired`].
///
/// [`purge_expired`]: InMemoryVolatileStore::purge_expired
pub struct InMemoryVolatileStore {
    entries: DashMap<Fingerprint, VolatileEntry>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    expirations: AtomicU64,
}

impl Default for InMemoryVolatileStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }
}

impl InMemoryVolatileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, including not-yet-purged expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let live = entry.expires_at > now;
            if !live {
                self.total_bytes
                    .fetch_sub(entry.value.len() as u64, Ordering::Relaxed);
            }
            live
        });
        let purged = before.saturating_sub(self.entries.len());
        self.expirations
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }
}

#[async_trait]
impl VolatileTier for InMemoryVolatileStore {
    async fn get(&self, key: &Fingerprint) -> Result<Option<Bytes>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.value.clone()));
            }
        }

        // expired or absent
        if let Some((_, stale)) = self.entries.remove_if(key, |_, e| e.expires_at <= now) {
            self.total_bytes
                .fetch_sub(stale.value.len() as u64, Ordering::Relaxed);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, key: &Fingerprint, value: Bytes, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| Error::VolatileTierUnavailable(format!("TTL {:?} out of range", ttl)))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let size = value.len() as u64;
        let entry = VolatileEntry { value, expires_at };
        if let Some(old) = self.entries.insert(*key, entry) {
            self.total_bytes
                .fetch_sub(old.value.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        match self.entries.remove(key) {
            Some((_, old)) => {
                self.total_bytes
                    .fetch_sub(old.value.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> VolatileStats {
        VolatileStats {
            entry_count: self.entries.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
