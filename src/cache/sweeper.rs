//! Expiry Sweeper
//!
//! Background task that periodically removes tombstoned durable records.
//! Readers already ignore them; sweeping only reclaims space.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::orchestrator::AnalysisCache;

/// Periodic tombstone collector
pub struct ExpirySweeper {
    cache: AnalysisCache,
    interval: Duration,
    shutdown: CancellationToken,
}

impl ExpirySweeper {
    /// Sweep every `sweep_interval` from the cache configuration
    pub fn new(cache: AnalysisCache, shutdown: CancellationToken) -> Self {
        let interval = cache.config().sweep_interval;
        Self {
            cache,
            interval,
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the shutdown token is cancelled. Returns total records removed.
    pub async fn run(self) -> u64 {
        info!("Starting expiry sweeper every {:?}", self.interval);

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.cache.sweep_expired().await {
                        Ok(removed) => total += removed,
                        Err(e) => error!("Expiry sweep failed: {}", e),
                    }
                }

                _ = self.shutdown.cancelled() => {
                    info!("Expiry sweeper shutting down after removing {} records", total);
                    break;
                }
            }
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::durable::{DurableTier, InMemoryDurableStore};
    use crate::cache::record::CacheRecord;
    use crate::config::CacheConfig;
    use crate::domain::ports::AnalysisResult;
    use crate::fingerprint::Fingerprint;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweeper_removes_tombstones_until_cancelled() {
        let durable = Arc::new(InMemoryDurableStore::default());
        let now = Utc::now();
        for bits in 0..3u64 {
            let record = CacheRecord::with_times(
                Fingerprint::from_bits(bits),
                AnalysisResult::new("Old", "test", "test"),
                now - chrono::Duration::hours(2),
                now - chrono::Duration::hours(1),
            )
            .unwrap();
            durable.upsert(record).await.unwrap();
        }

        let cache = AnalysisCache::builder(CacheConfig::default())
            .durable(durable.clone())
            .build()
            .unwrap();
        let token = CancellationToken::new();
        let sweeper = ExpirySweeper::new(cache, token.clone()).with_interval(Duration::from_millis(10));
        let handle = tokio::spawn(sweeper.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(durable.len().await.unwrap(), 0);
    }
}
