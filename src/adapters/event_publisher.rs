//! Cache Event Sinks
//!
//! Backends for the `EventPublisher` port: structured logs, an in-memory
//! recorder for tests, a fan-out composite and a no-op sink.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

use crate::domain::events::CacheEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Writes each event to `tracing` as a JSON payload.
///
/// Degradation events are always logged at `WARN`; everything else at the
/// configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    level: Level,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self { level: Level::DEBUG }
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log routine events at `INFO`
    pub fn verbose() -> Self {
        Self { level: Level::INFO }
    }

    fn emit(&self, event: &CacheEvent) {
        let kind = event.event_type();
        let fingerprint = event.fingerprint().map(|fp| fp.to_hex()).unwrap_or_default();
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(_) => format!("{:?}", event),
        };

        if matches!(event, CacheEvent::VolatileTierDegraded { .. }) {
            warn!(kind, payload = %payload, "cache event");
        } else if self.level == Level::INFO {
            info!(kind, fingerprint = %fingerprint, payload = %payload, "cache event");
        } else {
            debug!(kind, fingerprint = %fingerprint, payload = %payload, "cache event");
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        self.emit(&event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        events.iter().for_each(|event| self.emit(event));
        Ok(())
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: CacheEvent) -> Result<()> {
        Ok(())
    }

    async fn publish_all(&self, _events: Vec<CacheEvent>) -> Result<()> {
        Ok(())
    }
}

/// Records events in arrival order for assertions
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    recorded: RwLock<Vec<CacheEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<CacheEvent> {
        self.recorded.read().clone()
    }

    pub fn len(&self) -> usize {
        self.recorded.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.read().is_empty()
    }

    pub fn clear(&self) {
        self.recorded.write().clear();
    }

    /// Events whose `event_type()` is `kind`
    pub fn events_of_type(&self, kind: &str) -> Vec<CacheEvent> {
        self.recorded
            .read()
            .iter()
            .filter(|event| event.event_type() == kind)
            .cloned()
            .collect()
    }

    /// Events about one fingerprint
    pub fn events_for(&self, fingerprint: Fingerprint) -> Vec<CacheEvent> {
        self.recorded
            .read()
            .iter()
            .filter(|event| event.fingerprint() == Some(fingerprint))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        self.recorded.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        self.recorded.write().extend(events);
        Ok(())
    }
}

/// Fans every event out to each sink in turn.
///
/// A failing sink does not stop the others; the last failure is returned.
#[derive(Default)]
pub struct CompositeEventPublisher {
    sinks: Vec<Box<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher<P: EventPublisher + 'static>(mut self, sink: P) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        let mut outcome = Ok(());
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()).await {
                outcome = Err(e);
            }
        }
        outcome
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        let mut outcome = Ok(());
        for sink in &self.sinks {
            if let Err(e) = sink.publish_all(events.clone()).await {
                outcome = Err(e);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;

    struct BrokenSink;

    #[async_trait]
    impl EventPublisher for BrokenSink {
        async fn publish(&self, _event: CacheEvent) -> Result<()> {
            Err(Error::Internal("bus down".to_string()))
        }

        async fn publish_all(&self, _events: Vec<CacheEvent>) -> Result<()> {
            Err(Error::Internal("bus down".to_string()))
        }
    }

    #[async_trait]
    impl EventPublisher for Arc<InMemoryEventCollector> {
        async fn publish(&self, event: CacheEvent) -> Result<()> {
            self.as_ref().publish(event).await
        }

        async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
            self.as_ref().publish_all(events).await
        }
    }

    #[tokio::test]
    async fn test_logging_sink_accepts_every_kind() {
        let sink = LoggingEventPublisher::verbose();
        sink.publish_all(vec![
            CacheEvent::record_created(Fingerprint::from_bits(1), "test", 10),
            CacheEvent::volatile_degraded("get", "connection reset"),
            CacheEvent::records_swept(2),
        ])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_collector_filters() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        let fp = Fingerprint::from_bits(0xAB);
        collector
            .publish(CacheEvent::record_created(fp, "a", 5))
            .await
            .unwrap();
        collector
            .publish_all(vec![
                CacheEvent::record_created(Fingerprint::from_bits(2), "a", 7),
                CacheEvent::record_invalidated(fp, "explicit"),
                CacheEvent::records_swept(3),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 4);
        assert_eq!(collector.events_of_type("RecordCreated").len(), 2);
        assert_eq!(collector.events_for(fp).len(), 2);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_composite_reaches_every_sink() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(BrokenSink)
            .with_publisher(Arc::clone(&collector));
        assert_eq!(composite.len(), 2);

        let result = composite.publish(CacheEvent::records_swept(1)).await;
        assert!(result.is_err());
        assert_eq!(collector.len(), 1);
    }

    #[tokio::test]
    async fn test_noop_sink() {
        NoopEventPublisher
            .publish(CacheEvent::records_swept(1))
            .await
            .unwrap();
    }
}
