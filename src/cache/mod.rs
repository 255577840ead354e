//! Two-Tier Analysis Cache
//!
//! Content-addressed storage for image analyses, keyed by perceptual
//! fingerprint, with near-duplicate reuse and single-flight computation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          AnalysisCache                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Volatile Tier        │ Durable Tier            │ Compute                │
//! │  ┌────────────────┐   │ ┌────────────────────┐  │ ┌──────────────────┐   │
//! │  │ key -> bytes   │   │ │ fp -> CacheRecord  │  │ │ SingleFlight     │   │
//! │  │ per-entry TTL  │   │ │ + BandIndex (LSH)  │  │ │ per fingerprint  │   │
//! │  │ best effort    │   │ │ authoritative      │  │ │ timeout-bounded  │   │
//! │  └────────────────┘   │ └────────────────────┘  │ └──────────────────┘   │
//! │         │             │           │             │          │             │
//! │         └─────────────┴───────────┴─────────────┴──────────┘             │
//! │                                   │                                      │
//! │                      ExpirySweeper (tombstone GC)                        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - A record at or past `expires_at` is never served
//! - Concurrent requests for one fingerprint trigger at most one compute
//! - Compute failures are never cached
//! - A volatile entry never outlives the durable record it copies

mod codec;
mod durable;
mod flight;
mod metrics;
mod orchestrator;
mod record;
mod similarity;
mod sweeper;
mod volatile;

pub use codec::{Encoding, RecordCodec};
pub use durable::{DurableStats, DurableTier, InMemoryDurableStore};
pub use flight::{FlightRole, SingleFlight};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use orchestrator::{AnalysisCache, AnalysisCacheBuilder, AnalysisOutcome, HealthStatus};
pub use record::{CacheRecord, HitKind, HitSource};
pub use similarity::{select_nearest, BandIndex, Candidates, SimilarMatch};
pub use sweeper::ExpirySweeper;
pub use volatile::{InMemoryVolatileStore, VolatileStats, VolatileTier};
