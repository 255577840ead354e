//! LensCache - Content-Addressable Image Analysis Cache
//!
//! Deduplicates expensive AI image-analysis calls by indexing prior results
//! under a perceptual fingerprint of the input image. Near-duplicates
//! (re-encoded, resized, re-lit) reuse the stored analysis through a
//! Hamming-radius search; concurrent requests for the same picture share a
//! single computation.
//!
//! # Architecture
//!
//! ```text
//! ImageInput ──▶ Fingerprinter ──▶ AnalysisCache ──▶ volatile ─▶ durable ─▶ similar ─▶ compute
//!                                       │
//!                                       ├── SingleFlight (per fingerprint)
//!                                       ├── ExpirySweeper (tombstone GC)
//!                                       └── CacheMetrics ──▶ MetricsExporter (/metrics)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lenscache::{AnalysisCache, CacheConfig, ComputeFn, AnalysisResult, ImageFrame, ImageInput};
//!
//! let cache = AnalysisCache::in_memory(CacheConfig::default())?;
//! let compute = Arc::new(ComputeFn::new("vision", |bytes| async move {
//!     Ok(AnalysisResult::new("Kettlebell", "free-weights", "vision"))
//! }));
//!
//! let image = ImageInput::new(jpeg_bytes, ImageFrame::rgb(width, height, pixels));
//! let outcome = cache.get_or_compute(&image, compute).await?;
//! println!("{:?}: {}", outcome.hit, outcome.result().equipment_name);
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Tiers, similarity index, single-flight and orchestrator
//! - [`config`] - Cache policy configuration
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus exposition
//! - [`fingerprint`] - Perceptual fingerprint functions

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod exporter;
pub mod fingerprint;

// Re-export commonly used types
pub use cache::{
    AnalysisCache, AnalysisOutcome, CacheRecord, DurableTier, ExpirySweeper, HitKind, HitSource,
    InMemoryDurableStore, InMemoryVolatileStore, MetricsSnapshot, VolatileTier,
};
pub use config::CacheConfig;
pub use domain::{AnalysisResult, CacheEvent, ComputeCapability, ComputeFn, EntityId};
pub use error::{Error, Result};
pub use exporter::MetricsExporter;
pub use fingerprint::{
    DifferenceHasher, Fingerprint, Fingerprinter, ImageFrame, ImageInput, PerceptualHasher,
    PixelFormat,
};
