//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! The core abstractions the cache depends on. Infrastructure adapters
//! implement these traits; tests substitute in-memory fakes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ComputeCapability │ EventPublisher                  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  HttpComputeProvider │ ComputeFn │ LoggingPublisher │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage tiers are ports too, but live next to their in-memory
//! implementations in [`crate::cache`].

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::events::CacheEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Catalog entity identifier (value object).
///
/// The cache only ever holds this as a weak back-reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the analysis provider says about an image.
///
/// Opaque to the cache: stored and returned verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Identified equipment, e.g. "Adjustable Dumbbell"
    pub equipment_name: String,
    /// Equipment category, e.g. "free-weights"
    pub category: String,
    /// Usage steps in order
    #[serde(default)]
    pub instructions: Vec<String>,
    /// Provider confidence in 0.0..=1.0
    pub confidence: f32,
    /// Provenance tag of the provider that produced this result
    #[serde(default)]
    pub provider: String,
    /// Provider model, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AnalysisResult {
    pub fn new(
        equipment_name: impl Into<String>,
        category: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            equipment_name: equipment_name.into(),
            category: category.into(),
            instructions: Vec::new(),
            confidence: 1.0,
            provider: provider.into(),
            model: None,
        }
    }

    pub fn with_instructions<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instructions = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

// =============================================================================
// Compute Port
// =============================================================================

/// Port for the expensive analysis call.
///
/// Cost and latency are unknown to the cache; the call is assumed idempotent
/// for identical image content.
#[async_trait]
pub trait ComputeCapability: Send + Sync {
    /// Provenance name used in logs and errors
    fn name(&self) -> &str;

    /// Analyse the encoded image
    async fn compute(&self, image: Bytes) -> Result<AnalysisResult>;
}

/// Adapts an async closure into a [`ComputeCapability`].
///
/// ```ignore
/// let compute = ComputeFn::new("stub", |_bytes| async {
///     Ok(AnalysisResult::new("Kettlebell", "free-weights", "stub"))
/// });
/// ```
pub struct ComputeFn<F> {
    name: String,
    f: F,
}

impl<F> ComputeFn<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> std::fmt::Debug for ComputeFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeFn").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> ComputeCapability for ComputeFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AnalysisResult>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn compute(&self, image: Bytes) -> Result<AnalysisResult> {
        (self.f)(image).await
    }
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing cache events.
///
/// This trait abstracts event publishing, allowing different backends
/// (log, in-memory, message bus) to be used.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a cache event.
    async fn publish(&self, event: CacheEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
