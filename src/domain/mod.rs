//! Domain Layer
//!
//! Value objects, ports and events shared by the cache and its adapters.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external dependencies
//! - **Events** (`events.rs`) - Cache events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use lenscache::domain::ports::{ComputeCapability, ComputeFn};
//!
//! // The provider is injected, never looked up from a global registry
//! let provider: Arc<dyn ComputeCapability> = Arc::new(ComputeFn::new("stub", |_| async {
//!     Ok(AnalysisResult::new("Squat Rack", "strength", "stub"))
//! }));
//! let outcome = cache.get_or_compute(&image, provider).await?;
//! ```

pub mod events;
pub mod ports;

// Re-export commonly used types
pub use events::CacheEvent;
pub use ports::{AnalysisResult, ComputeCapability, ComputeFn, EntityId, EventPublisher};
