//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ComputeCapability │ EventPublisher                        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ HttpComputeProvider                                        │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  │ CompositeEventPublisher │ NoopEventPublisher               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lenscache::adapters::{HttpComputeProvider, HttpProviderConfig};
//! use lenscache::domain::ports::ComputeCapability;
//!
//! let provider: Arc<dyn ComputeCapability> =
//!     Arc::new(HttpComputeProvider::new(HttpProviderConfig::default())?);
//! let outcome = cache.get_or_compute(&image, provider).await?;
//! ```

mod event_publisher;
mod http_provider;

pub use event_publisher::{
    CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher, NoopEventPublisher,
};
pub use http_provider::{HttpComputeProvider, HttpProviderConfig};
