//! # Serving Core
//!
//! In-process inference serving: a look-aside prediction cache, a circuit
//! breaker in front of a bounded scoring worker pool, and zero-downtime model
//! promotion from a model registry.
//!
//! ## Request path
//!
//! ```text
//! predict(features)
//!   -> PredictionCache::get            (hit: return)
//!   -> CircuitBreaker::admit           (refused: Unavailable)
//!   -> WorkerPool::run(active model)
//!   -> PredictionCache::set
//! ```
//!
//! [`HotSwapManager`] runs beside the request path and replaces the model held by
//! [`ActiveModelHandle`] without blocking readers.

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod hotswap;
pub mod model;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod types;

pub use admission::{CircuitBreaker, CircuitState};
pub use cache::{make_key, CacheStore, MemoryStore, PredictionCache};
pub use config::{ExecutionMode, ServingConfig};
pub use error::{HotSwapError, PredictError, ScoringError};
pub use executor::WorkerPool;
pub use hotswap::{HotSwapManager, PromotionHook, SwapReport};
pub use model::{ActiveModel, ActiveModelHandle, ArtifactLoader, JsonArtifactLoader, ScoringArtifact};
pub use registry::{ModelRegistry, SqliteModelRegistry};
pub use service::{Health, PredictOutcome, PredictionService};
pub use types::{FeatureValue, Features, ModelState, ModelVersion, Prediction};
