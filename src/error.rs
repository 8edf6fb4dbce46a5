//! Error taxonomy for the serving core.
//!
//! Each component returns its own error type; only [`PredictError`] reaches
//! request callers. Cache failures never leave [`crate::cache::PredictionCache`].

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the cache store. Always degraded to a miss / no-op.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation timed out")]
    Timeout,
    #[error("cache value codec error: {0}")]
    Codec(String),
}

/// The artifact raised an error or the call did not finish in time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoringError {
    #[error("model error: {0}")]
    Model(String),
    #[error("scoring exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("worker dropped the scoring call")]
    WorkerLost,
    #[error("scoring panicked: {0}")]
    Panicked(String),
    #[error("worker pool is closed")]
    PoolClosed,
}

/// Errors surfaced by `PredictionService::predict`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictError {
    /// Admission was refused; the caller may retry after the hinted delay.
    #[error("service unavailable, retry after {retry_after:?}")]
    Unavailable { retry_after: Duration },
    #[error("inference error: {0}")]
    Scoring(#[from] ScoringError),
}

impl PredictError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PredictError::Unavailable { .. })
    }
}

/// Failure loading an artifact from disk.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed artifact {path}: {reason}")]
    Format { path: String, reason: String },
    /// The loader panicked or its task was cancelled.
    #[error("loading {path} aborted: {reason}")]
    Aborted { path: String, reason: String },
}

/// Model registry failures.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("model version {0} not found")]
    NotFound(String),
    #[error("invalid state transition for {version}: {from} -> {to}")]
    InvalidState {
        version: String,
        from: String,
        to: String,
    },
    #[error("registry codec error: {0}")]
    Codec(String),
    #[error("registry I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Hot-swap failures. None of these ever leave the active handle half-updated.
#[derive(Error, Debug)]
pub enum HotSwapError {
    #[error("candidate rejected: {0}")]
    Validation(String),
    #[error("candidate failed to load: {0}")]
    Load(#[from] LoadError),
    /// Registry update failed after the artifact was swapped in; the swap was rolled back.
    #[error("promotion rolled back: {0}")]
    Apply(RegistryError),
    #[error("registry query failed: {0}")]
    Registry(RegistryError),
    #[error("model version {0} not found")]
    NotFound(String),
    #[error("no production or valid staging model available")]
    NoModel,
    #[error("hot swap is not configured for this service")]
    NotConfigured,
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures assembling a `PredictionService` at process start.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open model registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to load initial model: {0}")]
    HotSwap(#[from] HotSwapError),
    #[error("failed to start {what}: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}
