//! # Telemetry Module
//!
//! Records prediction outcomes to a rotating JSON-lines log:
//! - Request id and model version
//! - Cache hit or miss
//! - Latency
//! - Outcome (ok, rejected, failed)

pub mod recorder;
pub mod writer;

pub use recorder::{EventOutcome, PredictionEvent, PredictionRecorder, RecorderStats};
pub use writer::{PredictLogConfig, PredictLogStats, PredictLogWriter, RotationPolicy};
