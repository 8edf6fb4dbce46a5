//! Shared fixtures for integration tests.

#![allow(dead_code)]

use serving::admission::CircuitBreaker;
use serving::config::{AdmissionConfig, CacheConfig, ExecutorConfig};
use serving::model::LinearArtifact;
use serving::{
    ActiveModel, ActiveModelHandle, FeatureValue, Features, ModelVersion, PredictionCache,
    PredictionService, WorkerPool,
};
use std::path::Path;
use std::sync::Arc;

/// Linear model `intercept + x`, so each version scores distinguishably.
pub fn linear_json(intercept: f64) -> String {
    format!(
        r#"{{"kind":"linear","intercept":{},"coefficients":{{"x":1.0}}}}"#,
        intercept
    )
}

/// Model that fails every call without an `always_missing` feature.
pub const FAILING_MODEL: &str =
    r#"{"kind":"linear","coefficients":{"x":1.0},"required":["always_missing"]}"#;

pub fn write_artifact(dir: &Path, name: &str, json: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, json).unwrap();
    path.display().to_string()
}

pub fn features_x(x: f64) -> Features {
    let mut f = Features::new();
    f.insert("x".to_string(), FeatureValue::Number(x));
    f
}

pub fn active_model(version: &str, json: &str) -> ActiveModel {
    let artifact = LinearArtifact::from_json(json).unwrap();
    ActiveModel::new(
        ModelVersion::staging(version, format!("{}.json", version)),
        Arc::new(artifact),
    )
}

pub fn small_executor() -> ExecutorConfig {
    ExecutorConfig {
        worker_pool_size: 2,
        call_timeout_ms: 1000,
        ..Default::default()
    }
}

/// Service over an in-memory cache with no hot swap attached.
pub fn service_with(model: ActiveModel, admission: AdmissionConfig) -> PredictionService {
    PredictionService::new(
        Arc::new(ActiveModelHandle::new(model)),
        Arc::new(CircuitBreaker::new(admission)),
        Arc::new(WorkerPool::new(&small_executor()).unwrap()),
        Arc::new(PredictionCache::in_memory(&CacheConfig::default())),
    )
}
