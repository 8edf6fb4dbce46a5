//! Core data types shared by every serving component.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ================================================================================================
// FEATURES & PREDICTIONS
// ================================================================================================

/// A single feature value as received from a caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Null,
}

impl FeatureValue {
    /// Numeric view used by linear scoring. Booleans count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(v) => Some(*v),
            FeatureValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Number(v as f64)
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

/// Input to a scoring call. Key order carries no meaning.
pub type Features = HashMap<String, FeatureValue>;

/// Output of a scoring call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Raw score (probability for classifiers, value for regressors)
    pub score: f64,
    /// Class label when the model is a classifier
    pub label: Option<String>,
}

// ================================================================================================
// MODEL VERSIONS
// ================================================================================================

/// Evaluation scores reported for a model version (e.g. `auc`).
pub type Metrics = BTreeMap<String, f64>;

/// Lifecycle state of a model version in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Staging,
    Production,
    Archived,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Staging => "staging",
            ModelState::Production => "production",
            ModelState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staging" => Some(ModelState::Staging),
            "production" => Some(ModelState::Production),
            "archived" => Some(ModelState::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scorable artifact as tracked by the model registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    /// Opaque version identifier (timestamp-derived by the export pipeline)
    pub version: String,
    /// Location of the serialized artifact
    pub artifact_path: String,
    pub state: ModelState,
    #[serde(default)]
    pub metrics: Metrics,
    /// Registration time (Unix ms); orders staging candidates
    #[serde(default)]
    pub created_at: u64,
    /// Promotion time (Unix ms), set once when the version enters production
    #[serde(default)]
    pub promoted_at: Option<u64>,
}

impl ModelVersion {
    /// A fresh staging version.
    pub fn staging(version: impl Into<String>, artifact_path: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            artifact_path: artifact_path.into(),
            state: ModelState::Staging,
            metrics: Metrics::new(),
            created_at: now_ms(),
            promoted_at: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }
}
