//! Scorable artifacts and the loader that builds them from disk.
//!
//! Capabilities are fixed when the artifact is loaded; nothing is probed per call.

use crate::error::{LoadError, ScoringError};
use crate::types::{FeatureValue, Features, Metrics, Prediction};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// An in-memory model that can score one feature map.
///
/// `score` is synchronous and may be CPU heavy; callers run it on the worker pool.
pub trait ScoringArtifact: Send + Sync + fmt::Debug {
    fn score(&self, features: &Features) -> Result<Prediction, ScoringError>;

    /// Evaluation metrics embedded in the artifact, if any.
    fn metrics(&self) -> &Metrics;
}

/// Builds artifacts from an `artifact_path`. Loading may be slow.
pub trait ArtifactLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn ScoringArtifact>, LoadError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearKind {
    /// Plain weighted sum
    Linear,
    /// Weighted sum through a sigmoid, thresholded into a label
    Logistic,
}

/// Linear / logistic model stored as JSON.
///
/// Numeric and boolean features contribute `weight * value`. Text features
/// contribute the weight stored under `"name=value"`. Unknown features are ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct LinearArtifact {
    pub kind: LinearKind,
    #[serde(default)]
    pub intercept: f64,
    pub coefficients: HashMap<String, f64>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Negative and positive class labels
    #[serde(default)]
    pub labels: Option<(String, String)>,
    /// Features that must be present for a call to succeed
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub metrics: Metrics,
}

fn default_threshold() -> f64 {
    0.5
}

impl LinearArtifact {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Terms are summed in feature-name order so rounding never depends on
    /// the map's iteration order.
    fn linear_term(&self, features: &Features) -> Result<f64, ScoringError> {
        let sorted: BTreeMap<&String, &FeatureValue> = features.iter().collect();
        let mut sum = self.intercept;
        for (name, value) in sorted {
            match value {
                FeatureValue::Text(text) => {
                    if let Some(w) = self.coefficients.get(&format!("{}={}", name, text)) {
                        sum += w;
                    }
                }
                FeatureValue::Null => {}
                other => {
                    if let (Some(w), Some(x)) = (self.coefficients.get(name), other.as_f64()) {
                        if !x.is_finite() {
                            return Err(ScoringError::Model(format!(
                                "feature '{}' is not finite",
                                name
                            )));
                        }
                        sum += w * x;
                    }
                }
            }
        }
        Ok(sum)
    }
}

impl ScoringArtifact for LinearArtifact {
    fn score(&self, features: &Features) -> Result<Prediction, ScoringError> {
        if let Some(missing) = self.required.iter().find(|r| !features.contains_key(*r)) {
            return Err(ScoringError::Model(format!(
                "missing required feature '{}'",
                missing
            )));
        }

        let z = self.linear_term(features)?;
        match self.kind {
            LinearKind::Linear => Ok(Prediction {
                score: z,
                label: None,
            }),
            LinearKind::Logistic => {
                let p = 1.0 / (1.0 + (-z).exp());
                let positive = p >= self.threshold;
                let label = match &self.labels {
                    Some((neg, pos)) => Some(if positive { pos.clone() } else { neg.clone() }),
                    None => Some(if positive { "1" } else { "0" }.to_string()),
                };
                Ok(Prediction { score: p, label })
            }
        }
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Loads [`LinearArtifact`] JSON files.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArtifactLoader;

impl ArtifactLoader for JsonArtifactLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn ScoringArtifact>, LoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let artifact = LinearArtifact::from_json(&raw).map_err(|e| LoadError::Format {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn features(pairs: &[(&str, FeatureValue)]) -> Features {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_linear_scoring() {
        let model = LinearArtifact::from_json(
            r#"{"kind":"linear","intercept":1.0,"coefficients":{"a":2.0,"color=red":0.5}}"#,
        )
        .unwrap();
        let out = model
            .score(&features(&[("a", FeatureValue::Number(3.0)), ("color", "red".into())]))
            .unwrap();
        assert_eq!(out.score, 7.5);
        assert_eq!(out.label, None);
    }

    #[test]
    fn test_sum_independent_of_map_order() {
        let model = LinearArtifact::from_json(
            r#"{"kind":"linear","coefficients":{"a":1.0,"b":1.0,"c":1.0,"d":1.0}}"#,
        )
        .unwrap();
        let pairs = [("a", 1e16), ("b", 1.0), ("c", -1e16), ("d", 1.0)];

        // every map gets its own hasher seed, so iteration order varies
        for _ in 0..32 {
            let f: Features = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), FeatureValue::Number(*v)))
                .collect();
            assert_eq!(model.score(&f).unwrap().score, 1.0);
        }
    }

    #[test]
    fn test_logistic_labels() {
        let model = LinearArtifact::from_json(
            r#"{"kind":"logistic","coefficients":{"x":1.0},"labels":["stay","churn"]}"#,
        )
        .unwrap();
        let high = model.score(&features(&[("x", FeatureValue::Number(5.0))])).unwrap();
        let low = model.score(&features(&[("x", FeatureValue::Number(-5.0))])).unwrap();
        assert_eq!(high.label.as_deref(), Some("churn"));
        assert_eq!(low.label.as_deref(), Some("stay"));
        assert!(high.score > 0.99);
    }

    #[test]
    fn test_missing_required_feature() {
        let model = LinearArtifact::from_json(
            r#"{"kind":"linear","coefficients":{"a":1.0},"required":["a"]}"#,
        )
        .unwrap();
        let err = model.score(&Features::new()).unwrap_err();
        assert!(matches!(err, ScoringError::Model(_)));
    }

    #[test]
    fn test_loader_reports_format_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"{not json")
            .unwrap();

        let err = JsonArtifactLoader.load(&path).unwrap_err();
        assert!(matches!(err, LoadError::Format { .. }));

        let err = JsonArtifactLoader.load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
