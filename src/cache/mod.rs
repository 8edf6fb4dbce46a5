//! Look-aside prediction cache.
//!
//! Keys are `sha256(canonical features) + ":" + model version`. Store failures
//! and timeouts degrade to a miss (on read) or a no-op (on write); they never
//! reach the scoring path.

pub mod store;

pub use store::{CacheStore, MemoryStore};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::hotswap::{PromotionHook, SwapReport};
use crate::types::{FeatureValue, Features, Prediction};
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Serialize features with keys sorted, so insertion order never changes the bytes.
///
/// JSON has no NaN or infinity, so non-finite numbers are written as
/// `{"f64":"NaN"}`-style objects. No other feature value encodes as an
/// object, so they cannot collide with `null` or with each other.
pub fn canonical_serialize(features: &Features) -> Vec<u8> {
    let sorted: BTreeMap<&str, &FeatureValue> =
        features.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let mut out = String::from("{");
    for (i, (name, value)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(name).to_string());
        out.push(':');
        out.push_str(&canonical_value(value).to_string());
    }
    out.push('}');
    out.into_bytes()
}

fn canonical_value(value: &FeatureValue) -> Value {
    match value {
        FeatureValue::Number(n) if n.is_nan() => json!({ "f64": "NaN" }),
        FeatureValue::Number(n) if n.is_infinite() => {
            json!({ "f64": if *n > 0.0 { "inf" } else { "-inf" } })
        }
        FeatureValue::Number(n) => Value::from(*n),
        FeatureValue::Bool(b) => Value::Bool(*b),
        FeatureValue::Text(s) => Value::from(s.as_str()),
        FeatureValue::Null => Value::Null,
    }
}

/// Cache key for one feature map under one model version.
pub fn make_key(features: &Features, model_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_serialize(features));
    format!("{:x}:{}", hasher.finalize(), model_version)
}

/// Cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// Store errors and timeouts absorbed as misses / no-ops
    pub errors: u64,
}

pub struct PredictionCache {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    default_ttl: Duration,
    op_timeout: Duration,
    invalidate_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl PredictionCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            default_ttl: config.ttl(),
            op_timeout: config.op_timeout(),
            invalidate_timeout: config.invalidate_timeout(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Cache over a fresh [`MemoryStore`].
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a cached prediction. Any store failure is a miss.
    pub async fn get(&self, key: &str) -> Option<Prediction> {
        if !self.enabled {
            return None;
        }

        let found = match self.bounded(self.store.get(key)).await {
            Ok(Some(bytes)) => match bincode::deserialize::<Prediction>(&bytes) {
                Ok(prediction) => Some(prediction),
                Err(e) => {
                    self.absorb("get", CacheError::Codec(e.to_string()));
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.absorb("get", e);
                None
            }
        };

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store a prediction with the default TTL.
    pub async fn set(&self, key: &str, prediction: &Prediction) {
        self.set_with_ttl(key, prediction, self.default_ttl).await
    }

    /// Store a prediction with an explicit TTL. Failures are absorbed.
    pub async fn set_with_ttl(&self, key: &str, prediction: &Prediction, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let bytes = match bincode::serialize(prediction) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.absorb("set", CacheError::Codec(e.to_string()));
                return;
            }
        };

        match self.bounded(self.store.set_ex(key, bytes, ttl)).await {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.absorb("set", e),
        }
    }

    /// Delete every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.invalidate("prefix", self.store.delete_prefix(prefix)).await
    }

    /// Delete every entry cached under `version`.
    pub async fn invalidate_version(&self, version: &str) -> usize {
        let suffix = format!(":{}", version);
        self.invalidate("version", self.store.delete_suffix(&suffix)).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    async fn invalidate<F>(&self, what: &str, op: F) -> usize
    where
        F: Future<Output = Result<usize, CacheError>>,
    {
        match tokio::time::timeout(self.invalidate_timeout, op)
            .await
            .unwrap_or(Err(CacheError::Timeout))
        {
            Ok(count) => count,
            Err(e) => {
                self.absorb(what, e);
                0
            }
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .unwrap_or(Err(CacheError::Timeout))
    }

    fn absorb(&self, op: &str, err: CacheError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        debug!("prediction cache {} degraded: {}", op, err);
    }
}

#[async_trait]
impl PromotionHook for PredictionCache {
    async fn on_promoted(&self, report: &SwapReport) {
        if let Some(previous) = &report.previous_version {
            let removed = self.invalidate_version(previous).await;
            info!(
                "invalidated {} cached predictions of model {}",
                removed, previous
            );
        }
    }
}
