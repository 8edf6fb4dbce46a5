//! Zero-downtime model promotion.
//!
//! Provides two promotion paths:
//! 1. **Scheduled** ([`HotSwapManager::spawn`]): polls the registry for staged versions
//! 2. **Manual** ([`HotSwapManager::swap_to_version`]): operator-triggered, synchronous
//!
//! Both run the same sequence: validate, load outside any lock, swap the handle,
//! record the promotion in the registry (rolling the handle back if that fails),
//! then run post-swap hooks.

pub mod scheduler;

pub use scheduler::HotSwapTask;

use crate::config::HotSwapConfig;
use crate::error::{HotSwapError, LoadError};
use crate::model::{ActiveModel, ActiveModelHandle, ArtifactLoader};
use crate::registry::ModelRegistry;
use crate::types::{now_ms, ModelState, ModelVersion};
use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one promotion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapReport {
    pub previous_version: Option<String>,
    pub new_version: String,
    /// Validation + load + swap + registry update, in milliseconds
    pub duration_ms: u64,
    /// Completion time (Unix ms)
    pub timestamp: u64,
}

/// Work to run after a successful promotion (e.g. cache invalidation).
#[async_trait]
pub trait PromotionHook: Send + Sync {
    async fn on_promoted(&self, report: &SwapReport);
}

/// Snapshot of the manager for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HotSwapStatus {
    pub last_poll_at: Option<u64>,
    pub last_promotion: Option<SwapReport>,
    pub consecutive_failures: u64,
}

/// Check a candidate before any loading happens.
///
/// The artifact must exist and be readable. When the candidate reports the
/// configured metric it must reach `min_acceptable_metric`.
pub fn validate_candidate(
    candidate: &ModelVersion,
    config: &HotSwapConfig,
) -> Result<(), HotSwapError> {
    if candidate.state == ModelState::Archived {
        return Err(HotSwapError::Validation(format!(
            "{} is archived",
            candidate.version
        )));
    }

    let path = PathBuf::from(&candidate.artifact_path);
    let meta = std::fs::metadata(&path).map_err(|e| {
        HotSwapError::Validation(format!("artifact {} not found: {}", path.display(), e))
    })?;
    if !meta.is_file() {
        return Err(HotSwapError::Validation(format!(
            "artifact {} is not a file",
            path.display()
        )));
    }
    File::open(&path).map_err(|e| {
        HotSwapError::Validation(format!("artifact {} unreadable: {}", path.display(), e))
    })?;

    if let Some(value) = candidate.metrics.get(&config.metric_name) {
        if *value < config.min_acceptable_metric {
            return Err(HotSwapError::Validation(format!(
                "{} {} = {} below minimum {}",
                candidate.version, config.metric_name, value, config.min_acceptable_metric
            )));
        }
    }
    Ok(())
}

/// Load a candidate on the blocking pool, validating it first when `validation` is given.
///
/// A candidate that is not yet in production is stamped with `promoted_at`,
/// the same timestamp the registry receives.
async fn load_candidate(
    loader: Arc<dyn ArtifactLoader>,
    candidate: ModelVersion,
    validation: Option<HotSwapConfig>,
    promoted_at: u64,
) -> Result<ActiveModel, HotSwapError> {
    let path = candidate.artifact_path.clone();
    tokio::task::spawn_blocking(move || -> Result<ActiveModel, HotSwapError> {
        if let Some(config) = &validation {
            validate_candidate(&candidate, config)?;
        }
        let artifact = loader.load(PathBuf::from(&candidate.artifact_path).as_path())?;
        let mut version = candidate;
        if version.state != ModelState::Production {
            version.state = ModelState::Production;
            version.promoted_at = Some(promoted_at);
        }
        Ok(ActiveModel::new(version, artifact))
    })
    .await
    .map_err(|e| {
        HotSwapError::Load(LoadError::Aborted {
            path,
            reason: e.to_string(),
        })
    })?
}

/// Build the initial handle at process start.
///
/// Uses the registry's production version, or promotes the newest staged
/// version that validates and loads when nothing is in production yet.
pub async fn bootstrap(
    registry: &dyn ModelRegistry,
    loader: Arc<dyn ArtifactLoader>,
    config: &HotSwapConfig,
) -> Result<ActiveModelHandle, HotSwapError> {
    if let Some(prod) = registry.production().map_err(HotSwapError::Registry)? {
        let version = prod.version.clone();
        let model = load_candidate(loader, prod, None, now_ms()).await?;
        info!("bootstrapped production model {}", version);
        return Ok(ActiveModelHandle::new(model));
    }

    for candidate in registry.list_staging().map_err(HotSwapError::Registry)? {
        let version = candidate.version.clone();
        let promoted_at = now_ms();
        match load_candidate(Arc::clone(&loader), candidate, Some(config.clone()), promoted_at).await
        {
            Ok(model) => {
                registry
                    .mark_production_at(&version, promoted_at)
                    .map_err(HotSwapError::Apply)?;
                info!("bootstrapped by promoting staged model {}", version);
                return Ok(ActiveModelHandle::new(model));
            }
            Err(e) => warn!("bootstrap skipped staged model {}: {}", version, e),
        }
    }

    Err(HotSwapError::NoModel)
}

/// Promotes registry versions into the active model handle.
pub struct HotSwapManager {
    handle: Arc<ActiveModelHandle>,
    registry: Arc<dyn ModelRegistry>,
    loader: Arc<dyn ArtifactLoader>,
    config: HotSwapConfig,
    hooks: RwLock<Vec<Arc<dyn PromotionHook>>>,
    /// Serializes scheduled and manual promotions
    promotion: tokio::sync::Mutex<()>,
    last_poll_at: RwLock<Option<u64>>,
    last_promotion: RwLock<Option<SwapReport>>,
    consecutive_failures: AtomicU64,
}

impl HotSwapManager {
    pub fn new(
        handle: Arc<ActiveModelHandle>,
        registry: Arc<dyn ModelRegistry>,
        loader: Arc<dyn ArtifactLoader>,
        config: HotSwapConfig,
    ) -> Self {
        Self {
            handle,
            registry,
            loader,
            config,
            hooks: RwLock::new(Vec::new()),
            promotion: tokio::sync::Mutex::new(()),
            last_poll_at: RwLock::new(None),
            last_promotion: RwLock::new(None),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HotSwapConfig {
        &self.config
    }

    pub fn handle(&self) -> &Arc<ActiveModelHandle> {
        &self.handle
    }

    /// Register a hook run after every successful promotion.
    pub fn add_hook(&self, hook: Arc<dyn PromotionHook>) {
        self.hooks.write().push(hook);
    }

    pub fn status(&self) -> HotSwapStatus {
        HotSwapStatus {
            last_poll_at: *self.last_poll_at.read(),
            last_promotion: self.last_promotion.read().clone(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// One polling cycle: promote the newest staged version, if any.
    ///
    /// A failed candidate stays in staging and is retried on the next cycle.
    pub async fn poll_once(&self) -> Result<Option<SwapReport>, HotSwapError> {
        *self.last_poll_at.write() = Some(now_ms());

        let staging = self
            .registry
            .list_staging()
            .map_err(HotSwapError::Registry)?;
        let candidate = match staging.into_iter().next() {
            Some(c) => c,
            None => return Ok(None),
        };

        self.promote(candidate).await.map(Some)
    }

    /// Promote a specific version now, outside the polling cycle.
    pub async fn swap_to_version(&self, version: &str) -> Result<SwapReport, HotSwapError> {
        let candidate = self
            .registry
            .get(version)
            .map_err(HotSwapError::Registry)?
            .ok_or_else(|| HotSwapError::NotFound(version.to_string()))?;
        self.promote(candidate).await
    }

    async fn promote(&self, candidate: ModelVersion) -> Result<SwapReport, HotSwapError> {
        let _serial = self.promotion.lock().await;
        let start = Instant::now();
        let version = candidate.version.clone();

        let result = self.apply(candidate, start).await;
        match &result {
            Ok(report) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.last_promotion.write() = Some(report.clone());
                info!(
                    "promoted model {} (previous: {}) in {}ms",
                    report.new_version,
                    report.previous_version.as_deref().unwrap_or("none"),
                    report.duration_ms
                );
            }
            Err(e @ HotSwapError::Apply(_)) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                error!("promotion of {} failed: {}", version, e);
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                warn!("candidate {} not promoted: {}", version, e);
            }
        }
        result
    }

    async fn apply(&self, candidate: ModelVersion, start: Instant) -> Result<SwapReport, HotSwapError> {
        let version = candidate.version.clone();
        let promoted_at = now_ms();
        let model = load_candidate(
            Arc::clone(&self.loader),
            candidate,
            Some(self.config.clone()),
            promoted_at,
        )
        .await?;

        let previous = self.handle.swap(model);
        if let Err(e) = self.registry.mark_production_at(&version, promoted_at) {
            self.handle.restore(Arc::clone(&previous));
            error!(
                "registry rejected promotion of {}, rolled back to {}: {}",
                version,
                previous.version_id(),
                e
            );
            return Err(HotSwapError::Apply(e));
        }

        let report = SwapReport {
            previous_version: Some(previous.version_id().to_string()),
            new_version: version,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: now_ms(),
        };

        let hooks: Vec<_> = self.hooks.read().iter().cloned().collect();
        for hook in hooks {
            hook.on_promoted(&report).await;
        }
        Ok(report)
    }
}
