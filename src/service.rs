//! Prediction service: the composition root.
//!
//! Request path: cache lookup, admission, worker pool, cache write-back.
//! The active model is read once per request, so a concurrent promotion never
//! changes the model or the cache namespace halfway through a call.

use crate::admission::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::cache::{make_key, CacheStats, CacheStore, PredictionCache};
use crate::config::{HotSwapConfig, ServingConfig};
use crate::error::{HotSwapError, PredictError, StartupError};
use crate::executor::{PoolStats, WorkerPool};
use crate::hotswap::{self, HotSwapManager, HotSwapStatus, HotSwapTask, SwapReport};
use crate::model::{ActiveModel, ActiveModelHandle, ArtifactLoader};
use crate::registry::ModelRegistry;
use crate::telemetry::{EventOutcome, PredictionEvent, PredictionRecorder, RecorderStats};
use crate::types::{now_ms, Features, Prediction};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one successful prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOutcome {
    pub prediction: Prediction,
    pub cache_hit: bool,
    pub latency: Duration,
    /// Version that produced (or cached) the prediction
    pub model_version: String,
}

/// Point-in-time service health.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub model_loaded: bool,
    pub model_version: String,
    pub circuit_state: CircuitState,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub breaker: CircuitBreakerStats,
    pub pool: PoolStats,
    pub cache: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hot_swap: Option<HotSwapStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<RecorderStats>,
}

impl Health {
    /// True while new requests can be admitted.
    pub fn is_serving(&self) -> bool {
        self.model_loaded && self.circuit_state != CircuitState::Open
    }
}

pub struct PredictionService {
    handle: Arc<ActiveModelHandle>,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<WorkerPool>,
    cache: Arc<PredictionCache>,
    hot_swap: Option<Arc<HotSwapManager>>,
    recorder: Option<Arc<PredictionRecorder>>,
    task: Mutex<Option<HotSwapTask>>,
}

impl PredictionService {
    pub fn new(
        handle: Arc<ActiveModelHandle>,
        breaker: Arc<CircuitBreaker>,
        pool: Arc<WorkerPool>,
        cache: Arc<PredictionCache>,
    ) -> Self {
        Self {
            handle,
            breaker,
            pool,
            cache,
            hot_swap: None,
            recorder: None,
            task: Mutex::new(None),
        }
    }

    /// Attach a hot-swap manager driving this service's model handle.
    ///
    /// The cache is registered as a promotion hook so the previous version's
    /// entries are dropped after every promotion.
    pub fn with_hot_swap(
        mut self,
        registry: Arc<dyn ModelRegistry>,
        loader: Arc<dyn ArtifactLoader>,
        config: HotSwapConfig,
    ) -> Self {
        let manager = Arc::new(HotSwapManager::new(
            Arc::clone(&self.handle),
            registry,
            loader,
            config,
        ));
        manager.add_hook(Arc::clone(&self.cache) as Arc<dyn hotswap::PromotionHook>);
        self.hot_swap = Some(manager);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<PredictionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Build a fully wired service from config: bootstrap the model from the
    /// registry, start the worker pool and, if enabled, the polling loop and
    /// the prediction log.
    pub async fn start(
        config: &ServingConfig,
        registry: Arc<dyn ModelRegistry>,
        loader: Arc<dyn ArtifactLoader>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let handle = Arc::new(
            hotswap::bootstrap(registry.as_ref(), Arc::clone(&loader), &config.hotswap).await?,
        );
        let breaker = Arc::new(CircuitBreaker::new(config.admission.clone()));
        let pool = Arc::new(WorkerPool::new(&config.executor).map_err(|source| {
            StartupError::Io {
                what: "worker pool",
                source,
            }
        })?);
        let cache = Arc::new(PredictionCache::new(store, &config.cache));

        let mut service = Self::new(handle, breaker, pool, cache).with_hot_swap(
            registry,
            loader,
            config.hotswap.clone(),
        );

        if config.telemetry.enabled {
            let recorder =
                PredictionRecorder::new(&config.telemetry).map_err(|source| StartupError::Io {
                    what: "prediction log",
                    source,
                })?;
            service = service.with_recorder(Arc::new(recorder));
        }

        if config.hotswap.enabled {
            service.spawn_hot_swap();
        }

        info!(
            "prediction service started with model {} ({} workers, {:?})",
            service.handle.version(),
            service.pool.size(),
            config.executor.mode
        );
        Ok(service)
    }

    /// Start the polling loop if a manager is attached and no loop is running.
    pub fn spawn_hot_swap(&self) {
        let manager = match &self.hot_swap {
            Some(m) => Arc::clone(m),
            None => return,
        };
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        *task = Some(manager.spawn());
    }

    pub fn handle(&self) -> &Arc<ActiveModelHandle> {
        &self.handle
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &Arc<PredictionCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn hot_swap(&self) -> Option<&Arc<HotSwapManager>> {
        self.hot_swap.as_ref()
    }

    /// Score one feature map.
    ///
    /// Returns [`PredictError::Unavailable`] when admission is refused and
    /// [`PredictError::Scoring`] when the model fails or misses its deadline.
    /// Cache failures are never returned.
    pub async fn predict(&self, features: Features) -> Result<PredictOutcome, PredictError> {
        let start = Instant::now();
        let active = self.handle.current();
        let version = active.version_id().to_string();
        let key = make_key(&features, &version);

        if let Some(prediction) = self.cache.get(&key).await {
            let outcome = PredictOutcome {
                prediction,
                cache_hit: true,
                latency: start.elapsed(),
                model_version: version,
            };
            self.record(&outcome.model_version, true, outcome.latency, None);
            return Ok(outcome);
        }

        let result = match self.admit_and_score(&active, features).await {
            Ok(prediction) => {
                self.cache.set(&key, &prediction).await;
                Ok(PredictOutcome {
                    prediction,
                    cache_hit: false,
                    latency: start.elapsed(),
                    model_version: version.clone(),
                })
            }
            Err(e) => Err(e),
        };

        self.record(
            &version,
            false,
            start.elapsed(),
            result.as_ref().err(),
        );
        result
    }

    /// Score several feature maps against one model snapshot.
    ///
    /// Cached items are served individually. Every remaining item needs its
    /// own admission, so a half-open breaker lets through only as many items
    /// as it has free slots; the rest are rejected as unavailable. Admitted
    /// items are scored as one pool batch. Output order matches input order.
    pub async fn predict_batch(
        &self,
        batch: Vec<Features>,
    ) -> Vec<Result<PredictOutcome, PredictError>> {
        let start = Instant::now();
        let active = self.handle.current();
        let version = active.version_id().to_string();

        let mut results: Vec<Option<Result<PredictOutcome, PredictError>>> =
            (0..batch.len()).map(|_| None).collect();
        let mut admitted = Vec::new();
        let mut admitted_features: Vec<Features> = Vec::new();

        for (i, features) in batch.into_iter().enumerate() {
            let key = make_key(&features, &version);
            if let Some(prediction) = self.cache.get(&key).await {
                results[i] = Some(Ok(PredictOutcome {
                    prediction,
                    cache_hit: true,
                    latency: start.elapsed(),
                    model_version: version.clone(),
                }));
                continue;
            }

            match self.breaker.admit() {
                Some(admission) => {
                    admitted.push((i, key, admission));
                    admitted_features.push(features);
                }
                None => {
                    results[i] = Some(Err(PredictError::Unavailable {
                        retry_after: self.breaker.retry_after(),
                    }));
                }
            }
        }

        if !admitted.is_empty() {
            let scored = {
                let _slots: Vec<_> = admitted.iter().map(|_| self.breaker.enter()).collect();
                self.pool
                    .run_batch(Arc::clone(&active.artifact), admitted_features)
                    .await
            };

            for ((i, key, admission), result) in admitted.into_iter().zip(scored) {
                results[i] = Some(match result {
                    Ok(prediction) => {
                        admission.success();
                        self.cache.set(&key, &prediction).await;
                        Ok(PredictOutcome {
                            prediction,
                            cache_hit: false,
                            latency: start.elapsed(),
                            model_version: version.clone(),
                        })
                    }
                    Err(e) => {
                        admission.failure();
                        Err(PredictError::Scoring(e))
                    }
                });
            }
        }

        let results: Vec<_> = results.into_iter().flatten().collect();
        for result in &results {
            match result {
                Ok(outcome) => self.record(&version, outcome.cache_hit, outcome.latency, None),
                Err(e) => self.record(&version, false, start.elapsed(), Some(e)),
            }
        }
        results
    }

    /// Current service health.
    pub fn health(&self) -> Health {
        let active = self.handle.current();
        let breaker = self.breaker.stats();
        Health {
            model_loaded: true,
            model_version: active.version_id().to_string(),
            circuit_state: breaker.state,
            queue_depth: breaker.queue_depth,
            in_flight: self.pool.in_flight(),
            breaker,
            pool: self.pool.stats(),
            cache: self.cache.stats(),
            hot_swap: self.hot_swap.as_ref().map(|m| m.status()),
            telemetry: self.recorder.as_ref().map(|r| r.stats()),
        }
    }

    /// Promote `version` now. Requires an attached hot-swap manager.
    pub async fn reload_model(&self, version: &str) -> Result<SwapReport, HotSwapError> {
        match &self.hot_swap {
            Some(manager) => manager.swap_to_version(version).await,
            None => Err(HotSwapError::NotConfigured),
        }
    }

    /// Stop polling, stop the worker pool and flush the prediction log.
    ///
    /// Joining workers and flushing run on the blocking pool, so a scoring
    /// call still finishing never stalls a runtime thread.
    pub async fn close(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }

        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.close()).await {
            warn!("worker pool shutdown failed: {}", e);
        }

        if let Some(recorder) = &self.recorder {
            let recorder = Arc::clone(recorder);
            match tokio::task::spawn_blocking(move || recorder.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("failed to flush prediction log: {}", e),
                Err(e) => warn!("prediction log flush task failed: {}", e),
            }
        }
        info!("prediction service closed");
    }

    async fn admit_and_score(
        &self,
        active: &ActiveModel,
        features: Features,
    ) -> Result<Prediction, PredictError> {
        let admission = match self.breaker.admit() {
            Some(admission) => admission,
            None => {
                return Err(PredictError::Unavailable {
                    retry_after: self.breaker.retry_after(),
                })
            }
        };

        let result = {
            let _slot = self.breaker.enter();
            self.pool.run(Arc::clone(&active.artifact), features).await
        };

        match result {
            Ok(prediction) => {
                admission.success();
                Ok(prediction)
            }
            Err(e) => {
                admission.failure();
                debug!("scoring with {} failed: {}", active.version_id(), e);
                Err(PredictError::Scoring(e))
            }
        }
    }

    fn record(
        &self,
        model_version: &str,
        cache_hit: bool,
        latency: Duration,
        error: Option<&PredictError>,
    ) {
        let recorder = match &self.recorder {
            Some(r) => r,
            None => return,
        };

        let outcome = match error {
            None => EventOutcome::Ok,
            Some(PredictError::Unavailable { .. }) => EventOutcome::Rejected,
            Some(PredictError::Scoring(_)) => EventOutcome::Failed,
        };
        recorder.record(PredictionEvent {
            request_id: PredictionRecorder::next_request_id(),
            timestamp_ms: now_ms(),
            model_version: model_version.to_string(),
            cache_hit,
            latency_us: latency.as_micros() as u64,
            outcome,
            error: error.map(|e| e.to_string()),
        });
    }
}
