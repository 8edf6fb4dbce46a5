//! Model promotion against a real SQLite registry.
//!
//! Tests verify:
//! - Bootstrap picks production, else the newest staged version that validates
//! - Poll promotion swaps the handle, archives the old version, drops its cache entries
//! - A candidate below the metric floor stays in staging
//! - A registry failure after the swap rolls the handle back
//! - Concurrent predictions never mix one version's score with another's version id
//! - The polling loop promotes on its own and stops on close
//! - A hanging cache store or a panicking loader cannot wedge promotion
//! - One-shot startup bootstraps without polling

mod common;

use async_trait::async_trait;
use common::*;
use serving::config::{CacheConfig, ExecutorConfig, HotSwapConfig, ServingConfig};
use serving::error::{CacheError, HotSwapError, LoadError, RegistryError};
use serving::hotswap::bootstrap;
use serving::{
    ActiveModelHandle, ArtifactLoader, CacheStore, HotSwapManager, JsonArtifactLoader,
    MemoryStore, ModelRegistry, ModelState, ModelVersion, PredictionService, ScoringArtifact,
    SqliteModelRegistry,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Registry whose promotions can be made to fail on demand.
struct FlakyRegistry {
    inner: SqliteModelRegistry,
    fail_promotions: AtomicBool,
}

impl ModelRegistry for FlakyRegistry {
    fn register(&self, version: &ModelVersion) -> Result<(), RegistryError> {
        self.inner.register(version)
    }

    fn get(&self, version: &str) -> Result<Option<ModelVersion>, RegistryError> {
        self.inner.get(version)
    }

    fn production(&self) -> Result<Option<ModelVersion>, RegistryError> {
        self.inner.production()
    }

    fn list_staging(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        self.inner.list_staging()
    }

    fn list_all(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        self.inner.list_all()
    }

    fn mark_production_at(
        &self,
        version: &str,
        promoted_at: u64,
    ) -> Result<Option<String>, RegistryError> {
        if self.fail_promotions.load(Ordering::SeqCst) {
            return Err(RegistryError::Codec("registry write refused".to_string()));
        }
        self.inner.mark_production_at(version, promoted_at)
    }

    fn mark_archived(&self, version: &str) -> Result<(), RegistryError> {
        self.inner.mark_archived(version)
    }
}

/// Store that serves reads and writes but never finishes a bulk delete.
#[derive(Default)]
struct HangingInvalidationStore {
    inner: MemoryStore,
}

#[async_trait]
impl CacheStore for HangingInvalidationStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<usize, CacheError> {
        std::future::pending().await
    }

    async fn delete_suffix(&self, _suffix: &str) -> Result<usize, CacheError> {
        std::future::pending().await
    }
}

/// Loader that panics instead of returning.
struct PanickingLoader;

impl ArtifactLoader for PanickingLoader {
    fn load(&self, _path: &Path) -> Result<Arc<dyn ScoringArtifact>, LoadError> {
        panic!("corrupt artifact header");
    }
}

fn register(
    registry: &dyn ModelRegistry,
    dir: &Path,
    version: &str,
    intercept: f64,
    auc: f64,
    created_at: u64,
) {
    let path = write_artifact(dir, &format!("{}.json", version), &linear_json(intercept));
    registry
        .register(
            &ModelVersion::staging(version, path)
                .with_metric("auc", auc)
                .with_created_at(created_at),
        )
        .unwrap();
}

fn config(poll_enabled: bool) -> ServingConfig {
    ServingConfig {
        executor: ExecutorConfig {
            worker_pool_size: 2,
            ..Default::default()
        },
        hotswap: HotSwapConfig {
            enabled: poll_enabled,
            poll_interval_secs: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Fixture {
    dir: TempDir,
    registry: Arc<FlakyRegistry>,
    store: Arc<MemoryStore>,
    service: PredictionService,
}

/// Registry with `v1` (intercept 1) registered, service started on it.
async fn fixture(poll_enabled: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(FlakyRegistry {
        inner: SqliteModelRegistry::open(dir.path().join("registry.db")).unwrap(),
        fail_promotions: AtomicBool::new(false),
    });
    register(registry.as_ref(), dir.path(), "v1", 1.0, 0.8, 100);

    let store = Arc::new(MemoryStore::new());
    let service = PredictionService::start(
        &config(poll_enabled),
        registry.clone(),
        Arc::new(JsonArtifactLoader),
        store.clone(),
    )
    .await
    .unwrap();

    Fixture {
        dir,
        registry,
        store,
        service,
    }
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

#[tokio::test]
async fn test_bootstrap_promotes_first_valid_staged() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SqliteModelRegistry::open_in_memory().unwrap();
    register(&registry, dir.path(), "good", 1.0, 0.8, 100);
    register(&registry, dir.path(), "weak", 2.0, 0.5, 200);

    let handle = bootstrap(&registry, Arc::new(JsonArtifactLoader), &HotSwapConfig::default())
        .await
        .unwrap();

    assert_eq!(handle.version(), "good");
    assert_eq!(registry.production().unwrap().unwrap().version, "good");
    assert_eq!(registry.get("weak").unwrap().unwrap().state, ModelState::Staging);
}

#[tokio::test]
async fn test_bootstrap_without_models_fails() {
    let registry = SqliteModelRegistry::open_in_memory().unwrap();
    let result = bootstrap(&registry, Arc::new(JsonArtifactLoader), &HotSwapConfig::default()).await;
    assert!(matches!(result, Err(HotSwapError::NoModel)));
}

#[tokio::test]
async fn test_bootstrap_prefers_production() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SqliteModelRegistry::open_in_memory().unwrap();
    register(&registry, dir.path(), "v1", 1.0, 0.8, 100);
    register(&registry, dir.path(), "v2", 2.0, 0.9, 200);
    registry.mark_production("v1").unwrap();

    let handle = bootstrap(&registry, Arc::new(JsonArtifactLoader), &HotSwapConfig::default())
        .await
        .unwrap();
    assert_eq!(handle.version(), "v1");
    assert_eq!(registry.get("v2").unwrap().unwrap().state, ModelState::Staging);
}

// ============================================================================
// PROMOTION
// ============================================================================

#[tokio::test]
async fn test_poll_promotes_and_invalidates_previous_version() {
    let f = fixture(false).await;
    let manager = f.service.hot_swap().unwrap().clone();

    let before = f.service.predict(features_x(1.0)).await.unwrap();
    assert_eq!(before.model_version, "v1");
    assert_eq!(before.prediction.score, 2.0);
    assert_eq!(f.store.len(), 1);

    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.9, 200);
    let report = manager.poll_once().await.unwrap().unwrap();
    assert_eq!(report.previous_version.as_deref(), Some("v1"));
    assert_eq!(report.new_version, "v2");

    assert_eq!(f.service.handle().version(), "v2");
    assert_eq!(f.registry.production().unwrap().unwrap().version, "v2");
    assert_eq!(f.registry.get("v1").unwrap().unwrap().state, ModelState::Archived);
    assert_eq!(f.store.len(), 0, "v1 entries invalidated");

    let after = f.service.predict(features_x(1.0)).await.unwrap();
    assert!(!after.cache_hit);
    assert_eq!(after.model_version, "v2");
    assert_eq!(after.prediction.score, 101.0);

    assert_eq!(manager.poll_once().await.unwrap(), None, "nothing left in staging");
    f.service.close().await;
}

#[tokio::test]
async fn test_handle_and_registry_agree_on_promotion_time() {
    let f = fixture(false).await;
    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.9, 200);
    f.service.reload_model("v2").await.unwrap();

    let active = f.service.handle().current();
    let recorded = f.registry.get("v2").unwrap().unwrap();
    assert_eq!(active.version.state, ModelState::Production);
    assert!(recorded.promoted_at.is_some());
    assert_eq!(active.version.promoted_at, recorded.promoted_at);
    f.service.close().await;
}

#[tokio::test]
async fn test_loader_panic_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SqliteModelRegistry::open_in_memory().unwrap());
    register(registry.as_ref(), dir.path(), "v2", 100.0, 0.9, 200);

    let handle = Arc::new(ActiveModelHandle::new(active_model("v1", &linear_json(1.0))));
    let manager = HotSwapManager::new(
        Arc::clone(&handle),
        registry.clone(),
        Arc::new(PanickingLoader),
        HotSwapConfig::default(),
    );

    let err = manager.swap_to_version("v2").await.unwrap_err();
    assert!(matches!(err, HotSwapError::Load(LoadError::Aborted { .. })), "{:?}", err);
    assert_eq!(handle.version(), "v1");
    assert_eq!(registry.get("v2").unwrap().unwrap().state, ModelState::Staging);
    assert_eq!(manager.status().consecutive_failures, 1);
}

#[tokio::test]
async fn test_hanging_cache_store_does_not_block_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SqliteModelRegistry::open_in_memory().unwrap());
    register(registry.as_ref(), dir.path(), "v1", 1.0, 0.8, 100);

    let mut cfg = config(false);
    cfg.cache = CacheConfig {
        op_timeout_ms: 50,
        invalidate_timeout_ms: 50,
        ..Default::default()
    };
    let service = PredictionService::start(
        &cfg,
        registry.clone(),
        Arc::new(JsonArtifactLoader),
        Arc::new(HangingInvalidationStore::default()),
    )
    .await
    .unwrap();
    service.predict(features_x(1.0)).await.unwrap();

    register(registry.as_ref(), dir.path(), "v2", 100.0, 0.9, 200);
    register(registry.as_ref(), dir.path(), "v3", 200.0, 0.9, 300);
    for version in ["v2", "v3"] {
        let report = tokio::time::timeout(Duration::from_secs(3), service.reload_model(version))
            .await
            .expect("promotion finished despite the stuck store")
            .unwrap();
        assert_eq!(report.new_version, version);
    }
    assert_eq!(service.handle().version(), "v3");
    assert_eq!(service.cache().stats().errors, 2);
    service.close().await;
}

#[tokio::test]
async fn test_one_shot_start_never_promotes() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SqliteModelRegistry::open_in_memory().unwrap());
    register(registry.as_ref(), dir.path(), "v1", 1.0, 0.8, 100);
    registry.mark_production("v1").unwrap();
    register(registry.as_ref(), dir.path(), "v2", 100.0, 0.9, 200);

    let service = PredictionService::start(
        &config(true).without_polling(),
        registry.clone(),
        Arc::new(JsonArtifactLoader),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = service.health();
    assert_eq!(health.model_version, "v1");
    assert!(health.hot_swap.unwrap().last_poll_at.is_none());
    assert_eq!(registry.get("v2").unwrap().unwrap().state, ModelState::Staging);
    service.close().await;
}

#[tokio::test]
async fn test_weak_candidate_stays_in_staging() {
    let f = fixture(false).await;
    let manager = f.service.hot_swap().unwrap().clone();

    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.5, 200);
    let err = manager.poll_once().await.unwrap_err();
    assert!(matches!(err, HotSwapError::Validation(_)));

    assert_eq!(f.service.handle().version(), "v1");
    assert_eq!(f.registry.production().unwrap().unwrap().version, "v1");
    assert_eq!(f.registry.get("v2").unwrap().unwrap().state, ModelState::Staging);
    assert_eq!(manager.status().consecutive_failures, 1);

    // retried on the next cycle with the same outcome
    assert!(manager.poll_once().await.is_err());
    assert_eq!(manager.status().consecutive_failures, 2);
    f.service.close().await;
}

#[tokio::test]
async fn test_registry_failure_rolls_back_swap() {
    let f = fixture(false).await;
    f.service.predict(features_x(1.0)).await.unwrap();

    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.9, 200);
    f.registry.fail_promotions.store(true, Ordering::SeqCst);

    let err = f.service.reload_model("v2").await.unwrap_err();
    assert!(matches!(err, HotSwapError::Apply(_)));

    assert_eq!(f.service.handle().version(), "v1");
    assert_eq!(f.registry.get("v2").unwrap().unwrap().state, ModelState::Staging);
    assert_eq!(f.store.len(), 1, "hooks do not run for a rolled-back swap");
    assert!(f.service.predict(features_x(1.0)).await.unwrap().cache_hit);

    f.registry.fail_promotions.store(false, Ordering::SeqCst);
    let report = f.service.reload_model("v2").await.unwrap();
    assert_eq!(report.new_version, "v2");
    assert_eq!(f.service.handle().version(), "v2");
    f.service.close().await;
}

#[tokio::test]
async fn test_manual_reload_edge_cases() {
    let f = fixture(false).await;

    assert!(matches!(
        f.service.reload_model("missing").await,
        Err(HotSwapError::NotFound(_))
    ));

    // reloading the production version re-reads its artifact
    let report = f.service.reload_model("v1").await.unwrap();
    assert_eq!(report.previous_version.as_deref(), Some("v1"));
    assert_eq!(report.new_version, "v1");

    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.9, 200);
    f.service.reload_model("v2").await.unwrap();
    assert!(matches!(
        f.service.reload_model("v1").await,
        Err(HotSwapError::Validation(_)),
    ));
    assert_eq!(f.service.handle().version(), "v2");
    f.service.close().await;
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swap_is_atomic_for_concurrent_predictions() {
    let f = fixture(false).await;
    let service = Arc::new(f.service);
    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.9, 200);

    let mut clients = Vec::new();
    for c in 0..4 {
        let s = Arc::clone(&service);
        clients.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for i in 0..200 {
                let x = (c * 1000 + i) as f64;
                let outcome = s.predict(features_x(x)).await.unwrap();
                let intercept = match outcome.model_version.as_str() {
                    "v1" => 1.0,
                    "v2" => 100.0,
                    other => panic!("unexpected version {}", other),
                };
                assert_eq!(outcome.prediction.score, x + intercept);
                seen.push(outcome.model_version);
            }
            seen
        }));
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    service.reload_model("v2").await.unwrap();

    for client in clients {
        let seen = client.await.unwrap();
        assert_eq!(seen.len(), 200);
    }
    assert_eq!(service.handle().version(), "v2");
    assert_eq!(service.predict(features_x(-1.0)).await.unwrap().model_version, "v2");
    service.close().await;
}

#[tokio::test]
async fn test_polling_loop_promotes_and_stops() {
    let f = fixture(true).await;
    register(f.registry.as_ref(), f.dir.path(), "v2", 100.0, 0.9, 200);

    let mut promoted = false;
    for _ in 0..40 {
        if f.service.handle().version() == "v2" {
            promoted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(promoted, "polling loop did not promote v2");

    let status = f.service.hot_swap().unwrap().status();
    assert!(status.last_poll_at.is_some());
    assert_eq!(status.last_promotion.unwrap().new_version, "v2");

    f.service.close().await;
}

#[tokio::test]
async fn test_cache_disabled_service_still_swaps() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SqliteModelRegistry::open_in_memory().unwrap());
    register(registry.as_ref(), dir.path(), "v1", 1.0, 0.8, 100);

    let mut cfg = config(false);
    cfg.cache = CacheConfig {
        enabled: false,
        ..Default::default()
    };
    let service = PredictionService::start(
        &cfg,
        registry.clone(),
        Arc::new(JsonArtifactLoader),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();

    register(registry.as_ref(), dir.path(), "v2", 100.0, 0.9, 200);
    service.reload_model("v2").await.unwrap();
    let outcome = service.predict(features_x(0.0)).await.unwrap();
    assert_eq!(outcome.prediction.score, 100.0);
    assert!(!service.predict(features_x(0.0)).await.unwrap().cache_hit);
    service.close().await;
}
