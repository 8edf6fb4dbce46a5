//! Versioned, swappable reference to the serving model.
//!
//! Version and artifact travel together in one `Arc<ActiveModel>`, so a reader
//! can never see a new artifact paired with an old version string.

use super::artifact::ScoringArtifact;
use crate::types::ModelVersion;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// A fully loaded model and the registry record it came from.
pub struct ActiveModel {
    pub version: ModelVersion,
    pub artifact: Arc<dyn ScoringArtifact>,
    /// When this model was installed in the handle (Unix ms)
    pub installed_at: u64,
}

impl ActiveModel {
    pub fn new(version: ModelVersion, artifact: Arc<dyn ScoringArtifact>) -> Self {
        Self {
            version,
            artifact,
            installed_at: crate::types::now_ms(),
        }
    }

    pub fn version_id(&self) -> &str {
        &self.version.version
    }
}

impl fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModel")
            .field("version", &self.version.version)
            .field("installed_at", &self.installed_at)
            .finish()
    }
}

/// Holder of the currently serving model.
///
/// # Thread Safety
/// - Readers take a short read lock to clone the `Arc`; they never hold it across scoring
/// - Writers serialize on `swap_lock`; the new model is fully built before the swap
pub struct ActiveModelHandle {
    current: RwLock<Arc<ActiveModel>>,
    swap_lock: Mutex<()>,
}

impl ActiveModelHandle {
    /// A handle always starts with a loaded model; there is no empty state.
    pub fn new(initial: ActiveModel) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            swap_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the serving model. Callers capture this once per request.
    pub fn current(&self) -> Arc<ActiveModel> {
        Arc::clone(&*self.current.read())
    }

    pub fn version(&self) -> String {
        self.current.read().version.version.clone()
    }

    /// Install `next` and return the model it replaced.
    ///
    /// The replaced model is dropped once the last in-flight reader releases it.
    pub fn swap(&self, next: ActiveModel) -> Arc<ActiveModel> {
        self.swap_arc(Arc::new(next))
    }

    /// Reinstall an earlier snapshot, e.g. to roll back a failed promotion.
    pub fn restore(&self, previous: Arc<ActiveModel>) -> Arc<ActiveModel> {
        self.swap_arc(previous)
    }

    fn swap_arc(&self, next: Arc<ActiveModel>) -> Arc<ActiveModel> {
        let _guard = self.swap_lock.lock();
        let mut current = self.current.write();
        std::mem::replace(&mut *current, next)
    }
}

impl fmt::Debug for ActiveModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModelHandle")
            .field("version", &self.version())
            .finish()
    }
}
