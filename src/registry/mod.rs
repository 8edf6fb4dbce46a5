//! Model registry: where staged, production and archived versions are recorded.

pub mod sqlite;

pub use sqlite::SqliteModelRegistry;

use crate::error::RegistryError;
use crate::types::{now_ms, ModelVersion};

/// Store of model version records.
///
/// Implementations must keep at most one version in `production`:
/// `mark_production` archives the previous production version in the same step.
pub trait ModelRegistry: Send + Sync {
    fn register(&self, version: &ModelVersion) -> Result<(), RegistryError>;

    fn get(&self, version: &str) -> Result<Option<ModelVersion>, RegistryError>;

    fn production(&self) -> Result<Option<ModelVersion>, RegistryError>;

    /// Versions in `staging`, most recent first.
    fn list_staging(&self) -> Result<Vec<ModelVersion>, RegistryError>;

    /// Every version, most recent first.
    fn list_all(&self) -> Result<Vec<ModelVersion>, RegistryError>;

    /// Promote `version` with `promoted_at` (Unix ms), archiving the current
    /// production version. Returns the archived version id, if there was one.
    /// Promoting the current production version changes nothing.
    fn mark_production_at(
        &self,
        version: &str,
        promoted_at: u64,
    ) -> Result<Option<String>, RegistryError>;

    fn mark_production(&self, version: &str) -> Result<Option<String>, RegistryError> {
        self.mark_production_at(version, now_ms())
    }

    fn mark_archived(&self, version: &str) -> Result<(), RegistryError>;
}
