//! Scorable artifacts and the active model handle.

pub mod artifact;
pub mod handle;

pub use artifact::{ArtifactLoader, JsonArtifactLoader, LinearArtifact, LinearKind, ScoringArtifact};
pub use handle::{ActiveModel, ActiveModelHandle};
