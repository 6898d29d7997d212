//! Artifact build graph.
//!
//! This module resolves a recipe into a validated DAG of artifacts rooted at a
//! synthetic terminal artifact, and provides the traversals and build-state
//! initialization used by the installer.

pub mod dag;
pub mod types;

pub use dag::RecipeBuildDag;
pub use types::{
  Artifact, ArtifactDownload, ArtifactId, BuildState, BuildType, BuilderDependency, IngredientMetadata,
  InvalidRecipeKind, ResolveError,
};
