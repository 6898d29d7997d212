//! Types for the artifact build graph.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
  BUILDER_NAMESPACE, NOOP_BUILDER_CHECKSUM, NOOP_BUILDER_NAME, NOOP_BUILDER_SOURCE_URI, NOOP_BUILDER_VERSION,
};
use crate::recipe::ResolvedIngredient;

/// Opaque artifact identifier, provided by the recipe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for ArtifactId {
  fn from(id: &str) -> Self {
    ArtifactId(id.to_string())
  }
}

/// Stage of the build process an artifact is in.
///
/// `Ready`, `Blocked` and `Doomed` are derived locally from dependency states.
/// The remaining states are only ever copied from a recorded artifact or
/// reported by the build service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
  Ready,
  Blocked,
  Doomed,
  Starting,
  Running,
  Succeeded,
  Failed,
  Skipped,
}

impl BuildState {
  /// True for states that mean the artifact will never be available.
  pub fn is_failure(self) -> bool {
    matches!(self, BuildState::Failed | BuildState::Doomed | BuildState::Skipped)
  }
}

/// Kind of build producing an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildType {
  /// Builds an ingredient from source.
  Builder,
  /// Packages already built artifacts.
  Packager,
}

/// Ingredient metadata carried by an artifact or its builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngredientMetadata {
  pub namespace: String,
  pub name: String,
  pub version: String,
  pub revision: u32,
  pub source_uri: String,
  pub source_checksum: String,
  pub options: Vec<String>,
}

impl IngredientMetadata {
  pub fn from_ingredient(ingredient: &ResolvedIngredient) -> Self {
    Self {
      namespace: ingredient.namespace.clone(),
      name: ingredient.name.clone(),
      version: ingredient.version.clone(),
      revision: ingredient.revision,
      source_uri: ingredient.source_uri.clone(),
      source_checksum: ingredient.source_checksum.clone(),
      options: ingredient.options.clone(),
    }
  }

  /// The fixed builder of the terminal artifact.
  pub fn noop_builder() -> Self {
    Self {
      namespace: BUILDER_NAMESPACE.to_string(),
      name: NOOP_BUILDER_NAME.to_string(),
      version: NOOP_BUILDER_VERSION.to_string(),
      revision: 1,
      source_uri: NOOP_BUILDER_SOURCE_URI.to_string(),
      source_checksum: NOOP_BUILDER_CHECKSUM.to_string(),
      options: Vec::new(),
    }
  }

  /// `namespace/name version rN`
  pub fn full_name(&self) -> String {
    format!("{}/{} {} r{}", self.namespace, self.name, self.version, self.revision)
  }
}

/// A builder-tooling ingredient the builder (not the artifact) depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderDependency {
  pub namespace: String,
  pub name: String,
  pub version: String,
  pub revision: u32,
  pub source_uri: String,
  pub source_checksum: String,
}

impl BuilderDependency {
  pub fn from_ingredient(ingredient: &ResolvedIngredient) -> Self {
    Self {
      namespace: ingredient.namespace.clone(),
      name: ingredient.name.clone(),
      version: ingredient.version.clone(),
      revision: ingredient.revision,
      source_uri: ingredient.source_uri.clone(),
      source_checksum: ingredient.source_checksum.clone(),
    }
  }

  pub fn full_name(&self) -> String {
    format!("{}/{} {} r{}", self.namespace, self.name, self.version, self.revision)
  }
}

/// A node of the build graph: one buildable unit derived from an ingredient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
  pub artifact_id: ArtifactId,
  pub build_type: BuildType,

  /// The ingredient built into this artifact. `None` for the terminal packager.
  pub ingredient: Option<IngredientMetadata>,

  /// The single ingredient used to build this artifact.
  pub builder: IngredientMetadata,

  /// Runtime closure of the builder's own tooling, sorted by source URI.
  pub builder_dependencies: Vec<BuilderDependency>,

  /// Artifacts that must be built and installed before this one builds.
  /// Includes the full runtime closure of every direct build dependency.
  pub build_dependencies: Vec<ArtifactId>,

  pub patch_uris: Vec<String>,

  /// `None` until `RecipeBuildDag::initialize_build_state` runs.
  pub build_state: Option<BuildState>,

  /// Earliest time the next build attempt should be made. Only set when `Ready`.
  pub ready_at: Option<DateTime<Utc>>,

  pub previous_attempts: u32,

  /// Object-store location of the built archive. Only set when `Succeeded`.
  pub uri: Option<String>,

  pub checksum: Option<String>,

  /// Why the build failed. Only set when `Failed`.
  pub error_message: Option<String>,

  pub log_uri: Option<String>,

  pub last_modified: DateTime<Utc>,
}

impl Artifact {
  pub(crate) fn new(
    artifact_id: ArtifactId,
    build_type: BuildType,
    ingredient: Option<IngredientMetadata>,
    builder: IngredientMetadata,
  ) -> Self {
    Self {
      artifact_id,
      build_type,
      ingredient,
      builder,
      builder_dependencies: Vec::new(),
      build_dependencies: Vec::new(),
      patch_uris: Vec::new(),
      build_state: None,
      ready_at: None,
      previous_attempts: 0,
      uri: None,
      checksum: None,
      error_message: None,
      log_uri: None,
      last_modified: timestamp(),
    }
  }

  /// Short name used in progress reporting.
  pub fn name(&self) -> &str {
    match &self.ingredient {
      Some(ingredient) => &ingredient.name,
      None => &self.builder.name,
    }
  }

  /// Copies the recorded outcome of a previous build of this artifact.
  pub(crate) fn copy_outcome_from(&mut self, existing: &Artifact) {
    self.build_state = existing.build_state;
    self.ready_at = existing.ready_at;
    self.previous_attempts = existing.previous_attempts;
    self.uri = existing.uri.clone();
    self.checksum = existing.checksum.clone();
    self.error_message = existing.error_message.clone();
    self.log_uri = existing.log_uri.clone();
    self.last_modified = existing.last_modified;
  }
}

impl fmt::Display for Artifact {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (self.build_type, &self.ingredient) {
      (BuildType::Builder, Some(ingredient)) => write!(f, "Build of {}", ingredient.full_name()),
      _ => write!(f, "Packager {}", self.builder.full_name()),
    }
  }
}

/// Timestamp truncated to microseconds so persisted values compare equal.
pub(crate) fn timestamp() -> DateTime<Utc> {
  Utc::now().trunc_subsecs(6)
}

/// A built artifact ready to be downloaded and installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDownload {
  pub artifact_id: ArtifactId,
  pub download_uri: String,
  #[serde(default)]
  pub checksum: String,
}

/// How a recipe failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRecipeKind {
  /// An artifact needs itself to build.
  DependencyCycle,
  /// A builder depends on something other than runtime builder tooling.
  DisallowedDependency,
  /// A patch is not stored in the object store.
  InvalidPatchUri,
  /// A buildable ingredient has no artifact ID.
  MissingArtifactId,
  /// An artifact has no builder among its build dependencies.
  MissingBuilder,
  /// A dependency references an ingredient that isn't in the recipe.
  MissingDependency,
  /// An artifact has more than one builder.
  MultipleBuilders,
}

impl fmt::Display for InvalidRecipeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      InvalidRecipeKind::DependencyCycle => "dependency cycle",
      InvalidRecipeKind::DisallowedDependency => "disallowed dependency",
      InvalidRecipeKind::InvalidPatchUri => "invalid patch URI",
      InvalidRecipeKind::MissingArtifactId => "missing artifact ID",
      InvalidRecipeKind::MissingBuilder => "missing builder",
      InvalidRecipeKind::MissingDependency => "missing dependency",
      InvalidRecipeKind::MultipleBuilders => "multiple builders",
    };
    write!(f, "{}", name)
  }
}

/// A recipe could not be resolved into a build graph.
///
/// Always terminal for the recipe: it is malformed or the solver produced an
/// inconsistent result.
#[derive(Debug, Clone, Error)]
#[error("resolved ingredient {ingredient} {message}")]
pub struct ResolveError {
  pub kind: InvalidRecipeKind,
  pub artifact_id: Option<ArtifactId>,
  /// Full name of the offending ingredient.
  pub ingredient: String,
  pub message: String,
}

impl ResolveError {
  pub(crate) fn new(
    kind: InvalidRecipeKind,
    artifact_id: Option<ArtifactId>,
    ingredient: String,
    message: impl Into<String>,
  ) -> Self {
    Self {
      kind,
      artifact_id,
      ingredient,
      message: message.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn metadata(name: &str) -> IngredientMetadata {
    IngredientMetadata {
      namespace: "language".to_string(),
      name: name.to_string(),
      version: "1.0".to_string(),
      revision: 2,
      source_uri: String::new(),
      source_checksum: String::new(),
      options: Vec::new(),
    }
  }

  #[test]
  fn failure_states() {
    assert!(BuildState::Failed.is_failure());
    assert!(BuildState::Doomed.is_failure());
    assert!(BuildState::Skipped.is_failure());
    assert!(!BuildState::Succeeded.is_failure());
    assert!(!BuildState::Blocked.is_failure());
  }

  #[test]
  fn display_builder_and_packager() {
    let build = Artifact::new(
      ArtifactId::from("a"),
      BuildType::Builder,
      Some(metadata("perl")),
      IngredientMetadata::noop_builder(),
    );
    assert_eq!(build.to_string(), "Build of language/perl 1.0 r2");
    assert_eq!(build.name(), "perl");

    let packager = Artifact::new(
      ArtifactId::from("t"),
      BuildType::Packager,
      None,
      IngredientMetadata::noop_builder(),
    );
    assert_eq!(packager.to_string(), "Packager builder/noop-builder 0.0.1 r1");
    assert_eq!(packager.name(), "noop-builder");
  }

  #[test]
  fn copy_outcome_keeps_identity() {
    let mut recorded = Artifact::new(
      ArtifactId::from("a"),
      BuildType::Builder,
      Some(metadata("perl")),
      IngredientMetadata::noop_builder(),
    );
    recorded.build_state = Some(BuildState::Failed);
    recorded.error_message = Some("compile error".to_string());
    recorded.previous_attempts = 2;

    let mut fresh = Artifact::new(
      ArtifactId::from("a"),
      BuildType::Builder,
      Some(metadata("perl")),
      IngredientMetadata::noop_builder(),
    );
    fresh.build_dependencies.push(ArtifactId::from("dep"));
    fresh.copy_outcome_from(&recorded);

    assert_eq!(fresh.build_state, Some(BuildState::Failed));
    assert_eq!(fresh.error_message.as_deref(), Some("compile error"));
    assert_eq!(fresh.previous_attempts, 2);
    assert_eq!(fresh.build_dependencies, vec![ArtifactId::from("dep")]);
  }

  #[test]
  fn build_state_serializes_screaming_case() {
    assert_eq!(serde_json::to_string(&BuildState::Succeeded).unwrap(), "\"SUCCEEDED\"");
  }

  #[test]
  fn resolve_error_message() {
    let err = ResolveError::new(
      InvalidRecipeKind::MissingBuilder,
      Some(ArtifactId::from("a")),
      "language/perl 1.0 r2".to_string(),
      "has no builder in the recipe",
    );
    assert_eq!(
      err.to_string(),
      "resolved ingredient language/perl 1.0 r2 has no builder in the recipe"
    );
    assert_eq!(err.kind, InvalidRecipeKind::MissingBuilder);
  }
}
