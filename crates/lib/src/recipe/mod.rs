//! Solver output consumed by the resolver and the changeset differ.
//!
//! A recipe is treated as read-only input: an ordered list of resolved
//! ingredients whose dependency edges reference other ingredients by
//! ingredient version ID.

mod types;

pub use types::{DependencyType, IngredientDependency, Patch, Recipe, ResolvedIngredient};

use crate::consts::{BUILDER_LIB_NAMESPACE, BUILDER_NAMESPACE, SHARED_NAMESPACE};

/// Returns true for namespaces holding build tooling rather than buildable packages.
pub fn is_builder_related_namespace(namespace: &str) -> bool {
  namespace == BUILDER_NAMESPACE || namespace == BUILDER_LIB_NAMESPACE
}

/// Returns true for namespaces that end up installed in a runtime
/// (`language`, `language/<x>`, `bundles/<x>` and `shared`).
pub fn is_runtime_namespace(namespace: &str) -> bool {
  if namespace == "language" || namespace == SHARED_NAMESPACE {
    return true;
  }
  ["language/", "bundles/"].iter().any(|prefix| {
    namespace
      .strip_prefix(prefix)
      .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_alphanumeric() || c == '_'))
  })
}

/// Returns true for bundle namespaces, whose members are build dependencies
/// of the bundle rather than runtime ones.
pub fn is_bundle_namespace(namespace: &str) -> bool {
  namespace.starts_with("bundles/") && is_runtime_namespace(namespace)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_namespaces() {
    assert!(is_builder_related_namespace("builder"));
    assert!(is_builder_related_namespace("builder-lib"));
    assert!(!is_builder_related_namespace("language/python"));
    assert!(!is_builder_related_namespace("builders"));
  }

  #[test]
  fn runtime_namespaces() {
    assert!(is_runtime_namespace("language"));
    assert!(is_runtime_namespace("language/python"));
    assert!(is_runtime_namespace("bundles/python"));
    assert!(!is_runtime_namespace("language/"));
    assert!(!is_runtime_namespace("language/python/extra"));
    assert!(is_runtime_namespace("shared"));
    assert!(!is_runtime_namespace("shared/openssl"));
    assert!(!is_runtime_namespace("builder"));
  }
}
