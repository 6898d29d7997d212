//! Progress callbacks emitted while a runtime is set up.

use tracing::{debug, info, warn};

use crate::changeset::{ArtifactChangeset, ArtifactMap};

/// Receives progress events from the build-progress stream and the installer.
///
/// Callbacks are invoked from worker tasks, so implementations must be
/// thread safe. They should return quickly.
pub trait MessageHandler: Send + Sync {
  /// The remote build started. `total` counts the recipe's real artifacts.
  fn build_starting(&self, total: usize);

  /// The remote build ended, successfully or not. Called exactly once per stream.
  fn build_finished(&self);

  fn artifact_build_starting(&self, name: &str);

  /// The artifact was found in the build cache and won't be built this run.
  fn artifact_build_cached(&self, name: &str);

  fn artifact_build_completed(&self, name: &str);

  fn artifact_build_failed(&self, name: &str, message: &str);

  /// Summary of what an install is about to change.
  fn change_summary(&self, artifacts: &ArtifactMap, requested: &ArtifactChangeset, resolved: &ArtifactChangeset);

  fn artifact_download_starting(&self, name: &str);

  fn artifact_download_completed(&self, name: &str);

  fn artifact_download_failed(&self, name: &str, message: &str);
}

/// Handler that reports every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHandler;

impl MessageHandler for TracingHandler {
  fn build_starting(&self, total: usize) {
    info!(total, "build started");
  }

  fn build_finished(&self) {
    info!("build finished");
  }

  fn artifact_build_starting(&self, name: &str) {
    debug!(artifact = name, "artifact build started");
  }

  fn artifact_build_cached(&self, name: &str) {
    debug!(artifact = name, "artifact found in build cache");
  }

  fn artifact_build_completed(&self, name: &str) {
    debug!(artifact = name, "artifact build completed");
  }

  fn artifact_build_failed(&self, name: &str, message: &str) {
    warn!(artifact = name, error = message, "artifact build failed");
  }

  fn change_summary(&self, artifacts: &ArtifactMap, requested: &ArtifactChangeset, resolved: &ArtifactChangeset) {
    info!(
      artifacts = artifacts.len(),
      requested_added = requested.added.len(),
      requested_removed = requested.removed.len(),
      requested_updated = requested.updated.len(),
      added = resolved.added.len(),
      removed = resolved.removed.len(),
      updated = resolved.updated.len(),
      "runtime changes"
    );
  }

  fn artifact_download_starting(&self, name: &str) {
    debug!(artifact = name, "downloading artifact");
  }

  fn artifact_download_completed(&self, name: &str) {
    debug!(artifact = name, "artifact installed");
  }

  fn artifact_download_failed(&self, name: &str, message: &str) {
    warn!(artifact = name, error = message, "artifact install failed");
  }
}
