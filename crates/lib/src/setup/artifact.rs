//! Installing a single artifact: download, unpack, post-process, record.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{ArtifactSetupError, ArtifactSetuper};
use crate::artifact::{ArtifactDownload, ArtifactId};
use crate::fetch::{ArtifactFetcher, FetchError, sanitize};
use crate::handler::MessageHandler;
use crate::store::{RuntimeStore, StoreError, StoredArtifact};

#[derive(Debug, Error)]
pub enum InstallError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("failed to unpack {path}: {source}")]
  Unpack {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Setup(#[from] ArtifactSetupError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to prepare scratch directory {path}: {source}")]
  Scratch {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("install task panicked: {0}")]
  TaskPanicked(String),
}

impl InstallError {
  /// The install stopped because it was cancelled, not because it failed.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, InstallError::Fetch(FetchError::Cancelled(_)))
  }
}

/// Whether an artifact was installed or already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
  Installed,
  AlreadyInstalled,
}

/// Installs artifacts into a runtime store.
pub struct ArtifactInstaller {
  store: RuntimeStore,
  fetcher: ArtifactFetcher,
  setuper: Arc<dyn ArtifactSetuper>,
  handler: Arc<dyn MessageHandler>,
  names: HashMap<ArtifactId, String>,
}

impl ArtifactInstaller {
  /// `names` maps artifact IDs to the names reported to the handler.
  pub fn new(
    store: RuntimeStore,
    fetcher: ArtifactFetcher,
    setuper: Arc<dyn ArtifactSetuper>,
    handler: Arc<dyn MessageHandler>,
    names: HashMap<ArtifactId, String>,
  ) -> Self {
    Self {
      store,
      fetcher,
      setuper,
      handler,
      names,
    }
  }

  fn name<'a>(&'a self, id: &'a ArtifactId) -> &'a str {
    self.names.get(id).map(String::as_str).unwrap_or(id.0.as_str())
  }

  /// Install one artifact unless the store already has it.
  pub async fn install(
    &self,
    download: ArtifactDownload,
    cancel: &CancellationToken,
  ) -> Result<InstallStatus, InstallError> {
    let id = download.artifact_id.clone();
    if self.store.artifact(&id)?.is_some() {
      debug!(artifact = %id, "artifact already installed");
      return Ok(InstallStatus::AlreadyInstalled);
    }

    let name = self.name(&id).to_string();
    self.handler.artifact_download_starting(&name);
    match self.download_and_set_up(download, cancel).await {
      Ok(()) => {
        info!(artifact = %id, name, "installed artifact");
        self.handler.artifact_download_completed(&name);
        Ok(InstallStatus::Installed)
      }
      Err(err) if err.is_cancelled() => {
        debug!(artifact = %id, "install cancelled");
        Err(err)
      }
      Err(err) => {
        self.handler.artifact_download_failed(&name, &err.to_string());
        Err(err)
      }
    }
  }

  async fn download_and_set_up(&self, download: ArtifactDownload, cancel: &CancellationToken) -> Result<(), InstallError> {
    let archive = self.fetcher.fetch(&download, cancel).await?;

    let store = self.store.clone();
    let setuper = Arc::clone(&self.setuper);
    let artifact_id = download.artifact_id;
    tokio::task::spawn_blocking(move || set_up(&store, setuper.as_ref(), artifact_id, &archive))
      .await
      .map_err(|err| InstallError::TaskPanicked(err.to_string()))?
  }
}

fn set_up(
  store: &RuntimeStore,
  setuper: &dyn ArtifactSetuper,
  artifact_id: ArtifactId,
  archive: &Path,
) -> Result<(), InstallError> {
  let temp_dir = store.temp_dir();
  std::fs::create_dir_all(&temp_dir).map_err(|source| InstallError::Scratch {
    path: temp_dir.clone(),
    source,
  })?;
  let scratch = tempfile::Builder::new()
    .prefix(&format!("{}-", sanitize(&artifact_id.0)))
    .tempdir_in(&temp_dir)
    .map_err(|source| InstallError::Scratch {
      path: temp_dir.clone(),
      source,
    })?;

  unpack(archive, scratch.path())?;

  let metadata = setuper.metadata_collection(scratch.path())?;
  if setuper.needs_setup() {
    setuper.relocate(scratch.path(), &metadata)?;
  }
  let files = setuper.move_files(scratch.path(), &metadata)?;
  debug!(artifact = %artifact_id, files = files.len(), "moved artifact files");

  store.store_artifact(&StoredArtifact {
    artifact_id,
    files,
    env: metadata.env,
  })?;
  Ok(())
}

/// Extract a gzipped tarball into `dest`.
fn unpack(archive: &Path, dest: &Path) -> Result<(), InstallError> {
  let unpack_err = |source| InstallError::Unpack {
    path: archive.to_path_buf(),
    source,
  };

  let file = File::open(archive).map_err(unpack_err)?;
  let mut tarball = tar::Archive::new(GzDecoder::new(file));
  tarball.set_preserve_permissions(true);
  tarball.unpack(dest).map_err(unpack_err)
}
