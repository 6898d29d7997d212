//! On-disk record of a runtime installation.
//!
//! # Layout
//!
//! ```text
//! {install_dir}/.rtsetup/
//! ├── .lock                   # InstallLock, names the exclusive holder
//! ├── installation_complete   # commit ID of the last complete install
//! ├── recipe.json             # recipe of the installed runtime
//! ├── build_engine            # engine that produced the artifacts
//! ├── environment.json        # merged environment definition
//! ├── artifacts/<id>.json     # per-artifact installed files and env fragment
//! └── tmp/                    # scratch space for unpacking
//! ```

pub mod lock;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::artifact::ArtifactId;
use crate::changeset::ArtifactChangeset;
use crate::consts::{
  ARTIFACT_META_DIR, BUILD_ENGINE_FILE, ENVIRONMENT_FILE, INSTALLATION_MARKER_FILE, LOCK_FILENAME, RECIPE_FILE,
  RUNTIME_STORE_DIR, TEMP_DIR,
};
use crate::envdef::{EnvDefError, EnvironmentDefinition};
use crate::fetch::sanitize;
use crate::recipe::Recipe;
use crate::setup::engine::BuildEngine;

use lock::Attempt;
pub use lock::{InstallLock, LockHolder, LockMode, StoreLockError};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize {what}: {source}")]
  Serialize {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to remove {path}: {source}")]
  Remove {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  EnvDef(#[from] EnvDefError),
}

/// What an installed artifact put on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
  pub artifact_id: ArtifactId,

  /// Installed files, relative to the install directory.
  pub files: Vec<PathBuf>,

  /// Environment fragment, with `${INSTALLDIR}` not yet expanded.
  pub env: EnvironmentDefinition,
}

/// The runtime store of one installation directory.
#[derive(Debug, Clone)]
pub struct RuntimeStore {
  install_dir: PathBuf,
  store_dir: PathBuf,
}

impl RuntimeStore {
  pub fn new(install_dir: impl Into<PathBuf>) -> Self {
    let install_dir = install_dir.into();
    let store_dir = install_dir.join(RUNTIME_STORE_DIR);
    Self { install_dir, store_dir }
  }

  pub fn install_dir(&self) -> &Path {
    &self.install_dir
  }

  pub fn store_dir(&self) -> &Path {
    &self.store_dir
  }

  /// Scratch directory for unpacking archives. Lives on the same filesystem
  /// as the installation so files can be moved into place by renaming.
  pub fn temp_dir(&self) -> PathBuf {
    self.store_dir.join(TEMP_DIR)
  }

  fn lock_path(&self) -> PathBuf {
    self.store_dir.join(LOCK_FILENAME)
  }

  /// Take the installation lock without waiting.
  ///
  /// An exclusive holder records itself in the lock file, so a process that
  /// is refused can tell who is in the way.
  pub fn lock(&self, mode: LockMode, command: &str) -> Result<InstallLock, StoreLockError> {
    let path = self.lock_path();
    let mut lock = match InstallLock::try_acquire(&path, mode)? {
      Attempt::Acquired(lock) => lock,
      Attempt::Busy => {
        return Err(StoreLockError::Busy {
          install_dir: self.install_dir.clone(),
          holder: self.lock_holder(),
          lock_path: path,
        });
      }
    };

    if mode == LockMode::Exclusive {
      let holder = LockHolder::current(command);
      serde_json::to_vec(&holder)
        .map_err(io::Error::other)
        .and_then(|content| lock.record(&content))
        .map_err(|source| StoreLockError::Io {
          action: "record lock holder in",
          path,
          source,
        })?;
      debug!(command, pid = holder.pid, "took exclusive install lock");
    }
    Ok(lock)
  }

  /// The process holding the exclusive lock, as it recorded itself.
  pub fn lock_holder(&self) -> Option<LockHolder> {
    let content = fs::read_to_string(self.lock_path()).ok()?;
    serde_json::from_str(&content).ok()
  }

  fn marker_path(&self) -> PathBuf {
    self.store_dir.join(INSTALLATION_MARKER_FILE)
  }

  /// Record file of an artifact. The ID is only a file name here; the real
  /// ID is kept inside the record.
  fn artifact_path(&self, id: &ArtifactId) -> PathBuf {
    self.store_dir.join(ARTIFACT_META_DIR).join(format!("{}.json", sanitize(&id.0)))
  }

  /// True if the last complete installation was of `commit_id`.
  pub fn has_complete_installation(&self, commit_id: &str) -> bool {
    match fs::read_to_string(self.marker_path()) {
      Ok(marker) => marker.trim() == commit_id,
      Err(_) => false,
    }
  }

  /// Record that the installation of `commit_id` is complete.
  ///
  /// Must be the very last step of an install.
  pub fn mark_installation_complete(&self, commit_id: &str) -> Result<(), StoreError> {
    self.write_atomic(&self.marker_path(), commit_id.as_bytes())
  }

  /// Forget about the previous complete installation before modifying it.
  pub fn clear_installation_marker(&self) -> Result<(), StoreError> {
    let path = self.marker_path();
    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(source) => Err(StoreError::Remove { path, source }),
    }
  }

  pub fn recipe(&self) -> Result<Option<Recipe>, StoreError> {
    self.read_json(&self.store_dir.join(RECIPE_FILE))
  }

  pub fn store_recipe(&self, recipe: &Recipe) -> Result<(), StoreError> {
    self.write_json(&self.store_dir.join(RECIPE_FILE), recipe, "recipe")
  }

  pub fn build_engine(&self) -> Result<Option<BuildEngine>, StoreError> {
    let path = self.store_dir.join(BUILD_ENGINE_FILE);
    match fs::read_to_string(&path) {
      Ok(tag) => Ok(Some(BuildEngine::from_tag(tag.trim()))),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(source) => Err(StoreError::Read { path, source }),
    }
  }

  pub fn store_build_engine(&self, engine: BuildEngine) -> Result<(), StoreError> {
    self.write_atomic(&self.store_dir.join(BUILD_ENGINE_FILE), engine.tag().as_bytes())
  }

  pub fn environment(&self) -> Result<Option<EnvironmentDefinition>, StoreError> {
    self.read_json(&self.store_dir.join(ENVIRONMENT_FILE))
  }

  pub fn artifact(&self, id: &ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
    self.read_json(&self.artifact_path(id))
  }

  /// All artifacts recorded in the store.
  pub fn artifacts(&self) -> Result<HashMap<ArtifactId, StoredArtifact>, StoreError> {
    let dir = self.store_dir.join(ARTIFACT_META_DIR);
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
      Err(source) => return Err(StoreError::Read { path: dir, source }),
    };

    let mut artifacts = HashMap::new();
    for entry in entries {
      let entry = entry.map_err(|source| StoreError::Read {
        path: dir.clone(),
        source,
      })?;
      let path = entry.path();
      if path.extension().is_none_or(|ext| ext != "json") {
        continue;
      }
      if let Some(artifact) = self.read_json::<StoredArtifact>(&path)? {
        artifacts.insert(artifact.artifact_id.clone(), artifact);
      }
    }

    Ok(artifacts)
  }

  pub fn store_artifact(&self, artifact: &StoredArtifact) -> Result<(), StoreError> {
    self.write_json(&self.artifact_path(&artifact.artifact_id), artifact, "artifact metadata")
  }

  /// Remove an artifact's files and its record.
  pub fn delete_artifact(&self, id: &ArtifactId) -> Result<(), StoreError> {
    let Some(artifact) = self.artifact(id)? else {
      debug!(artifact = %id, "artifact not in store, nothing to remove");
      return Ok(());
    };

    for file in &artifact.files {
      let path = self.install_dir.join(file);
      match fs::remove_file(&path) {
        Ok(()) => remove_empty_parents(&path, &self.install_dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(StoreError::Remove { path, source }),
      }
    }

    let record = self.artifact_path(id);
    fs::remove_file(&record).map_err(|source| StoreError::Remove { path: record, source })?;
    debug!(artifact = %id, files = artifact.files.len(), "removed artifact");
    Ok(())
  }

  /// Remove the artifacts a changeset removes or replaces.
  pub fn delete_outdated_artifacts(&self, changes: &ArtifactChangeset) -> Result<(), StoreError> {
    for id in changes.outdated() {
      self.delete_artifact(id)?;
    }
    Ok(())
  }

  /// Merge the environment fragments of the stored artifacts, in `order`, and
  /// write the result to `environment.json`.
  ///
  /// Later artifacts take precedence for prepended variables, so `order`
  /// should list dependencies before dependents.
  pub fn update_environment(&self, order: &[ArtifactId]) -> Result<EnvironmentDefinition, StoreError> {
    let stored = self.artifacts()?;

    let mut merged = EnvironmentDefinition::default();
    for id in order {
      if let Some(artifact) = stored.get(id) {
        merged = merged.merge(&artifact.env)?;
      }
    }
    for id in stored.keys().filter(|id| !order.contains(id)) {
      warn!(artifact = %id, "stored artifact is not part of the runtime");
    }

    let merged = merged.expand_install_dir(&self.install_dir);
    self.write_json(&self.store_dir.join(ENVIRONMENT_FILE), &merged, "environment")?;
    Ok(merged)
  }

  fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(StoreError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    serde_json::from_str(&content).map(Some).map_err(|source| StoreError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  fn write_json<T: Serialize>(&self, path: &Path, value: &T, what: &'static str) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize { what, source })?;
    self.write_atomic(path, &content)
  }

  /// Write to a temporary file next to `path`, then rename over it.
  fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
      path: path.to_path_buf(),
      source,
    };

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    fs::write(&temp, content).map_err(write_err)?;
    fs::rename(&temp, path).map_err(write_err)?;
    Ok(())
  }
}

/// Remove directories left empty by a file removal, up to `root`.
fn remove_empty_parents(path: &Path, root: &Path) {
  let mut dir = path.parent();
  while let Some(current) = dir {
    if current == root || !current.starts_with(root) {
      break;
    }
    // Fails on non-empty directories, which ends the walk.
    if fs::remove_dir(current).is_err() {
      break;
    }
    dir = current.parent();
  }
}
