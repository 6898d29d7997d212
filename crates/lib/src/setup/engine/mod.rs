//! Engine-specific artifact post-processing.
//!
//! Artifacts produced by different build engines are laid out differently
//! inside their archives. Each engine has one [`ArtifactSetuper`], selected
//! once per install from the build's [`BuildEngine`] tag.

pub mod alternative;
pub mod camel;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::envdef::{EnvDefError, EnvironmentDefinition};

pub use alternative::AlternativeSetuper;
pub use camel::CamelSetuper;

/// Build engine that produced a runtime's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildEngine {
  Alternative,
  Camel,
  #[serde(other)]
  Unknown,
}

impl BuildEngine {
  pub fn tag(self) -> &'static str {
    match self {
      BuildEngine::Alternative => "alternative",
      BuildEngine::Camel => "camel",
      BuildEngine::Unknown => "unknown",
    }
  }

  pub fn from_tag(tag: &str) -> Self {
    match tag {
      "alternative" => BuildEngine::Alternative,
      "camel" => BuildEngine::Camel,
      _ => BuildEngine::Unknown,
    }
  }

  /// The setuper for artifacts of this engine, installing into `install_dir`.
  ///
  /// `None` for engines this installer can't handle.
  pub fn artifact_setuper(self, install_dir: &Path) -> Option<Arc<dyn ArtifactSetuper>> {
    match self {
      BuildEngine::Alternative => Some(Arc::new(AlternativeSetuper::new(install_dir))),
      BuildEngine::Camel => Some(Arc::new(CamelSetuper::new(install_dir))),
      BuildEngine::Unknown => None,
    }
  }
}

impl fmt::Display for BuildEngine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.tag())
  }
}

#[derive(Debug, Error)]
pub enum ArtifactSetupError {
  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("invalid artifact metadata {path}: {source}")]
  Metadata {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unexpected archive layout in {path}: {message}")]
  Layout { path: PathBuf, message: String },

  #[error(transparent)]
  EnvDef(#[from] EnvDefError),
}

/// What a setuper learned about an unpacked artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactMetadata {
  /// Directory inside the unpacked archive holding the files to install.
  pub install_subdir: PathBuf,

  /// Environment fragment of the artifact.
  pub env: EnvironmentDefinition,

  /// Build-time prefix hard-coded into the artifact's files, if any.
  pub relocation_prefix: Option<String>,
}

/// Post-processing of one engine's unpacked artifacts.
///
/// All methods do blocking file I/O and run off the async runtime.
pub trait ArtifactSetuper: Send + Sync {
  /// Directory the artifacts are installed into.
  fn install_dir(&self) -> &Path;

  /// Whether unpacked files must be relocated before they are moved.
  fn needs_setup(&self) -> bool;

  /// Read the artifact's metadata from its unpacked archive.
  fn metadata_collection(&self, unpacked: &Path) -> Result<ArtifactMetadata, ArtifactSetupError>;

  /// Rewrite build-time paths in the unpacked files to the install directory.
  fn relocate(&self, unpacked: &Path, metadata: &ArtifactMetadata) -> Result<(), ArtifactSetupError>;

  /// Move the artifact's files into the install directory.
  ///
  /// Returns the installed files relative to the install directory.
  fn move_files(&self, unpacked: &Path, metadata: &ArtifactMetadata) -> Result<Vec<PathBuf>, ArtifactSetupError> {
    move_tree(&unpacked.join(&metadata.install_subdir), self.install_dir())
  }
}

/// Move every file below `src` to the same relative location below `dest`,
/// replacing existing files.
pub(crate) fn move_tree(src: &Path, dest: &Path) -> Result<Vec<PathBuf>, ArtifactSetupError> {
  let io_err = |path: &Path| {
    let path = path.to_path_buf();
    move |source| ArtifactSetupError::Io { path, source }
  };

  let mut moved = Vec::new();
  if !src.exists() {
    return Ok(moved);
  }

  for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|source| ArtifactSetupError::Walk {
      path: src.to_path_buf(),
      source,
    })?;
    if entry.file_type().is_dir() {
      continue;
    }

    let Ok(relative) = entry.path().strip_prefix(src) else {
      continue;
    };
    let target = dest.join(relative);
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    if fs::symlink_metadata(&target).is_ok() {
      fs::remove_file(&target).map_err(io_err(&target))?;
    }
    if fs::rename(entry.path(), &target).is_err() {
      // Renaming fails across filesystems.
      fs::copy(entry.path(), &target).map_err(io_err(&target))?;
      fs::remove_file(entry.path()).map_err(io_err(entry.path()))?;
    }
    moved.push(relative.to_path_buf());
  }

  Ok(moved)
}

/// Replace `from` with `to` in every text file below `dir`.
///
/// Files containing NUL bytes are treated as binaries and left alone.
pub(crate) fn replace_in_text_files(dir: &Path, from: &str, to: &str) -> Result<usize, ArtifactSetupError> {
  let mut rewritten = 0;
  if from.is_empty() || !dir.exists() {
    return Ok(rewritten);
  }

  for entry in WalkDir::new(dir) {
    let entry = entry.map_err(|source| ArtifactSetupError::Walk {
      path: dir.to_path_buf(),
      source,
    })?;
    if !entry.file_type().is_file() {
      continue;
    }

    let path = entry.path();
    let bytes = fs::read(path).map_err(|source| ArtifactSetupError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    if bytes.contains(&0) {
      continue;
    }
    let Ok(text) = String::from_utf8(bytes) else {
      continue;
    };
    if !text.contains(from) {
      continue;
    }

    fs::write(path, text.replace(from, to)).map_err(|source| ArtifactSetupError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    rewritten += 1;
  }

  Ok(rewritten)
}
