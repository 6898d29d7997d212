//! Artifacts built by the camel engine.
//!
//! A camel archive holds a single top-level directory:
//!
//! ```text
//! <archive>/
//!   INSTALLDIR/            files to install (`perl/` in older builds)
//!   support/metadata.json  environment and relocation hints
//! ```
//!
//! Camel builds hard-code their build prefix into text files, so those are
//! rewritten to the install directory before the files are moved.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{ArtifactMetadata, ArtifactSetupError, ArtifactSetuper, replace_in_text_files};
use crate::consts::{CAMEL_METADATA_FILE, INSTALLDIR_PLACEHOLDER};
use crate::envdef::{EnvironmentDefinition, EnvironmentVariable, VariableJoin};

/// Candidate directories holding an archive's installable files.
const INSTALL_DIR_CANDIDATES: &[&str] = &["INSTALLDIR", "perl"];

const SUPPORT_DIR: &str = "support";

const PATH_LIST_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

#[derive(Debug, Default, Deserialize)]
struct CamelMetadata {
  /// Variable that must not be set while the runtime is active.
  #[serde(default)]
  affected_env: String,

  #[serde(default)]
  env: BTreeMap<String, String>,

  #[serde(default)]
  binaries_in: Vec<BinaryLocation>,

  /// Build prefix to replace with the install directory.
  #[serde(default)]
  relocation_dir: String,
}

#[derive(Debug, Deserialize)]
struct BinaryLocation {
  path: String,
  /// `1` when `path` is relative to the install directory.
  #[serde(default)]
  relative: u8,
}

pub struct CamelSetuper {
  install_dir: PathBuf,
}

impl CamelSetuper {
  pub fn new(install_dir: &Path) -> Self {
    Self {
      install_dir: install_dir.to_path_buf(),
    }
  }
}

impl ArtifactSetuper for CamelSetuper {
  fn install_dir(&self) -> &Path {
    &self.install_dir
  }

  fn needs_setup(&self) -> bool {
    true
  }

  fn metadata_collection(&self, unpacked: &Path) -> Result<ArtifactMetadata, ArtifactSetupError> {
    let archive_name = archive_root(unpacked)?;
    let archive_dir = unpacked.join(&archive_name);

    let metadata = read_metadata(&archive_dir)?;
    let install_subdir = INSTALL_DIR_CANDIDATES
      .iter()
      .map(|candidate| archive_name.join(candidate))
      .find(|dir| unpacked.join(dir).is_dir())
      .unwrap_or_else(|| archive_name.clone());
    debug!(
      install_subdir = %install_subdir.display(),
      relocation_dir = %metadata.relocation_dir,
      "collected camel metadata"
    );

    let relocation_prefix = (!metadata.relocation_dir.is_empty()).then(|| metadata.relocation_dir.clone());
    Ok(ArtifactMetadata {
      env: environment(&metadata, &install_subdir),
      install_subdir,
      relocation_prefix,
    })
  }

  fn relocate(&self, unpacked: &Path, metadata: &ArtifactMetadata) -> Result<(), ArtifactSetupError> {
    let Some(prefix) = &metadata.relocation_prefix else {
      return Ok(());
    };

    let target = self.install_dir.to_string_lossy();
    let rewritten = replace_in_text_files(&unpacked.join(&metadata.install_subdir), prefix, &target)?;
    debug!(prefix, target = %target, rewritten, "relocated camel artifact");
    Ok(())
  }
}

/// The single directory an archive unpacks into.
fn archive_root(unpacked: &Path) -> Result<PathBuf, ArtifactSetupError> {
  let entries = fs::read_dir(unpacked).map_err(|source| ArtifactSetupError::Io {
    path: unpacked.to_path_buf(),
    source,
  })?;

  let mut dirs = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|source| ArtifactSetupError::Io {
      path: unpacked.to_path_buf(),
      source,
    })?;
    if entry.path().is_dir() {
      dirs.push(PathBuf::from(entry.file_name()));
    }
  }
  dirs.sort();

  dirs.pop().ok_or_else(|| ArtifactSetupError::Layout {
    path: unpacked.to_path_buf(),
    message: "expected a sub-directory in the extracted archive".to_string(),
  })
}

fn read_metadata(archive_dir: &Path) -> Result<CamelMetadata, ArtifactSetupError> {
  let path = archive_dir.join(SUPPORT_DIR).join(CAMEL_METADATA_FILE);
  if !path.exists() {
    return Ok(CamelMetadata::default());
  }

  let content = fs::read_to_string(&path).map_err(|source| ArtifactSetupError::Io {
    path: path.clone(),
    source,
  })?;
  serde_json::from_str(&content).map_err(|source| ArtifactSetupError::Metadata { path, source })
}

fn environment(metadata: &CamelMetadata, install_subdir: &Path) -> EnvironmentDefinition {
  let mut env = Vec::new();

  if !metadata.affected_env.is_empty() {
    env.push(EnvironmentVariable {
      name: metadata.affected_env.clone(),
      values: Vec::new(),
      join: VariableJoin::Disallowed,
      inherit: false,
      separator: PATH_LIST_SEPARATOR.to_string(),
    });
  }

  for (name, value) in &metadata.env {
    let value = if metadata.relocation_dir.is_empty() {
      value.clone()
    } else {
      value.replace(&metadata.relocation_dir, INSTALLDIR_PLACEHOLDER)
    };
    env.push(EnvironmentVariable {
      name: name.clone(),
      values: vec![value],
      join: VariableJoin::Prepend,
      inherit: false,
      separator: PATH_LIST_SEPARATOR.to_string(),
    });
  }

  // Later entries take precedence on PATH.
  let bin_paths: Vec<String> = metadata
    .binaries_in
    .iter()
    .rev()
    .map(|bin| {
      if bin.relative == 1 {
        format!("{INSTALLDIR_PLACEHOLDER}/{}", bin.path)
      } else {
        bin.path.clone()
      }
    })
    .collect();
  env.push(EnvironmentVariable {
    name: "PATH".to_string(),
    values: bin_paths,
    join: VariableJoin::Prepend,
    inherit: true,
    separator: PATH_LIST_SEPARATOR.to_string(),
  });

  EnvironmentDefinition {
    env,
    installdir: install_subdir.to_string_lossy().into_owned(),
  }
}
