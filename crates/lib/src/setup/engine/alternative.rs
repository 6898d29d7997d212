//! Artifacts built by the alternative engine.
//!
//! Their archives carry a `runtime.json` environment definition at the root
//! whose `installdir` names the directory holding the files to install.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ArtifactMetadata, ArtifactSetupError, ArtifactSetuper};
use crate::consts::ALTERNATIVE_ENVDEF_FILE;
use crate::envdef::EnvironmentDefinition;

pub struct AlternativeSetuper {
  install_dir: PathBuf,
}

impl AlternativeSetuper {
  pub fn new(install_dir: &Path) -> Self {
    Self {
      install_dir: install_dir.to_path_buf(),
    }
  }
}

impl ArtifactSetuper for AlternativeSetuper {
  fn install_dir(&self) -> &Path {
    &self.install_dir
  }

  fn needs_setup(&self) -> bool {
    false
  }

  fn metadata_collection(&self, unpacked: &Path) -> Result<ArtifactMetadata, ArtifactSetupError> {
    let env = EnvironmentDefinition::load(&unpacked.join(ALTERNATIVE_ENVDEF_FILE))?;
    debug!(installdir = %env.installdir, vars = env.env.len(), "loaded runtime definition");

    Ok(ArtifactMetadata {
      install_subdir: PathBuf::from(&env.installdir),
      env,
      relocation_prefix: None,
    })
  }

  fn relocate(&self, _unpacked: &Path, _metadata: &ArtifactMetadata) -> Result<(), ArtifactSetupError> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn installs_files_below_installdir() {
    let unpacked = TempDir::new().unwrap();
    let install = TempDir::new().unwrap();
    std::fs::write(
      unpacked.path().join(ALTERNATIVE_ENVDEF_FILE),
      r#"{"env":[{"env_name":"PATH","values":["${INSTALLDIR}/bin"]}],"installdir":"installdir"}"#,
    )
    .unwrap();
    std::fs::create_dir_all(unpacked.path().join("installdir/bin")).unwrap();
    std::fs::write(unpacked.path().join("installdir/bin/tool"), "tool").unwrap();

    let setuper = AlternativeSetuper::new(install.path());
    assert!(!setuper.needs_setup());

    let metadata = setuper.metadata_collection(unpacked.path()).unwrap();
    assert_eq!(metadata.install_subdir, PathBuf::from("installdir"));
    assert_eq!(metadata.env.get("PATH").unwrap().values, vec!["${INSTALLDIR}/bin"]);

    let files = setuper.move_files(unpacked.path(), &metadata).unwrap();
    assert_eq!(files, vec![PathBuf::from("bin").join("tool")]);
    assert!(install.path().join("bin/tool").exists());
  }

  #[test]
  fn missing_runtime_definition_is_an_error() {
    let unpacked = TempDir::new().unwrap();
    let install = TempDir::new().unwrap();

    let err = AlternativeSetuper::new(install.path())
      .metadata_collection(unpacked.path())
      .unwrap_err();

    assert!(matches!(err, ArtifactSetupError::EnvDef(_)));
  }
}
