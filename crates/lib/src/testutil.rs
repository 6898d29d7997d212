//! Helpers shared by unit tests.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::changeset::{ArtifactChangeset, ArtifactMap};
use crate::handler::MessageHandler;

/// Handler that records every callback as a line of text.
#[derive(Default)]
pub(crate) struct RecordingHandler {
  events: Mutex<Vec<String>>,
}

impl RecordingHandler {
  pub(crate) fn events(&self) -> Vec<String> {
    self.events.lock().unwrap().clone()
  }

  fn push(&self, event: String) {
    self.events.lock().unwrap().push(event);
  }
}

impl MessageHandler for RecordingHandler {
  fn build_starting(&self, total: usize) {
    self.push(format!("build_starting {total}"));
  }
  fn build_finished(&self) {
    self.push("build_finished".to_string());
  }
  fn artifact_build_starting(&self, name: &str) {
    self.push(format!("build_starting {name}"));
  }
  fn artifact_build_cached(&self, name: &str) {
    self.push(format!("build_cached {name}"));
  }
  fn artifact_build_completed(&self, name: &str) {
    self.push(format!("build_completed {name}"));
  }
  fn artifact_build_failed(&self, name: &str, message: &str) {
    self.push(format!("build_failed {name}: {message}"));
  }
  fn change_summary(&self, artifacts: &ArtifactMap, _: &ArtifactChangeset, resolved: &ArtifactChangeset) {
    self.push(format!(
      "change_summary {} +{} -{} ~{}",
      artifacts.len(),
      resolved.added.len(),
      resolved.removed.len(),
      resolved.updated.len()
    ));
  }
  fn artifact_download_starting(&self, name: &str) {
    self.push(format!("download_starting {name}"));
  }
  fn artifact_download_completed(&self, name: &str) {
    self.push(format!("download_completed {name}"));
  }
  fn artifact_download_failed(&self, name: &str, message: &str) {
    self.push(format!("download_failed {name}: {message}"));
  }
}

/// Write `dir/<name>.tar.gz` holding `files` as `(path, content)` pairs.
pub(crate) fn tarball(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
  let path = dir.join(format!("{name}.tar.gz"));
  let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (file, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, file, content.as_bytes()).unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap();
  path
}
