//! Terminal progress reporting for installs.

use std::sync::atomic::{AtomicUsize, Ordering};

use owo_colors::{OwoColorize, Stream};

use rtsetup_lib::changeset::{ArtifactChangeset, ArtifactMap};
use rtsetup_lib::handler::MessageHandler;

use crate::output::{Mark, change_lines};

/// Prints build and download progress to stderr.
#[derive(Debug, Default)]
pub struct ConsoleHandler {
  verbose: bool,
  total: AtomicUsize,
  built: AtomicUsize,
}

impl ConsoleHandler {
  pub fn new(verbose: bool) -> Self {
    Self {
      verbose,
      ..Self::default()
    }
  }

  fn progress(&self) -> String {
    let built = self.built.fetch_add(1, Ordering::SeqCst) + 1;
    format!("[{}/{}]", built, self.total.load(Ordering::SeqCst))
  }
}

impl MessageHandler for ConsoleHandler {
  fn build_starting(&self, total: usize) {
    self.total.store(total, Ordering::SeqCst);
    eprintln!(
      "{} Waiting for the build of {} artifact(s)",
      Mark::Note.paint(Stream::Stderr),
      total
    );
  }

  fn build_finished(&self) {
    eprintln!(
      "{} Build finished",
      Mark::Note.paint(Stream::Stderr)
    );
  }

  fn artifact_build_starting(&self, name: &str) {
    if self.verbose {
      eprintln!("  {} building {}", Mark::Step.paint(Stream::Stderr), name);
    }
  }

  fn artifact_build_cached(&self, name: &str) {
    if self.verbose {
      eprintln!("  {} {} found in build cache", Mark::Step.paint(Stream::Stderr), name);
    }
  }

  fn artifact_build_completed(&self, name: &str) {
    eprintln!(
      "  {} {} built",
      self.progress().if_supports_color(Stream::Stderr, |s| s.dimmed()),
      name
    );
  }

  fn artifact_build_failed(&self, name: &str, message: &str) {
    eprintln!(
      "  {} {} failed to build: {}",
      Mark::Failed.paint(Stream::Stderr),
      name,
      message
    );
  }

  fn change_summary(&self, artifacts: &ArtifactMap, requested: &ArtifactChangeset, resolved: &ArtifactChangeset) {
    if resolved.is_empty() {
      return;
    }

    eprintln!(
      "{} Changes: {} added, {} updated, {} removed",
      Mark::Note.paint(Stream::Stderr),
      resolved.added.len(),
      resolved.updated.len(),
      resolved.removed.len()
    );
    // Only the new side is known here; removed artifacts show their ID.
    for (mark, line) in change_lines(requested, &ArtifactMap::new(), artifacts) {
      eprintln!("  {} {}", mark.paint(Stream::Stderr), line);
    }
  }

  fn artifact_download_starting(&self, name: &str) {
    if self.verbose {
      eprintln!("  {} installing {}", Mark::Step.paint(Stream::Stderr), name);
    }
  }

  fn artifact_download_completed(&self, name: &str) {
    eprintln!(
      "  {} {} installed",
      Mark::Done.paint(Stream::Stderr),
      name
    );
  }

  fn artifact_download_failed(&self, name: &str, message: &str) {
    eprintln!(
      "  {} {} failed to install: {}",
      Mark::Failed.paint(Stream::Stderr),
      name,
      message
    );
  }
}
