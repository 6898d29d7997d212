//! Terminal output for the rtsetup commands.
//!
//! Results go to stdout, progress and problems to stderr. Every line starts
//! with a [`Mark`], colored when the stream supports it.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

use rtsetup_lib::artifact::ArtifactId;
use rtsetup_lib::changeset::{ArtifactChangeset, ArtifactMap};

/// Leading symbol of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
  Done,
  Failed,
  Warning,
  Note,
  Step,
  Added,
  Updated,
  Removed,
}

impl Mark {
  fn symbol(self) -> &'static str {
    match self {
      Mark::Done => "✓",
      Mark::Failed => "✗",
      Mark::Warning => "⚠",
      Mark::Note => "•",
      Mark::Step => "→",
      Mark::Added => "+",
      Mark::Updated => "~",
      Mark::Removed => "-",
    }
  }

  /// The symbol, colored for `stream`.
  pub fn paint(self, stream: Stream) -> String {
    let symbol = self.symbol();
    match self {
      Mark::Done | Mark::Added => symbol.if_supports_color(stream, |s| s.green()).to_string(),
      Mark::Failed | Mark::Removed => symbol.if_supports_color(stream, |s| s.red()).to_string(),
      Mark::Warning | Mark::Updated => symbol.if_supports_color(stream, |s| s.yellow()).to_string(),
      Mark::Note => symbol.if_supports_color(stream, |s| s.blue()).to_string(),
      Mark::Step => symbol.to_string(),
    }
  }
}

/// `1m 5s`, `1.50s` or `50ms`.
pub fn format_duration(duration: Duration) -> String {
  match duration.as_secs() {
    0 => format!("{}ms", duration.subsec_millis()),
    secs @ 1..60 => format!("{}.{:02}s", secs, duration.subsec_millis() / 10),
    secs => format!("{}m {}s", secs / 60, secs % 60),
  }
}

pub fn print_success(message: &str) {
  println!("{} {}", Mark::Done.paint(Stream::Stdout), message);
}

pub fn print_info(message: &str) {
  println!("{} {}", Mark::Note.paint(Stream::Stdout), message);
}

/// Errors and warnings are colored as a whole, not just their mark.
pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    Mark::Failed.paint(Stream::Stderr),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    Mark::Warning.paint(Stream::Stderr),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

/// Indented `label: value` line below a result.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// One line per change: additions, then updates, then removals.
///
/// Added artifacts are named from `new`, updated and removed ones from `old`.
/// An update missing from `old` falls back to the new artifact's name.
pub fn change_lines(changes: &ArtifactChangeset, old: &ArtifactMap, new: &ArtifactMap) -> Vec<(Mark, String)> {
  let describe = |artifacts: &ArtifactMap, id: &ArtifactId| {
    artifacts
      .get(id)
      .map_or_else(|| id.to_string(), |record| record.name_with_version())
  };

  let added = changes.added.iter().map(|id| (Mark::Added, describe(new, id)));
  let updated = changes.updated.iter().map(|update| {
    let from = match (old.get(&update.from_id), new.get(&update.to_id)) {
      (Some(record), _) => record.name_with_version(),
      (None, Some(record)) => format!("{}@{}", record.name, update.from_version.as_deref().unwrap_or("?")),
      (None, None) => update.from_id.to_string(),
    };
    let to = update.to_version.as_deref().unwrap_or("?");
    (Mark::Updated, format!("{} → {}", from, to))
  });
  let removed = changes.removed.iter().map(|id| (Mark::Removed, describe(old, id)));
  added.chain(updated).chain(removed).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use rtsetup_lib::changeset::{ArtifactRecord, ArtifactUpdate};

  fn record(id: &str, name: &str, version: &str) -> (ArtifactId, ArtifactRecord) {
    let id = ArtifactId::from(id);
    let record = ArtifactRecord {
      artifact_id: id.clone(),
      name: name.to_string(),
      namespace: "language".to_string(),
      version: Some(version.to_string()),
      requested_by_order: true,
      recipe_position: 0,
      dependencies: Vec::new(),
    };
    (id, record)
  }

  #[test]
  fn durations() {
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
  }

  #[test]
  fn changes_are_named_from_their_side() {
    let old: ArtifactMap = [record("p1", "python", "3.10.4"), record("z1", "zlib", "1.2")].into();
    let new: ArtifactMap = [record("p2", "python", "3.11.0"), record("s1", "openssl", "3.0")].into();
    let changes = ArtifactChangeset {
      added: vec![ArtifactId::from("s1")],
      removed: vec![ArtifactId::from("z1")],
      updated: vec![ArtifactUpdate {
        from_id: ArtifactId::from("p1"),
        from_version: Some("3.10.4".to_string()),
        to_id: ArtifactId::from("p2"),
        to_version: Some("3.11.0".to_string()),
      }],
    };

    assert_eq!(
      change_lines(&changes, &old, &new),
      vec![
        (Mark::Added, "openssl@3.0".to_string()),
        (Mark::Updated, "python@3.10.4 → 3.11.0".to_string()),
        (Mark::Removed, "zlib@1.2".to_string()),
      ]
    );

    // Without the old side, the update is named from the new one.
    let lines = change_lines(&changes, &ArtifactMap::new(), &new);
    assert_eq!(lines[1], (Mark::Updated, "python@3.10.4 → 3.11.0".to_string()));
    assert_eq!(lines[2], (Mark::Removed, "z1".to_string()));
  }
}
