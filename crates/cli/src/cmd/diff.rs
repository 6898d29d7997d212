//! Diff command implementation.
//!
//! Compares the artifacts of two recipes and displays the requested and the
//! fully resolved added/removed/updated artifacts.

use std::path::Path;

use anyhow::Result;
use owo_colors::Stream;

use rtsetup_lib::changeset::{self, ArtifactChangeset, ArtifactMap};

use super::load_recipe;
use crate::output::{change_lines, print_json};

pub fn cmd_diff(old_path: &Path, new_path: &Path, json: bool) -> Result<()> {
  let old = changeset::artifacts_from_recipe(&load_recipe(old_path)?);
  let new = changeset::artifacts_from_recipe(&load_recipe(new_path)?);

  let requested = changeset::requested(&old, &new);
  let resolved = changeset::resolved(&old, &new);

  if json {
    print_json(&serde_json::json!({
      "requested": requested,
      "resolved": resolved,
    }))?;
    return Ok(());
  }

  if resolved.is_empty() {
    println!("No changes.");
    return Ok(());
  }

  println!("Requested changes:");
  print_changeset(&requested, &old, &new);
  println!();
  println!("All changes:");
  print_changeset(&resolved, &old, &new);

  Ok(())
}

fn print_changeset(changes: &ArtifactChangeset, old: &ArtifactMap, new: &ArtifactMap) {
  if changes.is_empty() {
    println!("  (none)");
    return;
  }
  for (mark, line) in change_lines(changes, old, new) {
    println!("  {} {}", mark.paint(Stream::Stdout), line);
  }
}
