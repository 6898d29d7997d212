//! Status command implementation.
//!
//! Reports whether an installation directory holds a complete runtime.

use std::path::Path;

use anyhow::{Context, Result};

use rtsetup_lib::store::{LockHolder, LockMode, RuntimeStore, StoreLockError};

use crate::output::{print_info, print_json, print_stat, print_success, print_warning};

pub fn cmd_status(dir: &Path, commit: &str, json: bool) -> Result<()> {
  let store = RuntimeStore::new(dir);

  // Hold a shared lock while reading so an install can't change things
  // underneath; if one is running, report it instead.
  let mut busy: Option<LockHolder> = None;
  let _lock = if store.store_dir().exists() {
    match store.lock(LockMode::Shared, "status") {
      Ok(lock) => Some(lock),
      Err(StoreLockError::Busy { holder, .. }) => {
        busy = holder;
        None
      }
      Err(err) => return Err(err).context("Failed to lock installation"),
    }
  } else {
    None
  };

  let complete = store.has_complete_installation(commit);
  let engine = store.build_engine().context("Failed to read build engine")?;
  let artifacts = store.artifacts().context("Failed to read installed artifacts")?;
  let environment = store.environment().context("Failed to read runtime environment")?;
  let recipe_id = store
    .recipe()
    .context("Failed to read installed recipe")?
    .map(|r| r.recipe_id);

  if json {
    print_json(&serde_json::json!({
      "install_dir": dir,
      "commit": commit,
      "complete": complete,
      "recipe_id": recipe_id,
      "build_engine": engine.map(|e| e.tag()),
      "artifacts": artifacts.len(),
      "environment": environment,
      "locked_by": busy,
    }))?;
    return Ok(());
  }

  if let Some(holder) = &busy {
    print_warning(&format!(
      "`{}` (PID {}) is changing this installation since {}",
      holder.command,
      holder.pid,
      holder.since.format("%Y-%m-%d %H:%M:%S UTC")
    ));
  }

  if complete {
    print_success(&format!("Runtime for commit {} is installed", commit));
  } else if artifacts.is_empty() {
    print_info(&format!("No runtime installed in {}", dir.display()));
    return Ok(());
  } else {
    print_warning(&format!("Runtime in {} is not a complete install of {}", dir.display(), commit));
  }

  if let Some(recipe_id) = &recipe_id {
    print_stat("Recipe", recipe_id);
  }
  if let Some(engine) = engine {
    print_stat("Build engine", engine.tag());
  }
  print_stat("Artifacts", &artifacts.len().to_string());
  if let Some(environment) = &environment {
    print_stat("Environment variables", &environment.env.len().to_string());
  }

  Ok(())
}
