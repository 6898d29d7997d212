//! Install command implementation.
//!
//! Installs a runtime from a recipe and a recorded build: either a build log
//! replayed as if it were streamed by the build service, or the download list
//! of a completed build.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rtsetup_lib::artifact::ArtifactDownload;
use rtsetup_lib::consts::MAX_CONCURRENCY;
use rtsetup_lib::handler::{MessageHandler, TracingHandler};
use rtsetup_lib::setup::{BuildEngine, ErrorKind, Setup, SetupConfig, SetupError};

use super::load_recipe;
use crate::output::{format_duration, print_error, print_json, print_stat, print_success};
use crate::progress::ConsoleHandler;
use crate::service::{Recorded, RecordedBuildService};

#[derive(Debug, Args)]
pub struct InstallArgs {
  /// Recipe JSON file
  #[arg(long)]
  recipe: PathBuf,

  /// Recorded build log, one JSON message per line
  #[arg(long, conflicts_with = "downloads", required_unless_present = "downloads")]
  events: Option<PathBuf>,

  /// Download list of a completed build (JSON array)
  #[arg(long)]
  downloads: Option<PathBuf>,

  /// Installation directory
  #[arg(long)]
  dir: PathBuf,

  /// Commit the runtime is installed for
  #[arg(long)]
  commit: String,

  /// Build engine that produced the artifacts
  #[arg(long, default_value = "alternative")]
  engine: String,

  /// Artifacts installed concurrently
  #[arg(long, default_value_t = MAX_CONCURRENCY)]
  workers: usize,

  /// Artifact download cache (default: platform cache directory)
  #[arg(long)]
  cache_dir: Option<PathBuf>,

  /// Append the build log to this file
  #[arg(long)]
  build_log: Option<PathBuf>,
}

pub fn cmd_install(args: InstallArgs, verbose: bool, json: bool) -> Result<()> {
  let recipe = load_recipe(&args.recipe)?;

  let engine = BuildEngine::from_tag(&args.engine);
  if engine == BuildEngine::Unknown {
    bail!("Unknown build engine: {}", args.engine);
  }

  let recorded = match (&args.events, &args.downloads) {
    (Some(events), _) => Recorded::Events(events.clone()),
    (None, Some(path)) => {
      let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read downloads: {}", path.display()))?;
      let downloads: Vec<ArtifactDownload> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse downloads: {}", path.display()))?;
      Recorded::Downloads(downloads)
    }
    (None, None) => bail!("Either --events or --downloads is required"),
  };

  let mut config = SetupConfig::new(&args.dir);
  config.workers = args.workers;
  config.build_log_file = args.build_log.clone();
  if let Some(cache_dir) = &args.cache_dir {
    config.cache_dir = cache_dir.clone();
  }
  debug!(?config, "install configuration");

  let handler: Arc<dyn MessageHandler> = if json {
    Arc::new(TracingHandler)
  } else {
    Arc::new(ConsoleHandler::new(verbose))
  };
  let service = Arc::new(RecordedBuildService::new(recipe, engine, recorded));
  let setup = Setup::new(service, handler, config);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let started = Instant::now();
  let result = rt.block_on(async {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        interrupt.cancel();
      }
    });
    setup.install_runtime(&args.commit, &cancel).await
  });

  let outcome = match result {
    Ok(outcome) => outcome,
    Err(err) => {
      report_failure(&err);
      std::process::exit(exit_code(err.kind()));
    }
  };

  if json {
    print_json(&serde_json::json!({
      "commit": args.commit,
      "already_installed": outcome.already_installed,
      "installed": outcome.installed,
      "changes": outcome.changes,
    }))?;
    return Ok(());
  }

  if outcome.already_installed {
    print_success(&format!("Runtime for commit {} is already installed", args.commit));
    return Ok(());
  }

  println!();
  print_success(&format!("Runtime installed in {}", args.dir.display()));
  print_stat("Artifacts installed", &outcome.installed.to_string());
  if let Some(build) = &outcome.build {
    print_stat("Built", &build.built.to_string());
    print_stat("Cached", &build.cached.to_string());
  }
  print_stat("Took", &format_duration(started.elapsed()));

  Ok(())
}

fn report_failure(err: &SetupError) {
  print_error(&err.to_string());
  let hint = match err.kind() {
    ErrorKind::InvalidRecipe => "The recipe is invalid. Re-solving the commit is required.",
    ErrorKind::BuildFailed => "The build failed. Check the build log of the failed artifacts.",
    ErrorKind::Infrastructure => "The install could not complete. Try again later.",
    ErrorKind::Cancelled => "The install was cancelled.",
  };
  eprintln!("  {}", hint);
}

fn exit_code(kind: ErrorKind) -> i32 {
  match kind {
    ErrorKind::InvalidRecipe => 2,
    ErrorKind::BuildFailed => 3,
    ErrorKind::Infrastructure => 4,
    ErrorKind::Cancelled => 130,
  }
}
