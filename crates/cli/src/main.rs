mod cmd;
mod output;
mod progress;
mod service;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{InstallArgs, cmd_diff, cmd_install, cmd_resolve, cmd_status};

/// rtsetup - install language runtimes from recipe builds
#[derive(Parser)]
#[command(name = "rtsetup")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Print machine readable JSON
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve a recipe into its artifact build graph
  Resolve {
    /// Recipe JSON file
    recipe: PathBuf,
  },

  /// Show the artifact changes between two recipes
  Diff {
    /// Recipe of the installed runtime
    old: PathBuf,
    /// Recipe to install
    new: PathBuf,
  },

  /// Show whether a runtime installation is complete
  Status {
    /// Installation directory
    dir: PathBuf,
    /// Commit the installation should match
    commit: String,
  },

  /// Install a runtime from a recorded build
  Install(InstallArgs),
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Resolve { recipe } => cmd_resolve(&recipe, cli.verbose, cli.json),
    Commands::Diff { old, new } => cmd_diff(&old, &new, cli.json),
    Commands::Status { dir, commit } => cmd_status(&dir, &commit, cli.json),
    Commands::Install(args) => cmd_install(args, cli.verbose, cli.json),
  }
}
