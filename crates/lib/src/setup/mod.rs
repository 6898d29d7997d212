//! Runtime installation.
//!
//! [`Setup::install_runtime`] turns a commit into an installed runtime:
//!
//! 1. short-circuit if the store already holds a complete install of the commit
//! 2. resolve the recipe and validate its artifact DAG
//! 3. request a build and report the changes against the installed runtime
//! 4. remove outdated artifacts
//! 5. install artifacts as they become ready, from the build log or from the
//!    download list of an already completed build
//! 6. merge the environment and mark the installation complete

pub mod artifact;
pub mod engine;
pub mod scheduler;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactDownload, ArtifactId, RecipeBuildDag, ResolveError};
use crate::buildlog::{BuildLog, BuildLogConnection, BuildLogOptions, BuildLogSummary, ConnectionError, StreamError};
use crate::changeset::{self, ArtifactChangeset};
use crate::consts::{MAX_CONCURRENCY, READY_CHANNEL_CAPACITY};
use crate::fetch::ArtifactFetcher;
use crate::handler::MessageHandler;
use crate::platform::paths;
use crate::recipe::Recipe;
use crate::store::{LockMode, RuntimeStore, StoreError, StoreLockError};

pub use artifact::{ArtifactInstaller, InstallError, InstallStatus};
pub use engine::{ArtifactSetuper, BuildEngine};
pub use scheduler::ScheduleError;

/// Failure talking to the build service.
#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("build service request failed: {0}")]
  Request(String),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid build service response: {0}")]
  Response(#[from] serde_json::Error),

  #[error(transparent)]
  Connection(#[from] ConnectionError),
}

/// State of the build requested for a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
  /// Every artifact is built and can be downloaded right away.
  Completed { downloads: Vec<ArtifactDownload> },
  /// The build is running; progress is read from the build log.
  InProgress,
  Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
  pub engine: BuildEngine,
  pub status: BuildStatus,
}

/// The remote services an install talks to.
#[async_trait]
pub trait BuildService: Send + Sync {
  /// Solve the recipe of a commit.
  async fn resolve_recipe(&self, commit_id: &str) -> Result<Recipe, ServiceError>;

  /// Request a build of `recipe`, or the result of an earlier one.
  async fn request_build(&self, recipe: &Recipe) -> Result<BuildRequest, ServiceError>;

  /// Open a connection to the build log of an in-progress build.
  async fn connect_build_log(&self, recipe: &Recipe) -> Result<Box<dyn BuildLogConnection>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConfig {
  /// Artifacts installed concurrently.
  pub workers: usize,
  pub install_dir: PathBuf,
  /// Where downloaded archives are cached.
  pub cache_dir: PathBuf,
  /// Append the build log to this file.
  pub build_log_file: Option<PathBuf>,
}

impl Default for SetupConfig {
  fn default() -> Self {
    Self {
      workers: MAX_CONCURRENCY,
      install_dir: PathBuf::new(),
      cache_dir: paths::cache_dir(),
      build_log_file: None,
    }
  }
}

impl SetupConfig {
  pub fn new(install_dir: impl Into<PathBuf>) -> Self {
    Self {
      install_dir: install_dir.into(),
      ..Self::default()
    }
  }
}

/// Broad class of an install failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// The recipe is malformed. Retrying won't help.
  InvalidRecipe,
  /// A package failed to build. Actionable by the user.
  BuildFailed,
  /// Network, service or disk trouble. Retry later.
  Infrastructure,
  Cancelled,
}

#[derive(Debug, Error)]
pub enum SetupError {
  #[error(transparent)]
  InvalidRecipe(#[from] ResolveError),

  #[error("build failed: {message}")]
  BuildFailed { message: String },

  #[error("unsupported build engine: {0}")]
  UnsupportedBuildEngine(BuildEngine),

  #[error(transparent)]
  Service(#[from] ServiceError),

  #[error(transparent)]
  Stream(StreamError),

  #[error(transparent)]
  Install(ScheduleError<InstallError>),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("build did not provide {}", .missing.join(", "))]
  Incomplete { missing: Vec<String> },

  #[error("installation cancelled")]
  Cancelled,
}

impl SetupError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      SetupError::InvalidRecipe(_) => ErrorKind::InvalidRecipe,
      SetupError::BuildFailed { .. } => ErrorKind::BuildFailed,
      SetupError::Cancelled => ErrorKind::Cancelled,
      _ => ErrorKind::Infrastructure,
    }
  }
}

impl From<StreamError> for SetupError {
  fn from(err: StreamError) -> Self {
    match err {
      StreamError::BuildFailed { message } => SetupError::BuildFailed { message },
      StreamError::Cancelled => SetupError::Cancelled,
      other => SetupError::Stream(other),
    }
  }
}

impl From<ScheduleError<InstallError>> for SetupError {
  fn from(err: ScheduleError<InstallError>) -> Self {
    match err {
      ScheduleError::Cancelled => SetupError::Cancelled,
      other => SetupError::Install(other),
    }
  }
}

/// Result of a successful [`Setup::install_runtime`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
  /// The commit was already installed; nothing was done.
  pub already_installed: bool,
  /// Artifacts downloaded and installed by this run.
  pub installed: usize,
  /// Changes against the previously installed runtime.
  pub changes: ArtifactChangeset,
  /// Build log summary, when the build was still running.
  pub build: Option<BuildLogSummary>,
}

/// Installs runtimes into one directory.
pub struct Setup {
  service: Arc<dyn BuildService>,
  handler: Arc<dyn MessageHandler>,
  config: SetupConfig,
  store: RuntimeStore,
  fetcher: ArtifactFetcher,
}

impl Setup {
  pub fn new(service: Arc<dyn BuildService>, handler: Arc<dyn MessageHandler>, config: SetupConfig) -> Self {
    let fetcher = ArtifactFetcher::new(config.cache_dir.clone());
    Self::with_fetcher(service, handler, config, fetcher)
  }

  pub fn with_fetcher(
    service: Arc<dyn BuildService>,
    handler: Arc<dyn MessageHandler>,
    config: SetupConfig,
    fetcher: ArtifactFetcher,
  ) -> Self {
    let store = RuntimeStore::new(config.install_dir.clone());
    Self {
      service,
      handler,
      config,
      store,
      fetcher,
    }
  }

  pub fn store(&self) -> &RuntimeStore {
    &self.store
  }

  /// Install the runtime of `commit_id`.
  ///
  /// Cancelling `cancel` stops the build log and the installer; artifacts
  /// already installed stay in the store but the install is not marked
  /// complete.
  pub async fn install_runtime(&self, commit_id: &str, cancel: &CancellationToken) -> Result<InstallOutcome, SetupError> {
    if self.store.has_complete_installation(commit_id) {
      info!(commit = commit_id, "runtime already installed");
      return Ok(InstallOutcome {
        already_installed: true,
        ..InstallOutcome::default()
      });
    }

    let _lock = self.store.lock(LockMode::Exclusive, "install")?;

    let recipe = self.service.resolve_recipe(commit_id).await?;
    let dag = RecipeBuildDag::resolve(&recipe)?;
    info!(
      recipe = %recipe.recipe_id,
      artifacts = dag.real_artifact_count(),
      "resolved recipe"
    );

    let build = self.service.request_build(&recipe).await?;
    let downloads = match build.status {
      BuildStatus::Failed { message } => return Err(SetupError::BuildFailed { message }),
      BuildStatus::Completed { downloads } => Some(downloads),
      BuildStatus::InProgress => None,
    };
    let setuper = build
      .engine
      .artifact_setuper(self.store.install_dir())
      .ok_or(SetupError::UnsupportedBuildEngine(build.engine))?;

    let changes = self.summarize_changes(&recipe);
    self.store.clear_installation_marker()?;
    self.remove_outdated(&dag, &changes)?;

    let token = cancel.child_token();
    let installed = Arc::new(AtomicUsize::new(0));
    let installer = Arc::new(ArtifactInstaller::new(
      self.store.clone(),
      self.fetcher.clone(),
      setuper,
      Arc::clone(&self.handler),
      artifact_names(&dag),
    ));
    let setup = {
      let installed = Arc::clone(&installed);
      move |download: ArtifactDownload, cancel: CancellationToken| {
        let installer = Arc::clone(&installer);
        let installed = Arc::clone(&installed);
        async move {
          if installer.install(download, &cancel).await? == InstallStatus::Installed {
            installed.fetch_add(1, Ordering::SeqCst);
          }
          Ok::<(), InstallError>(())
        }
      }
    };

    let build_summary = match downloads {
      Some(downloads) => {
        let ready = produce(&dag, downloads, token.clone());
        scheduler::run(&token, ready, setup, self.config.workers).await?;
        None
      }
      None => {
        let connection = self.service.connect_build_log(&recipe).await?;
        let options = BuildLogOptions {
          log_file: self.config.build_log_file.clone(),
        };
        let mut log = BuildLog::start(connection, &dag, Arc::clone(&self.handler), options, token.clone());
        let ready = match log.take_ready() {
          Some(ready) => ready,
          None => mpsc::channel(1).1,
        };

        let scheduled = scheduler::run(&token, ready, setup, self.config.workers).await;
        if scheduled.is_err() {
          token.cancel();
        }
        let streamed = log.wait().await;

        // The first failure wins: a failed install cancels the stream.
        match (scheduled, streamed) {
          (Err(err), _) if !matches!(err, ScheduleError::Cancelled) => return Err(err.into()),
          (_, Err(err)) => return Err(err.into()),
          (Err(err), Ok(_)) => return Err(err.into()),
          (Ok(_), Ok(summary)) => Some(summary),
        }
      }
    };

    if let Some(summary) = &build_summary
      && !summary.failed.is_empty()
    {
      let names: Vec<&str> = summary.failed.iter().map(|f| f.name.as_str()).collect();
      return Err(SetupError::BuildFailed {
        message: format!("failed to build {}", names.join(", ")),
      });
    }
    if cancel.is_cancelled() {
      return Err(SetupError::Cancelled);
    }

    let order: Vec<ArtifactId> = dag
      .post_order()
      .into_iter()
      .filter(|a| !dag.is_terminal(&a.artifact_id))
      .map(|a| a.artifact_id.clone())
      .collect();
    let stored = self.store.artifacts()?;
    let missing: Vec<String> = order
      .iter()
      .filter(|id| !stored.contains_key(*id))
      .map(|id| dag.get(id).map_or_else(|| id.to_string(), |a| a.name().to_string()))
      .collect();
    if !missing.is_empty() {
      return Err(SetupError::Incomplete { missing });
    }

    self.store.update_environment(&order)?;
    self.store.store_recipe(&recipe)?;
    self.store.store_build_engine(build.engine)?;

    let outcome = InstallOutcome {
      already_installed: false,
      installed: installed.load(Ordering::SeqCst),
      changes,
      build: build_summary,
    };
    info!(commit = commit_id, installed = outcome.installed, "runtime installed");

    self.store.mark_installation_complete(commit_id)?;
    Ok(outcome)
  }

  /// Diff the new recipe against the installed one and report it.
  fn summarize_changes(&self, recipe: &Recipe) -> ArtifactChangeset {
    let old = match self.store.recipe() {
      Ok(Some(old)) => changeset::artifacts_from_recipe(&old),
      Ok(None) => HashMap::new(),
      Err(err) => {
        warn!(error = %err, "ignoring unreadable installed recipe");
        HashMap::new()
      }
    };
    let new = changeset::artifacts_from_recipe(recipe);

    let requested = changeset::requested(&old, &new);
    let resolved = changeset::resolved(&old, &new);
    self.handler.change_summary(&new, &requested, &resolved);
    resolved
  }

  /// Remove artifacts replaced by `changes` and any stored artifact the new
  /// runtime doesn't contain.
  fn remove_outdated(&self, dag: &RecipeBuildDag, changes: &ArtifactChangeset) -> Result<(), StoreError> {
    self.store.delete_outdated_artifacts(changes)?;
    for id in self.store.artifacts()?.keys() {
      if dag.get(id).is_none() {
        debug!(artifact = %id, "removing artifact not in the new runtime");
        self.store.delete_artifact(id)?;
      }
    }
    Ok(())
  }
}

fn artifact_names(dag: &RecipeBuildDag) -> HashMap<ArtifactId, String> {
  dag
    .artifacts()
    .filter(|a| !dag.is_terminal(&a.artifact_id))
    .map(|a| (a.artifact_id.clone(), a.name().to_string()))
    .collect()
}

/// Feed the downloads of a completed build into a ready channel.
fn produce(
  dag: &RecipeBuildDag,
  downloads: Vec<ArtifactDownload>,
  cancel: CancellationToken,
) -> mpsc::Receiver<ArtifactDownload> {
  let (tx, rx) = mpsc::channel(READY_CHANNEL_CAPACITY);
  let downloads: Vec<ArtifactDownload> = downloads
    .into_iter()
    .filter(|d| !dag.is_terminal(&d.artifact_id))
    .collect();

  tokio::spawn(async move {
    for download in downloads {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        sent = tx.send(download) => {
          if sent.is_err() {
            break;
          }
        }
      }
    }
  });

  rx
}
