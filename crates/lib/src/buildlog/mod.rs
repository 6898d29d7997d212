//! Build-progress stream.
//!
//! [`BuildLog`] reads the event stream of one remote recipe build, reports
//! progress to a [`MessageHandler`], and emits an [`ArtifactDownload`] on the
//! ready channel for every artifact that finished building. The stream
//! terminates on `build_succeeded`, `build_failed`, a transport error or
//! cancellation. Whatever the exit path, the connection is closed exactly once
//! and [`MessageHandler::build_finished`] is called exactly once.

pub mod connection;
pub mod message;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactDownload, ArtifactId, BuildState, RecipeBuildDag};
use crate::consts::READY_CHANNEL_CAPACITY;
use crate::handler::MessageHandler;

pub use connection::{BuildLogConnection, ConnectionError, JsonLinesConnection};
pub use message::{Message, RecipeRequest};

#[derive(Debug, Error)]
pub enum StreamError {
  #[error("build log connection failed: {0}")]
  Connection(#[from] ConnectionError),

  #[error("build log connection closed before the build finished")]
  ConnectionClosed,

  #[error("expected build_started as the first message, got {0}")]
  UnexpectedFirstMessage(&'static str),

  #[error("invalid build log message: {0}")]
  Protocol(String),

  #[error("build failed: {message}")]
  BuildFailed { message: String },

  #[error("build log stream cancelled")]
  Cancelled,

  #[error("failed to open build log file {path}: {source}")]
  LogFile {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("build log task panicked: {0}")]
  TaskPanicked(String),
}

#[derive(Debug, Clone, Default)]
pub struct BuildLogOptions {
  /// Append every stream event to this file.
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedArtifact {
  pub artifact_id: ArtifactId,
  pub name: String,
  pub message: String,
}

/// What happened during a stream that ran to `build_succeeded`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLogSummary {
  /// Artifacts built by the service during this build.
  pub built: usize,
  /// Artifacts served from the build cache.
  pub cached: usize,
  /// Artifacts emitted on the ready channel.
  pub ready: usize,
  pub failed: Vec<FailedArtifact>,
}

/// A running build-progress stream.
pub struct BuildLog {
  ready: Option<mpsc::Receiver<ArtifactDownload>>,
  task: JoinHandle<Result<BuildLogSummary, StreamError>>,
}

impl BuildLog {
  /// Start consuming the stream of `dag`'s recipe on a background task.
  ///
  /// Must be called within a tokio runtime.
  pub fn start(
    connection: Box<dyn BuildLogConnection>,
    dag: &RecipeBuildDag,
    handler: Arc<dyn MessageHandler>,
    options: BuildLogOptions,
    cancel: CancellationToken,
  ) -> Self {
    let (tx, rx) = mpsc::channel(READY_CHANNEL_CAPACITY);

    let names = dag
      .artifacts()
      .filter(|a| !dag.is_terminal(&a.artifact_id))
      .map(|a| (a.artifact_id.clone(), a.name().to_string()))
      .collect();

    let stream = Stream {
      recipe_id: dag.recipe_id().to_string(),
      terminal_id: dag.terminal_id().clone(),
      total: dag.real_artifact_count(),
      names,
      handler,
      log_path: options.log_file,
      log_file: None,
      ready: Some(tx),
      observed: HashSet::new(),
      states: HashMap::new(),
      summary: BuildLogSummary::default(),
    };

    let task = tokio::spawn(stream.run(connection, cancel));

    Self { ready: Some(rx), task }
  }

  /// Take the receiving end of the ready channel. Returns `None` once taken.
  ///
  /// The channel closes when the stream terminates.
  pub fn take_ready(&mut self) -> Option<mpsc::Receiver<ArtifactDownload>> {
    self.ready.take()
  }

  /// Wait for the stream to terminate.
  pub async fn wait(self) -> Result<BuildLogSummary, StreamError> {
    drop(self.ready);
    match self.task.await {
      Ok(result) => result,
      Err(e) => Err(StreamError::TaskPanicked(e.to_string())),
    }
  }
}

enum Flow {
  Continue,
  Done,
}

struct Stream {
  recipe_id: String,
  terminal_id: ArtifactId,
  total: usize,
  /// Names of the real artifacts being monitored.
  names: HashMap<ArtifactId, String>,
  handler: Arc<dyn MessageHandler>,
  log_path: Option<PathBuf>,
  log_file: Option<File>,
  /// Dropped to close the ready channel.
  ready: Option<mpsc::Sender<ArtifactDownload>>,
  /// Events already handled, keyed by message type and artifact.
  observed: HashSet<(&'static str, Option<ArtifactId>)>,
  states: HashMap<ArtifactId, BuildState>,
  summary: BuildLogSummary,
}

impl Stream {
  async fn run(
    mut self,
    mut connection: Box<dyn BuildLogConnection>,
    cancel: CancellationToken,
  ) -> Result<BuildLogSummary, StreamError> {
    let result = self.drive(connection.as_mut(), &cancel).await;

    self.ready = None;
    if let Err(e) = connection.close().await {
      debug!(error = %e, "failed to close build log connection");
    }
    self.handler.build_finished();

    match &result {
      Ok(()) => info!(
        built = self.summary.built,
        cached = self.summary.cached,
        failed = self.summary.failed.len(),
        "build succeeded"
      ),
      Err(e) => warn!(error = %e, "build log stream ended"),
    }

    result.map(|()| self.summary)
  }

  async fn drive(&mut self, connection: &mut dyn BuildLogConnection, cancel: &CancellationToken) -> Result<(), StreamError> {
    if let Some(path) = &self.log_path {
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| StreamError::LogFile {
          path: path.display().to_string(),
          source,
        })?;
      self.log_file = Some(file);
    }

    debug!(recipe = %self.recipe_id, "subscribing to build log");
    connection
      .subscribe(&RecipeRequest {
        recipe_id: self.recipe_id.clone(),
      })
      .await?;

    match next_message(connection, cancel).await? {
      Message::BuildStarted => {
        self.observe("build_started", None);
        self.write_log(None, "Build Started").await;
        self.handler.build_starting(self.total);
      }
      other => return Err(StreamError::UnexpectedFirstMessage(other.message_type())),
    }

    loop {
      let message = next_message(connection, cancel).await?;
      if let Flow::Done = self.handle(message, cancel).await? {
        return Ok(());
      }
    }
  }

  async fn handle(&mut self, message: Message, cancel: &CancellationToken) -> Result<Flow, StreamError> {
    let message_type = message.message_type();

    match message {
      Message::BuildStarted => {
        self.observe(message_type, None);
      }

      Message::BuildSucceeded => {
        if self.observe(message_type, None) {
          self.write_log(None, "Build Succeeded").await;
          return Ok(Flow::Done);
        }
      }

      Message::BuildFailed { error_message } => {
        if self.observe(message_type, None) {
          self.write_log(None, &format!("Build Failed: {}", error_message)).await;
          return Err(StreamError::BuildFailed { message: error_message });
        }
      }

      Message::ArtifactStarted { artifact_id, cache_hit } => {
        let Some(name) = self.monitored(message_type, &artifact_id) else {
          return Ok(Flow::Continue);
        };

        self.states.insert(artifact_id.clone(), BuildState::Starting);
        self.write_log(Some(&artifact_id), "Artifact Build Started").await;
        if cache_hit {
          self.summary.cached += 1;
          self.handler.artifact_build_cached(&name);
        } else {
          self.summary.built += 1;
          self.handler.artifact_build_starting(&name);
        }
      }

      Message::ArtifactSucceeded {
        artifact_id,
        checksum,
        uri,
        log_uri,
      } => {
        if artifact_id == self.terminal_id {
          // The terminal artifact has nothing to download.
          debug!(recipe = %self.recipe_id, "terminal artifact completed");
          return Ok(Flow::Continue);
        }
        let Some(name) = self.monitored(message_type, &artifact_id) else {
          return Ok(Flow::Continue);
        };

        self.states.insert(artifact_id.clone(), BuildState::Succeeded);
        self
          .write_log(
            Some(&artifact_id),
            &format!("Artifact Build Succeeded.\n\tPayload URI: {}\n\tLog URI: {}", uri, log_uri),
          )
          .await;

        if uri.is_empty() {
          return Err(StreamError::Protocol(format!(
            "artifact {} succeeded without a download URI",
            artifact_id
          )));
        }

        self.handler.artifact_build_completed(&name);
        self
          .emit(
            ArtifactDownload {
              artifact_id,
              download_uri: uri,
              checksum,
            },
            cancel,
          )
          .await?;
      }

      Message::ArtifactFailed {
        artifact_id,
        error_message,
        log_uri,
      } => {
        let Some(name) = self.monitored(message_type, &artifact_id) else {
          return Ok(Flow::Continue);
        };

        self.states.insert(artifact_id.clone(), BuildState::Failed);
        self
          .write_log(
            Some(&artifact_id),
            &format!("Artifact Build Failed.\n\tError Message: {}\n\tLog URI: {}", error_message, log_uri),
          )
          .await;
        self.handler.artifact_build_failed(&name, &error_message);
        self.summary.failed.push(FailedArtifact {
          artifact_id,
          name,
          message: error_message,
        });
      }

      Message::ArtifactProgress { artifact_id, message } => {
        let done = matches!(
          self.states.get(&artifact_id),
          Some(BuildState::Succeeded | BuildState::Failed)
        );
        if self.names.contains_key(&artifact_id) && !done {
          self.write_log(Some(&artifact_id), &format!("Log: {}", message)).await;
        }
      }

      Message::Heartbeat => {
        let waiting = self.still_waiting();
        debug!(waiting = waiting.len(), "build log heartbeat");
        self
          .write_log(
            None,
            &format!("Heartbeat (still waiting for {}: {})", waiting.len(), waiting.join(", ")),
          )
          .await;
      }
    }

    Ok(Flow::Continue)
  }

  /// Record an event. Returns false if it was seen before.
  fn observe(&mut self, message_type: &'static str, artifact_id: Option<&ArtifactId>) -> bool {
    self.observed.insert((message_type, artifact_id.cloned()))
  }

  /// Name of the artifact if the event concerns a monitored artifact and
  /// hasn't been seen before.
  fn monitored(&mut self, message_type: &'static str, artifact_id: &ArtifactId) -> Option<String> {
    let Some(name) = self.names.get(artifact_id).cloned() else {
      debug!(artifact = %artifact_id, message_type, "ignoring event for unmonitored artifact");
      return None;
    };
    if !self.observe(message_type, Some(artifact_id)) {
      debug!(artifact = %artifact_id, message_type, "ignoring duplicate event");
      return None;
    }
    Some(name)
  }

  async fn emit(&mut self, download: ArtifactDownload, cancel: &CancellationToken) -> Result<(), StreamError> {
    let Some(tx) = &self.ready else {
      return Ok(());
    };

    let artifact_id = download.artifact_id.clone();
    tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(StreamError::Cancelled),
      sent = tx.send(download) => {
        if sent.is_err() {
          debug!(artifact = %artifact_id, "no install workers left to receive artifact");
        } else {
          self.summary.ready += 1;
        }
      }
    }

    Ok(())
  }

  fn still_waiting(&self) -> Vec<String> {
    let mut waiting: Vec<String> = self
      .names
      .iter()
      .filter(|(id, _)| {
        !matches!(
          self.states.get(*id),
          Some(BuildState::Succeeded | BuildState::Failed)
        )
      })
      .map(|(id, name)| format!("{} ({})", name, id))
      .collect();
    waiting.sort();
    waiting
  }

  /// Append a line to the build log file. Write failures are logged and ignored.
  async fn write_log(&mut self, artifact_id: Option<&ArtifactId>, text: &str) {
    let Some(file) = self.log_file.as_mut() else {
      return;
    };

    let prefix = match artifact_id {
      Some(id) => match self.names.get(id) {
        Some(name) => format!("{} ({}): ", name, id),
        None => format!("{}: ", id),
      },
      None => String::new(),
    };

    let line = format!("{}{}\n", prefix, text);
    if let Err(e) = file.write_all(line.as_bytes()).await {
      warn!(error = %e, "failed to write build log file");
      return;
    }
    if let Err(e) = file.flush().await {
      warn!(error = %e, "failed to flush build log file");
    }
  }
}

async fn next_message(
  connection: &mut dyn BuildLogConnection,
  cancel: &CancellationToken,
) -> Result<Message, StreamError> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(StreamError::Cancelled),
    read = connection.read_message() => match read {
      Ok(Some(message)) => Ok(message),
      Ok(None) => Err(StreamError::ConnectionClosed),
      Err(e) => Err(StreamError::Connection(e)),
    },
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use async_trait::async_trait;

  use super::*;
  use crate::changeset::{ArtifactChangeset, ArtifactMap};
  use crate::recipe::{DependencyType, IngredientDependency, Recipe, ResolvedIngredient};

  struct ScriptedConnection {
    messages: VecDeque<Message>,
    /// Block forever once the script runs out instead of reporting a close.
    hang: bool,
    closed: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecipeRequest>>>,
  }

  #[async_trait]
  impl BuildLogConnection for ScriptedConnection {
    async fn subscribe(&mut self, request: &RecipeRequest) -> Result<(), ConnectionError> {
      self.requests.lock().unwrap().push(request.clone());
      Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<Message>, ConnectionError> {
      match self.messages.pop_front() {
        Some(message) => Ok(Some(message)),
        None if self.hang => std::future::pending().await,
        None => Ok(None),
      }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
      self.closed.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  #[derive(Default)]
  struct Recorder {
    events: Mutex<Vec<String>>,
  }

  impl Recorder {
    fn push(&self, event: String) {
      self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
      self.events.lock().unwrap().clone()
    }
  }

  impl MessageHandler for Recorder {
    fn build_starting(&self, total: usize) {
      self.push(format!("build_starting {}", total));
    }
    fn build_finished(&self) {
      self.push("build_finished".to_string());
    }
    fn artifact_build_starting(&self, name: &str) {
      self.push(format!("starting {}", name));
    }
    fn artifact_build_cached(&self, name: &str) {
      self.push(format!("cached {}", name));
    }
    fn artifact_build_completed(&self, name: &str) {
      self.push(format!("completed {}", name));
    }
    fn artifact_build_failed(&self, name: &str, message: &str) {
      self.push(format!("failed {}: {}", name, message));
    }
    fn change_summary(&self, _: &ArtifactMap, _: &ArtifactChangeset, _: &ArtifactChangeset) {}
    fn artifact_download_starting(&self, _: &str) {}
    fn artifact_download_completed(&self, _: &str) {}
    fn artifact_download_failed(&self, _: &str, _: &str) {}
  }

  fn dag() -> RecipeBuildDag {
    let builder = ResolvedIngredient {
      namespace: "builder".to_string(),
      name: "builder".to_string(),
      ingredient_version_id: "v-builder".to_string(),
      ..Default::default()
    };
    let package = |name: &str| ResolvedIngredient {
      namespace: "language".to_string(),
      name: name.to_string(),
      version: "1.0".to_string(),
      ingredient_version_id: format!("v-{}", name),
      artifact_id: Some(format!("a-{}", name)),
      dependencies: vec![IngredientDependency {
        ingredient_version_id: "v-builder".to_string(),
        dependency_types: vec![DependencyType::Build],
      }],
      ..Default::default()
    };
    let recipe = Recipe {
      recipe_id: "recipe-1".to_string(),
      resolved_ingredients: vec![builder, package("python"), package("zlib")],
    };
    RecipeBuildDag::resolve(&recipe).unwrap()
  }

  fn started(id: &str, cache_hit: bool) -> Message {
    Message::ArtifactStarted {
      artifact_id: ArtifactId::from(id),
      cache_hit,
    }
  }

  fn succeeded(id: &str) -> Message {
    Message::ArtifactSucceeded {
      artifact_id: ArtifactId::from(id),
      checksum: String::new(),
      uri: format!("s3://artifacts/{}.tar.gz", id),
      log_uri: String::new(),
    }
  }

  struct Run {
    result: Result<BuildLogSummary, StreamError>,
    downloads: Vec<ArtifactDownload>,
    events: Vec<String>,
    closed: usize,
    requests: Vec<RecipeRequest>,
  }

  async fn run_script(messages: Vec<Message>, options: BuildLogOptions) -> Run {
    let closed = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let connection = ScriptedConnection {
      messages: messages.into(),
      hang: false,
      closed: closed.clone(),
      requests: requests.clone(),
    };
    let recorder = Arc::new(Recorder::default());

    let mut log = BuildLog::start(
      Box::new(connection),
      &dag(),
      recorder.clone(),
      options,
      CancellationToken::new(),
    );
    let mut ready = log.take_ready().unwrap();
    let mut downloads = Vec::new();
    while let Some(download) = ready.recv().await {
      downloads.push(download);
    }
    let result = log.wait().await;

    let requests = requests.lock().unwrap().clone();
    Run {
      result,
      downloads,
      events: recorder.events(),
      closed: closed.load(Ordering::SeqCst),
      requests,
    }
  }

  #[tokio::test]
  async fn successful_build() {
    let run = run_script(
      vec![
        Message::BuildStarted,
        started("a-python", false),
        started("a-zlib", true),
        succeeded("a-zlib"),
        succeeded("a-python"),
        succeeded("recipe-1"),
        Message::BuildSucceeded,
      ],
      BuildLogOptions::default(),
    )
    .await;

    let summary = run.result.unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(summary.cached, 1);
    assert_eq!(summary.ready, 2);

    let ids: Vec<&str> = run.downloads.iter().map(|d| d.artifact_id.0.as_str()).collect();
    assert_eq!(ids, vec!["a-zlib", "a-python"]);

    assert_eq!(
      run.events,
      vec![
        "build_starting 2",
        "starting python",
        "cached zlib",
        "completed zlib",
        "completed python",
        "build_finished",
      ]
    );
    assert_eq!(run.closed, 1);
    assert_eq!(run.requests[0].recipe_id, "recipe-1");
  }

  #[tokio::test]
  async fn duplicate_and_unknown_events_are_ignored() {
    let run = run_script(
      vec![
        Message::BuildStarted,
        Message::BuildStarted,
        started("a-python", false),
        started("a-python", false),
        started("a-stranger", false),
        succeeded("a-python"),
        succeeded("a-python"),
        succeeded("a-stranger"),
        Message::BuildSucceeded,
      ],
      BuildLogOptions::default(),
    )
    .await;

    assert!(run.result.is_ok());
    assert_eq!(run.downloads.len(), 1);
    assert_eq!(
      run.events,
      vec!["build_starting 2", "starting python", "completed python", "build_finished"]
    );
  }

  #[tokio::test]
  async fn artifact_failure_does_not_stop_siblings() {
    let run = run_script(
      vec![
        Message::BuildStarted,
        Message::ArtifactFailed {
          artifact_id: ArtifactId::from("a-python"),
          error_message: "compile error".to_string(),
          log_uri: String::new(),
        },
        succeeded("a-zlib"),
        Message::BuildFailed {
          error_message: "1 artifact failed".to_string(),
        },
      ],
      BuildLogOptions::default(),
    )
    .await;

    assert!(matches!(run.result, Err(StreamError::BuildFailed { ref message }) if message == "1 artifact failed"));
    assert_eq!(run.downloads.len(), 1);
    assert_eq!(run.downloads[0].artifact_id, ArtifactId::from("a-zlib"));
    assert!(run.events.contains(&"failed python: compile error".to_string()));
    assert_eq!(run.events.last().map(String::as_str), Some("build_finished"));
    assert_eq!(run.closed, 1);
  }

  #[tokio::test]
  async fn first_message_must_be_build_started() {
    let run = run_script(vec![started("a-python", false)], BuildLogOptions::default()).await;

    assert!(matches!(
      run.result,
      Err(StreamError::UnexpectedFirstMessage("artifact_started"))
    ));
    assert_eq!(run.events, vec!["build_finished"]);
    assert_eq!(run.closed, 1);
  }

  #[tokio::test]
  async fn connection_closed_mid_stream_keeps_emitted_artifacts() {
    let run = run_script(
      vec![Message::BuildStarted, succeeded("a-python")],
      BuildLogOptions::default(),
    )
    .await;

    assert!(matches!(run.result, Err(StreamError::ConnectionClosed)));
    assert_eq!(run.downloads.len(), 1);
    assert_eq!(run.closed, 1);
  }

  #[tokio::test]
  async fn success_without_uri_is_a_protocol_error() {
    let run = run_script(
      vec![
        Message::BuildStarted,
        Message::ArtifactSucceeded {
          artifact_id: ArtifactId::from("a-python"),
          checksum: String::new(),
          uri: String::new(),
          log_uri: String::new(),
        },
      ],
      BuildLogOptions::default(),
    )
    .await;

    assert!(matches!(run.result, Err(StreamError::Protocol(_))));
    assert!(run.downloads.is_empty());
  }

  #[tokio::test]
  async fn cancellation_before_first_message() {
    let closed = Arc::new(AtomicUsize::new(0));
    let connection = ScriptedConnection {
      messages: VecDeque::new(),
      hang: true,
      closed: closed.clone(),
      requests: Arc::new(Mutex::new(Vec::new())),
    };
    let recorder = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();

    let log = BuildLog::start(
      Box::new(connection),
      &dag(),
      recorder.clone(),
      BuildLogOptions::default(),
      cancel.clone(),
    );
    cancel.cancel();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), log.wait())
      .await
      .expect("stream did not observe cancellation");

    assert!(matches!(result, Err(StreamError::Cancelled)));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.events(), vec!["build_finished"]);
  }

  #[tokio::test]
  async fn writes_build_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("build.log");

    let run = run_script(
      vec![
        Message::BuildStarted,
        started("a-python", false),
        Message::ArtifactProgress {
          artifact_id: ArtifactId::from("a-python"),
          message: "compiling".to_string(),
        },
        Message::Heartbeat,
        succeeded("a-python"),
        Message::BuildSucceeded,
      ],
      BuildLogOptions {
        log_file: Some(path.clone()),
      },
    )
    .await;
    assert!(run.result.is_ok());

    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.starts_with("Build Started\n"));
    assert!(log.contains("python (a-python): Artifact Build Started\n"));
    assert!(log.contains("python (a-python): Log: compiling\n"));
    assert!(log.contains("Heartbeat (still waiting for 2: python (a-python), zlib (a-zlib))"));
    assert!(log.contains("Payload URI: s3://artifacts/a-python.tar.gz"));
    assert!(log.ends_with("Build Succeeded\n"));
  }
}
