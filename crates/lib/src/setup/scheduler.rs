//! Bounded-concurrency install of artifacts as they become ready.
//!
//! A fixed pool of workers pulls downloads from a single ready channel. The
//! first failure cancels the remaining workers and is the error reported.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::artifact::{ArtifactDownload, ArtifactId};

#[derive(Debug, Error)]
pub enum ScheduleError<E>
where
  E: std::error::Error + 'static,
{
  #[error("failed to set up artifact {artifact_id}: {source}")]
  Setup {
    artifact_id: ArtifactId,
    #[source]
    source: E,
  },

  #[error("install worker panicked: {0}")]
  WorkerPanicked(String),

  #[error("install cancelled")]
  Cancelled,
}

/// Run `setup` for every download received on `ready` with at most
/// `workers` running at once.
///
/// Returns the number of downloads set up once the channel is closed and
/// drained. Cancelling `cancel` stops workers from taking new downloads.
pub async fn run<F, Fut, E>(
  cancel: &CancellationToken,
  ready: mpsc::Receiver<ArtifactDownload>,
  setup: F,
  workers: usize,
) -> Result<usize, ScheduleError<E>>
where
  F: Fn(ArtifactDownload, CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), E>> + Send + 'static,
  E: std::error::Error + Send + 'static,
{
  let workers = workers.max(1);
  let token = cancel.child_token();
  let ready = Arc::new(Mutex::new(ready));
  let setup = Arc::new(setup);
  let completed = Arc::new(AtomicUsize::new(0));
  // Every worker reports at most one error, so sends never block.
  let (err_tx, mut err_rx) = mpsc::channel::<ScheduleError<E>>(workers);

  let mut set = JoinSet::new();
  for worker in 0..workers {
    let token = token.clone();
    let ready = Arc::clone(&ready);
    let setup = Arc::clone(&setup);
    let completed = Arc::clone(&completed);
    let err_tx = err_tx.clone();

    set.spawn(async move {
      loop {
        let next = {
          let mut ready = ready.lock().await;
          tokio::select! {
            biased;
            _ = token.cancelled() => None,
            download = ready.recv() => download,
          }
        };
        let Some(download) = next else {
          break;
        };

        let artifact_id = download.artifact_id.clone();
        debug!(worker, artifact = %artifact_id, "setting up artifact");
        match (*setup)(download, token.clone()).await {
          Ok(()) => {
            completed.fetch_add(1, Ordering::SeqCst);
          }
          // Work interrupted by cancellation is not a failure of its own.
          Err(source) if token.is_cancelled() => {
            debug!(worker, artifact = %artifact_id, error = %source, "setup stopped by cancellation");
            break;
          }
          Err(source) => {
            error!(worker, artifact = %artifact_id, error = %source, "artifact setup failed");
            token.cancel();
            let _ = err_tx.send(ScheduleError::Setup { artifact_id, source }).await;
            break;
          }
        }
      }
    });
  }
  drop(err_tx);

  let mut panicked = None;
  while let Some(joined) = set.join_next().await {
    if let Err(err) = joined {
      token.cancel();
      panicked.get_or_insert_with(|| err.to_string());
    }
  }

  if let Ok(err) = err_rx.try_recv() {
    return Err(err);
  }
  if let Some(message) = panicked {
    return Err(ScheduleError::WorkerPanicked(message));
  }
  if cancel.is_cancelled() {
    return Err(ScheduleError::Cancelled);
  }

  Ok(completed.load(Ordering::SeqCst))
}
