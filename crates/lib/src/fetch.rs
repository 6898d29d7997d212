//! Artifact archive downloads.
//!
//! Archives are fetched over `http(s)://` or read from `file://` locations,
//! verified against their SHA-256 checksum and kept in a cache directory keyed
//! by artifact ID, so reinstalling an artifact doesn't download it again.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::ArtifactDownload;

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("unsupported download URI {0}")]
  UnsupportedScheme(String),

  #[error("failed to download {uri}: {message}")]
  Download { uri: String, message: String },

  #[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    uri: String,
    expected: String,
    actual: String,
  },

  #[error("download of {0} cancelled")]
  Cancelled(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Downloads artifact archives into a local cache.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
  client: reqwest::Client,
  cache_dir: PathBuf,
}

impl ArtifactFetcher {
  pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
    Self {
      client: reqwest::Client::new(),
      cache_dir: cache_dir.into(),
    }
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  /// Path the archive of an artifact is cached at.
  pub fn cached_path(&self, download: &ArtifactDownload) -> PathBuf {
    self.cache_dir.join(format!("{}.tar.gz", sanitize(&download.artifact_id.0)))
  }

  /// Fetch the archive of an artifact and return its local path.
  ///
  /// A cached archive is reused if it still matches the expected checksum.
  pub async fn fetch(&self, download: &ArtifactDownload, cancel: &CancellationToken) -> Result<PathBuf, FetchError> {
    let dest = self.cached_path(download);

    if fs::try_exists(&dest).await.unwrap_or(false) {
      if download.checksum.is_empty() {
        debug!(artifact = %download.artifact_id, "using cached archive");
        return Ok(dest);
      }
      let actual = hash_file(&dest).await?;
      if actual.eq_ignore_ascii_case(&download.checksum) {
        debug!(artifact = %download.artifact_id, "using cached archive");
        return Ok(dest);
      }
      debug!(
        artifact = %download.artifact_id,
        expected = %download.checksum,
        actual = %actual,
        "cached archive checksum mismatch, downloading again"
      );
    }

    info!(artifact = %download.artifact_id, uri = %download.download_uri, "downloading artifact");
    let bytes = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(FetchError::Cancelled(download.download_uri.clone())),
      bytes = self.read_uri(&download.download_uri) => bytes?,
    };

    if !download.checksum.is_empty() {
      let actual = hash_bytes(&bytes);
      if !actual.eq_ignore_ascii_case(&download.checksum) {
        return Err(FetchError::ChecksumMismatch {
          uri: download.download_uri.clone(),
          expected: download.checksum.clone(),
          actual,
        });
      }
    }

    fs::create_dir_all(&self.cache_dir).await?;
    let partial = dest.with_extension("partial");
    let mut file = fs::File::create(&partial).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&partial, &dest).await?;

    debug!(path = ?dest, size = bytes.len(), "download complete");
    Ok(dest)
  }

  async fn read_uri(&self, uri: &str) -> Result<Vec<u8>, FetchError> {
    if let Some(path) = uri.strip_prefix("file://") {
      return fs::read(path).await.map_err(|e| FetchError::Download {
        uri: uri.to_string(),
        message: e.to_string(),
      });
    }

    if !(uri.starts_with("http://") || uri.starts_with("https://")) {
      return Err(FetchError::UnsupportedScheme(uri.to_string()));
    }

    let download_error = |e: reqwest::Error| FetchError::Download {
      uri: uri.to_string(),
      message: e.to_string(),
    };

    let response = self.client.get(uri).send().await.map_err(download_error)?;
    if !response.status().is_success() {
      return Err(FetchError::Download {
        uri: uri.to_string(),
        message: format!("HTTP {}", response.status()),
      });
    }

    let bytes = response.bytes().await.map_err(download_error)?;
    Ok(bytes.to_vec())
  }
}

fn hash_bytes(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
  let bytes = fs::read(path).await?;
  Ok(hash_bytes(&bytes))
}

/// Keep artifact IDs safe to use as file names.
pub(crate) fn sanitize(id: &str) -> String {
  id.chars()
    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect()
}
