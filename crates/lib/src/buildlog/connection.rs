use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use super::message::{Message, RecipeRequest};

#[derive(Debug, Error)]
pub enum ConnectionError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to decode message {line:?}: {source}")]
  Decode {
    line: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to encode request: {0}")]
  Encode(#[source] serde_json::Error),
}

/// A persistent message connection to the remote build service.
#[async_trait]
pub trait BuildLogConnection: Send {
  /// Ask for the events of one recipe build.
  async fn subscribe(&mut self, request: &RecipeRequest) -> Result<(), ConnectionError>;

  /// Read the next message. `Ok(None)` means the peer closed the connection.
  async fn read_message(&mut self) -> Result<Option<Message>, ConnectionError>;

  async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Connection carrying one JSON message per line.
pub struct JsonLinesConnection<R, W> {
  lines: Lines<BufReader<R>>,
  writer: W,
}

impl<R, W> JsonLinesConnection<R, W>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  pub fn new(reader: R, writer: W) -> Self {
    Self {
      lines: BufReader::new(reader).lines(),
      writer,
    }
  }
}

#[async_trait]
impl<R, W> BuildLogConnection for JsonLinesConnection<R, W>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  async fn subscribe(&mut self, request: &RecipeRequest) -> Result<(), ConnectionError> {
    let mut line = serde_json::to_vec(request).map_err(ConnectionError::Encode)?;
    line.push(b'\n');
    self.writer.write_all(&line).await?;
    self.writer.flush().await?;
    Ok(())
  }

  async fn read_message(&mut self) -> Result<Option<Message>, ConnectionError> {
    while let Some(line) = self.lines.next_line().await? {
      if line.trim().is_empty() {
        continue;
      }
      return serde_json::from_str(&line)
        .map(Some)
        .map_err(|source| ConnectionError::Decode { line, source });
    }
    Ok(None)
  }

  async fn close(&mut self) -> Result<(), ConnectionError> {
    self.writer.shutdown().await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::ArtifactId;

  #[tokio::test]
  async fn reads_lines_and_writes_request() {
    let input = b"{\"type\":\"build_started\"}\n\n{\"type\":\"artifact_failed\",\"artifact_id\":\"a\"}\n";
    let mut output = Vec::new();

    {
      let mut conn = JsonLinesConnection::new(&input[..], &mut output);
      conn
        .subscribe(&RecipeRequest {
          recipe_id: "r".to_string(),
        })
        .await
        .unwrap();

      assert_eq!(conn.read_message().await.unwrap(), Some(Message::BuildStarted));
      assert_eq!(
        conn.read_message().await.unwrap(),
        Some(Message::ArtifactFailed {
          artifact_id: ArtifactId::from("a"),
          error_message: String::new(),
          log_uri: String::new(),
        })
      );
      assert_eq!(conn.read_message().await.unwrap(), None);
      conn.close().await.unwrap();
    }

    assert_eq!(String::from_utf8(output).unwrap(), "{\"recipeID\":\"r\"}\n");
  }

  #[tokio::test]
  async fn malformed_line_is_a_decode_error() {
    let mut conn = JsonLinesConnection::new(&b"garbage\n"[..], tokio::io::sink());
    let err = conn.read_message().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Decode { .. }));
  }
}
