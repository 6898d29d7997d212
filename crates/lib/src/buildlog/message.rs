use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;

/// A message received from the build-progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
  BuildStarted,
  BuildSucceeded,
  BuildFailed {
    #[serde(default)]
    error_message: String,
  },
  ArtifactStarted {
    artifact_id: ArtifactId,
    #[serde(default)]
    cache_hit: bool,
  },
  ArtifactSucceeded {
    artifact_id: ArtifactId,
    #[serde(default)]
    checksum: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    log_uri: String,
  },
  ArtifactFailed {
    artifact_id: ArtifactId,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    log_uri: String,
  },
  /// A line of build output for one artifact.
  ArtifactProgress {
    artifact_id: ArtifactId,
    #[serde(default)]
    message: String,
  },
  Heartbeat,
}

impl Message {
  /// The wire name of the message type.
  pub fn message_type(&self) -> &'static str {
    match self {
      Message::BuildStarted => "build_started",
      Message::BuildSucceeded => "build_succeeded",
      Message::BuildFailed { .. } => "build_failed",
      Message::ArtifactStarted { .. } => "artifact_started",
      Message::ArtifactSucceeded { .. } => "artifact_succeeded",
      Message::ArtifactFailed { .. } => "artifact_failed",
      Message::ArtifactProgress { .. } => "artifact_progress",
      Message::Heartbeat => "heartbeat",
    }
  }
}

/// Subscribes the connection to the events of one recipe build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeRequest {
  #[serde(rename = "recipeID")]
  pub recipe_id: String,
}
