//! Build service backed by recorded files.
//!
//! Replays a build from a recipe plus either a recorded build log (one JSON
//! message per line) or the download list of an already completed build.

use std::path::PathBuf;

use async_trait::async_trait;

use rtsetup_lib::artifact::ArtifactDownload;
use rtsetup_lib::buildlog::{BuildLogConnection, JsonLinesConnection};
use rtsetup_lib::recipe::Recipe;
use rtsetup_lib::setup::{BuildEngine, BuildRequest, BuildService, BuildStatus, ServiceError};

pub enum Recorded {
  /// Build log of an in-progress build.
  Events(PathBuf),
  /// Downloads of a completed build.
  Downloads(Vec<ArtifactDownload>),
}

pub struct RecordedBuildService {
  recipe: Recipe,
  engine: BuildEngine,
  recorded: Recorded,
}

impl RecordedBuildService {
  pub fn new(recipe: Recipe, engine: BuildEngine, recorded: Recorded) -> Self {
    Self {
      recipe,
      engine,
      recorded,
    }
  }
}

#[async_trait]
impl BuildService for RecordedBuildService {
  async fn resolve_recipe(&self, _commit_id: &str) -> Result<Recipe, ServiceError> {
    Ok(self.recipe.clone())
  }

  async fn request_build(&self, _recipe: &Recipe) -> Result<BuildRequest, ServiceError> {
    let status = match &self.recorded {
      Recorded::Events(_) => BuildStatus::InProgress,
      Recorded::Downloads(downloads) => BuildStatus::Completed {
        downloads: downloads.clone(),
      },
    };
    Ok(BuildRequest {
      engine: self.engine,
      status,
    })
  }

  async fn connect_build_log(&self, _recipe: &Recipe) -> Result<Box<dyn BuildLogConnection>, ServiceError> {
    let Recorded::Events(path) = &self.recorded else {
      return Err(ServiceError::Request("no build log was recorded".to_string()));
    };

    let file = tokio::fs::File::open(path).await.map_err(|source| ServiceError::Read {
      path: path.clone(),
      source,
    })?;
    Ok(Box::new(JsonLinesConnection::new(file, tokio::io::sink())))
  }
}
