//! Resolve command implementation.
//!
//! Validates a recipe and prints its artifact build graph.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::Stream;

use rtsetup_lib::artifact::RecipeBuildDag;

use super::load_recipe;
use crate::output::{Mark, print_json, print_stat, print_success};

pub fn cmd_resolve(path: &Path, verbose: bool, json: bool) -> Result<()> {
  let recipe = load_recipe(path)?;
  let dag = RecipeBuildDag::resolve(&recipe).context("Invalid recipe")?;

  let order: Vec<_> = dag
    .post_order()
    .into_iter()
    .filter(|a| !dag.is_terminal(&a.artifact_id))
    .collect();
  let waves = dag.build_waves();

  if json {
    let artifacts: Vec<_> = order
      .iter()
      .map(|a| {
        serde_json::json!({
          "artifact_id": a.artifact_id,
          "name": a.name(),
          "description": a.to_string(),
          "build_dependencies": a.build_dependencies,
        })
      })
      .collect();
    print_json(&serde_json::json!({
      "recipe_id": dag.recipe_id(),
      "artifacts": artifacts,
      "build_waves": waves,
    }))?;
    return Ok(());
  }

  print!("{}", dag);
  println!();
  print_stat("Artifacts", &dag.real_artifact_count().to_string());
  print_stat("Build waves", &waves.len().to_string());

  if verbose {
    println!();
    println!("Build order:");
    for (i, artifact) in order.iter().enumerate() {
      println!("  {:>3}. {} {}", i + 1, artifact, artifact.artifact_id);
    }

    println!();
    println!("Build waves:");
    for (i, wave) in waves.iter().enumerate() {
      let names: Vec<&str> = wave.iter().filter_map(|id| dag.get(id)).map(|a| a.name()).collect();
      println!("  {} wave {}: {}", Mark::Note.paint(Stream::Stdout), i + 1, names.join(", "));
    }
  }

  println!();
  print_success(&format!("Recipe {} is valid", dag.recipe_id()));
  Ok(())
}
