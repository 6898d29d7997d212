mod diff;
mod install;
mod resolve;
mod status;

use std::path::Path;

use anyhow::{Context, Result};

use rtsetup_lib::recipe::Recipe;

pub use diff::cmd_diff;
pub use install::{InstallArgs, cmd_install};
pub use resolve::cmd_resolve;
pub use status::cmd_status;

pub(crate) fn load_recipe(path: &Path) -> Result<Recipe> {
  let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read recipe: {}", path.display()))?;
  Recipe::from_json(&content).with_context(|| format!("Failed to parse recipe: {}", path.display()))
}
