//! Artifact changesets between two recipes.
//!
//! [`resolved`] is the full diff the installer acts upon. [`requested`] narrows
//! it to the artifacts the order asked for directly, which is what a user
//! reviewing a commit wants to see.
//!
//! Updates are detected by ingredient name only. Two unrelated ingredients
//! sharing a name in different namespaces can therefore be reported as an
//! update of one another.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::ArtifactId;
use crate::recipe::{DependencyType, Recipe, is_bundle_namespace, is_runtime_namespace};

/// Installable artifact as seen by the changeset differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
  pub artifact_id: ArtifactId,
  pub name: String,
  pub namespace: String,
  pub version: Option<String>,

  /// The order asked for this artifact, rather than it being pulled in by
  /// dependency resolution.
  pub requested_by_order: bool,

  /// Index among the recipe's installable artifacts, for deterministic ordering.
  pub recipe_position: usize,

  /// Runtime dependencies that are also installable artifacts. A bundle
  /// depends on every member, whatever the edge type.
  pub dependencies: Vec<ArtifactId>,
}

impl ArtifactRecord {
  /// `name@version`, or just the name when the version is unknown.
  pub fn name_with_version(&self) -> String {
    match &self.version {
      Some(version) => format!("{}@{}", self.name, version),
      None => self.name.clone(),
    }
  }
}

pub type ArtifactMap = HashMap<ArtifactId, ArtifactRecord>;

/// Extract the installable artifacts of a recipe.
///
/// Only language, package, bundle and shared ingredients are installed into a
/// runtime.
pub fn artifacts_from_recipe(recipe: &Recipe) -> ArtifactMap {
  let mut ids_by_version = HashMap::new();
  let mut records = ArtifactMap::new();
  let mut position = 0;

  for ingredient in &recipe.resolved_ingredients {
    if !is_runtime_namespace(&ingredient.namespace) {
      continue;
    }
    let Some(artifact_id) = ingredient.artifact_id.as_deref().filter(|id| !id.is_empty()) else {
      debug!(ingredient = %ingredient.full_name(), "skipping ingredient without artifact");
      continue;
    };

    let id = ArtifactId(artifact_id.to_string());
    ids_by_version.insert(ingredient.ingredient_version_id.as_str(), id.clone());
    records.insert(
      id.clone(),
      ArtifactRecord {
        artifact_id: id,
        name: ingredient.name.clone(),
        namespace: ingredient.namespace.clone(),
        version: Some(ingredient.version.clone()).filter(|v| !v.is_empty()),
        requested_by_order: !ingredient.resolved_requirements.is_empty(),
        recipe_position: position,
        dependencies: Vec::new(),
      },
    );
    position += 1;
  }

  for ingredient in &recipe.resolved_ingredients {
    let Some(id) = ids_by_version.get(ingredient.ingredient_version_id.as_str()) else {
      continue;
    };
    let bundle = is_bundle_namespace(&ingredient.namespace);
    let mut deps: Vec<ArtifactId> = ingredient
      .dependencies
      .iter()
      .filter(|d| bundle || d.is_type(DependencyType::Runtime))
      .filter_map(|d| ids_by_version.get(d.ingredient_version_id.as_str()).cloned())
      .collect();
    deps.sort();
    deps.dedup();
    if let Some(record) = records.get_mut(id) {
      record.dependencies = deps;
    }
  }

  records
}

/// One artifact replaced by another artifact of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUpdate {
  pub from_id: ArtifactId,
  pub from_version: Option<String>,
  pub to_id: ArtifactId,
  pub to_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactChangeset {
  pub added: Vec<ArtifactId>,
  pub removed: Vec<ArtifactId>,
  pub updated: Vec<ArtifactUpdate>,
}

impl ArtifactChangeset {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
  }

  /// Artifacts that must be removed from disk: removed ones and the old side
  /// of updates.
  pub fn outdated(&self) -> impl Iterator<Item = &ArtifactId> {
    self.removed.iter().chain(self.updated.iter().map(|u| &u.from_id))
  }

  /// Artifacts new to the installation: added ones and the new side of updates.
  pub fn incoming(&self) -> impl Iterator<Item = &ArtifactId> {
    self.added.iter().chain(self.updated.iter().map(|u| &u.to_id))
  }
}

/// Every artifact difference between `old` and `new`.
///
/// An artifact that disappeared and one that appeared under the same name are
/// reported as a single update. Lists are ordered by recipe position.
pub fn resolved(old: &ArtifactMap, new: &ArtifactMap) -> ArtifactChangeset {
  let mut added: Vec<&ArtifactRecord> = new.values().filter(|a| !old.contains_key(&a.artifact_id)).collect();
  let mut removed: Vec<&ArtifactRecord> = old.values().filter(|a| !new.contains_key(&a.artifact_id)).collect();
  sort_records(&mut added);
  sort_records(&mut removed);

  // First added artifact of each name is the update candidate.
  let mut added_by_name: HashMap<&str, &ArtifactRecord> = HashMap::new();
  for &record in &added {
    added_by_name.entry(record.name.as_str()).or_insert(record);
  }

  let mut updated = Vec::new();
  let mut updated_from: HashSet<&ArtifactId> = HashSet::new();
  for &record in &removed {
    if let Some(to) = added_by_name.remove(record.name.as_str()) {
      updated_from.insert(&record.artifact_id);
      updated.push((
        to.recipe_position,
        ArtifactUpdate {
          from_id: record.artifact_id.clone(),
          from_version: record.version.clone(),
          to_id: to.artifact_id.clone(),
          to_version: to.version.clone(),
        },
      ));
    }
  }
  updated.sort_by(|(a_pos, a), (b_pos, b)| a_pos.cmp(b_pos).then_with(|| a.to_id.cmp(&b.to_id)));
  let updated: Vec<ArtifactUpdate> = updated.into_iter().map(|(_, u)| u).collect();
  let updated_to: HashSet<&ArtifactId> = updated.iter().map(|u| &u.to_id).collect();

  ArtifactChangeset {
    added: added
      .into_iter()
      .filter(|a| !updated_to.contains(&a.artifact_id))
      .map(|a| a.artifact_id.clone())
      .collect(),
    removed: removed
      .into_iter()
      .filter(|a| !updated_from.contains(&a.artifact_id))
      .map(|a| a.artifact_id.clone())
      .collect(),
    updated,
  }
}

/// The subset of [`resolved`] the order asked for directly.
///
/// Added artifacts are checked on the new side, removed ones on the old side,
/// and updates qualify when either side was requested.
pub fn requested(old: &ArtifactMap, new: &ArtifactMap) -> ArtifactChangeset {
  let changes = resolved(old, new);
  let requested_in = |map: &ArtifactMap, id: &ArtifactId| map.get(id).is_some_and(|a| a.requested_by_order);

  ArtifactChangeset {
    added: changes.added.into_iter().filter(|id| requested_in(new, id)).collect(),
    removed: changes.removed.into_iter().filter(|id| requested_in(old, id)).collect(),
    updated: changes
      .updated
      .into_iter()
      .filter(|u| requested_in(old, &u.from_id) || requested_in(new, &u.to_id))
      .collect(),
  }
}

fn sort_records(records: &mut [&ArtifactRecord]) {
  records.sort_by(|a, b| {
    a.recipe_position
      .cmp(&b.recipe_position)
      .then_with(|| a.artifact_id.cmp(&b.artifact_id))
  });
}
