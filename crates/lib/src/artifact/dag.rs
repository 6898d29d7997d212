//! Recipe resolution into a validated build DAG.
//!
//! Every non-builder ingredient of a recipe becomes an [`Artifact`] node. Its
//! build dependencies are the artifacts it declares `build` edges to, plus the
//! full transitive runtime closure of each of those, since everything a build
//! dependency links against must be installed while the artifact builds.
//! A synthetic terminal artifact depends on every real artifact so the graph
//! has a single root.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::consts::{BUILDER_NAMESPACE, LEGACY_PATCH_BUILDER, OBJECT_STORE_SCHEME};
use crate::recipe::{DependencyType, IngredientDependency, Recipe, ResolvedIngredient};

use super::types::{
  Artifact, ArtifactId, BuildState, BuildType, BuilderDependency, IngredientMetadata, InvalidRecipeKind,
  ResolveError, timestamp,
};

/// The build DAG of one recipe.
///
/// Immutable after [`RecipeBuildDag::resolve`] except for build state, which
/// [`RecipeBuildDag::initialize_build_state`] fills in.
#[derive(Debug, Clone)]
pub struct RecipeBuildDag {
  recipe_id: String,
  terminal_id: ArtifactId,
  artifacts: HashMap<ArtifactId, Artifact>,
}

impl RecipeBuildDag {
  /// Resolve a recipe into a build DAG.
  ///
  /// Resolution is deterministic: resolving the same recipe twice, regardless
  /// of ingredient order, yields identical dependency orderings.
  ///
  /// # Errors
  ///
  /// Returns a [`ResolveError`] when the recipe is malformed. See
  /// [`InvalidRecipeKind`] for the individual validation failures.
  pub fn resolve(recipe: &Recipe) -> Result<Self, ResolveError> {
    let resolver = Resolver::new(recipe)?;

    let mut artifacts = HashMap::new();
    for ingredient in &recipe.resolved_ingredients {
      if let Some(id) = resolver.artifact_ids.get(ingredient.ingredient_version_id.as_str()) {
        let artifact = resolver.resolve_artifact(ingredient, id)?;
        artifacts.insert(id.clone(), artifact);
      }
    }

    // The terminal artifact has no ID of its own, and there is exactly one
    // per recipe, so it borrows the recipe ID.
    let terminal_id = ArtifactId(recipe.recipe_id.clone());
    let mut terminal = Artifact::new(
      terminal_id.clone(),
      BuildType::Packager,
      None,
      IngredientMetadata::noop_builder(),
    );
    terminal.build_dependencies = artifacts.keys().cloned().collect();
    resolver.sort_artifact_ids(&mut terminal.build_dependencies);
    artifacts.insert(terminal_id.clone(), terminal);

    let dag = Self {
      recipe_id: recipe.recipe_id.clone(),
      terminal_id,
      artifacts,
    };

    dag.verify_acyclic()?;

    debug!(
      recipe = %dag.recipe_id,
      artifacts = dag.real_artifact_count(),
      "resolved recipe build DAG"
    );

    Ok(dag)
  }

  /// Verify that no artifact transitively needs itself to build.
  ///
  /// The runtime-closure walk in [`Resolver`] only catches cycles that pass
  /// back through the artifact being resolved. This catches cycles made of
  /// build edges alone.
  fn verify_acyclic(&self) -> Result<(), ResolveError> {
    let (graph, _) = self.graph();
    toposort(&graph, None).map_err(|cycle| {
      let id = graph[cycle.node_id()].clone();
      let ingredient = self.artifacts.get(&id).map(ToString::to_string).unwrap_or_else(|| id.to_string());
      ResolveError::new(
        InvalidRecipeKind::DependencyCycle,
        Some(id),
        ingredient,
        "is part of a build dependency cycle",
      )
    })?;
    Ok(())
  }

  /// Graph with an edge from each dependency to its dependent.
  fn graph(&self) -> (DiGraph<ArtifactId, ()>, HashMap<&ArtifactId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    let mut ids: Vec<&ArtifactId> = self.artifacts.keys().collect();
    ids.sort();
    for id in ids {
      nodes.insert(id, graph.add_node(id.clone()));
    }

    for (id, artifact) in &self.artifacts {
      let dependent = nodes[id];
      for dep in &artifact.build_dependencies {
        if let Some(&dependency) = nodes.get(dep) {
          graph.add_edge(dependency, dependent, ());
        }
      }
    }

    (graph, nodes)
  }

  pub fn recipe_id(&self) -> &str {
    &self.recipe_id
  }

  pub fn terminal_id(&self) -> &ArtifactId {
    &self.terminal_id
  }

  pub fn terminal(&self) -> Option<&Artifact> {
    self.artifacts.get(&self.terminal_id)
  }

  pub fn is_terminal(&self, id: &ArtifactId) -> bool {
    *id == self.terminal_id
  }

  pub fn get(&self, id: &ArtifactId) -> Option<&Artifact> {
    self.artifacts.get(id)
  }

  /// Number of artifacts excluding the terminal artifact.
  pub fn real_artifact_count(&self) -> usize {
    self.artifacts.len().saturating_sub(1)
  }

  /// All artifacts including the terminal one, in no particular order.
  pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
    self.artifacts.values()
  }

  /// All artifacts, dependencies before dependents, each exactly once.
  ///
  /// The terminal artifact is always last. This is a legal build and install
  /// order.
  pub fn post_order(&self) -> Vec<&Artifact> {
    let mut order = Vec::with_capacity(self.artifacts.len());
    let mut visited: HashSet<&ArtifactId> = HashSet::new();
    let mut stack: Vec<(&ArtifactId, usize)> = vec![(&self.terminal_id, 0)];
    visited.insert(&self.terminal_id);

    while let Some(top) = stack.last_mut() {
      let (id, next) = (top.0, top.1);
      top.1 += 1;

      let Some(artifact) = self.artifacts.get(id) else {
        stack.pop();
        continue;
      };

      match artifact.build_dependencies.get(next) {
        Some(dep) => {
          if visited.insert(dep) {
            stack.push((dep, 0));
          }
        }
        None => {
          order.push(artifact);
          stack.pop();
        }
      }
    }

    order
  }

  /// Initialize the build state of every artifact.
  ///
  /// Artifacts found in `existing` take their recorded outcome verbatim.
  /// Every other artifact is:
  /// - `Ready` when all its dependencies succeeded (or it has none), with
  ///   `ready_at` stamped to now
  /// - `Doomed` when any dependency failed, was doomed or was skipped
  /// - `Blocked` otherwise
  ///
  /// Artifacts that already have a state are left untouched, so calling this
  /// again is a no-op.
  pub fn initialize_build_state(&mut self, existing: &HashMap<ArtifactId, Artifact>) {
    let order: Vec<ArtifactId> = self.post_order().into_iter().map(|a| a.artifact_id.clone()).collect();

    for id in order {
      let Some(artifact) = self.artifacts.get(&id) else {
        continue;
      };
      if artifact.build_state.is_some() {
        continue;
      }

      if let Some(recorded) = existing.get(&id) {
        if let Some(artifact) = self.artifacts.get_mut(&id) {
          artifact.copy_outcome_from(recorded);
        }
        continue;
      }

      let mut state = BuildState::Ready;
      for dep in &artifact.build_dependencies {
        let dep_state = self.artifacts.get(dep).and_then(|a| a.build_state);
        match dep_state {
          Some(s) if s.is_failure() => state = BuildState::Doomed,
          Some(BuildState::Succeeded) => {}
          _ if state != BuildState::Doomed => state = BuildState::Blocked,
          _ => {}
        }
      }

      if let Some(artifact) = self.artifacts.get_mut(&id) {
        artifact.build_state = Some(state);
        if state == BuildState::Ready {
          artifact.ready_at = Some(timestamp());
        }
      }
    }
  }

  /// Group the real artifacts into waves that can be built in parallel.
  ///
  /// Every artifact's dependencies are in earlier waves. Artifacts within a
  /// wave are ordered the same way dependency lists are.
  pub fn build_waves(&self) -> Vec<Vec<ArtifactId>> {
    let (graph, _) = self.graph();

    let mut in_degree: HashMap<NodeIndex, usize> = graph
      .node_indices()
      .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[*idx] == 0).copied().collect();
      if ready.is_empty() {
        // Unreachable for a resolved DAG, which is verified acyclic.
        break;
      }

      let mut wave = Vec::new();
      for idx in ready {
        remaining.remove(&idx);
        for neighbor in graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
        if !self.is_terminal(&graph[idx]) {
          wave.push(graph[idx].clone());
        }
      }

      if !wave.is_empty() {
        wave.sort_by_cached_key(|id| (self.artifacts.get(id).map(ToString::to_string), id.clone()));
        waves.push(wave);
      }
    }

    waves
  }
}

impl fmt::Display for RecipeBuildDag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(terminal) = self.terminal() else {
      return Ok(());
    };
    writeln!(f, "{}", terminal)?;

    let mut visited = HashSet::new();
    self.write_tree(f, &mut visited, "", terminal)
  }
}

impl RecipeBuildDag {
  fn write_tree<'a>(
    &'a self,
    f: &mut fmt::Formatter<'_>,
    visited: &mut HashSet<&'a ArtifactId>,
    prefix: &str,
    artifact: &'a Artifact,
  ) -> fmt::Result {
    if !visited.insert(&artifact.artifact_id) {
      if !artifact.build_dependencies.is_empty() {
        writeln!(f, "{}    [dependencies already printed]", prefix)?;
      }
      return Ok(());
    }

    let count = artifact.build_dependencies.len();
    for (i, dep_id) in artifact.build_dependencies.iter().enumerate() {
      let Some(dep) = self.artifacts.get(dep_id) else {
        continue;
      };
      let (branch, indent) = if i + 1 == count {
        ("└── ", "    ")
      } else {
        ("├── ", "│   ")
      };
      writeln!(f, "{}{}{}", prefix, branch, dep)?;
      self.write_tree(f, visited, &format!("{}{}", prefix, indent), dep)?;
    }

    Ok(())
  }
}

/// Lookup tables shared by the per-artifact resolution steps.
struct Resolver<'a> {
  ingredients: HashMap<&'a str, &'a ResolvedIngredient>,
  /// Ingredient version ID to artifact ID, for buildable ingredients only.
  artifact_ids: HashMap<&'a str, ArtifactId>,
  /// Artifact ID to its ordering key, the artifact's display string.
  sort_keys: HashMap<ArtifactId, String>,
}

impl<'a> Resolver<'a> {
  fn new(recipe: &'a Recipe) -> Result<Self, ResolveError> {
    let mut ingredients = HashMap::new();
    let mut artifact_ids = HashMap::new();
    let mut sort_keys = HashMap::new();

    for ingredient in &recipe.resolved_ingredients {
      let version_id = ingredient.ingredient_version_id.as_str();
      ingredients.insert(version_id, ingredient);

      // Builders and their libraries are only ever used to build other
      // ingredients, so they never get artifacts of their own.
      if ingredient.is_builder_related() {
        continue;
      }

      let id = match ingredient.artifact_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => ArtifactId(id.to_string()),
        _ => {
          return Err(ResolveError::new(
            InvalidRecipeKind::MissingArtifactId,
            None,
            ingredient.full_name(),
            "does not have a valid artifact ID",
          ));
        }
      };

      sort_keys.insert(id.clone(), format!("Build of {}", ingredient.full_name()));
      artifact_ids.insert(version_id, id);
    }

    Ok(Self {
      ingredients,
      artifact_ids,
      sort_keys,
    })
  }

  fn resolve_artifact(&self, ingredient: &'a ResolvedIngredient, id: &ArtifactId) -> Result<Artifact, ResolveError> {
    let invalid = |kind, message: String| ResolveError::new(kind, Some(id.clone()), ingredient.full_name(), message);

    let mut builder: Option<&ResolvedIngredient> = None;
    let mut closure: HashSet<&str> = HashSet::new();

    for edge in ingredient.dependencies.iter().filter(|d| d.is_type(DependencyType::Build)) {
      let version_id = edge.ingredient_version_id.as_str();

      if let Some(dep_id) = self.artifact_ids.get(version_id) {
        if dep_id == id {
          return Err(invalid(
            InvalidRecipeKind::DependencyCycle,
            format!(
              "depends upon itself to build: {} {}",
              path_segment(ingredient, edge),
              ingredient.full_name()
            ),
          ));
        }
        if closure.insert(version_id) {
          self.collect_runtime_closure(ingredient, id, edge, &mut closure)?;
        }
      } else if let Some(candidate) = self.ingredients.get(version_id) {
        // Without an artifact this is builder tooling; only a builder itself
        // can be built with.
        if candidate.namespace != BUILDER_NAMESPACE {
          return Err(invalid(
            InvalidRecipeKind::DisallowedDependency,
            format!(
              "has a build dependency on {}, which is not a builder",
              candidate.full_name()
            ),
          ));
        }
        if let Some(existing) = builder {
          return Err(invalid(
            InvalidRecipeKind::MultipleBuilders,
            format!(
              "has multiple builders: {} and {}",
              existing.full_name(),
              candidate.full_name()
            ),
          ));
        }
        builder = Some(candidate);
      } else {
        return Err(invalid(
          InvalidRecipeKind::MissingDependency,
          format!("depends on ingredient version {}, which isn't in the recipe", version_id),
        ));
      }
    }

    let Some(builder) = builder else {
      return Err(invalid(
        InvalidRecipeKind::MissingBuilder,
        "has no builder in the recipe".to_string(),
      ));
    };

    let mut artifact = Artifact::new(
      id.clone(),
      BuildType::Builder,
      Some(IngredientMetadata::from_ingredient(ingredient)),
      IngredientMetadata::from_ingredient(builder),
    );
    artifact.builder_dependencies = self.collect_builder_closure(builder)?;

    for patch in &ingredient.patches {
      // The patch `content` field holds the patch location.
      if builder.name != LEGACY_PATCH_BUILDER && !patch.content.starts_with(OBJECT_STORE_SCHEME) {
        return Err(invalid(
          InvalidRecipeKind::InvalidPatchUri,
          format!(
            "has a patch {} with an invalid object store URI: '{}'",
            patch.sequence_number, patch.content
          ),
        ));
      }
      artifact.patch_uris.push(patch.content.clone());
    }

    artifact.build_dependencies = closure
      .into_iter()
      .filter_map(|version_id| self.artifact_ids.get(version_id).cloned())
      .collect();
    self.sort_artifact_ids(&mut artifact.build_dependencies);

    Ok(artifact)
  }

  /// Fold the transitive runtime closure of the build dependency `edge`
  /// points at into `closure`.
  ///
  /// Fails with `DependencyCycle` if the walk reaches `root_id`, the artifact
  /// being resolved.
  fn collect_runtime_closure(
    &self,
    root: &'a ResolvedIngredient,
    root_id: &ArtifactId,
    edge: &'a IngredientDependency,
    closure: &mut HashSet<&'a str>,
  ) -> Result<(), ResolveError> {
    let Some(&start) = self.ingredients.get(edge.ingredient_version_id.as_str()) else {
      return Ok(());
    };

    type Path<'p> = Vec<(&'p ResolvedIngredient, &'p IngredientDependency)>;
    let mut stack: Vec<(&'a ResolvedIngredient, Path<'a>)> = vec![(start, vec![(root, edge)])];

    while let Some((current, path)) = stack.pop() {
      for dep in current.dependencies.iter().filter(|d| d.is_type(DependencyType::Runtime)) {
        let version_id = dep.ingredient_version_id.as_str();
        if closure.contains(version_id) {
          continue;
        }

        let Some(&dep_ingredient) = self.ingredients.get(version_id) else {
          return Err(ResolveError::new(
            InvalidRecipeKind::MissingDependency,
            self.artifact_ids.get(current.ingredient_version_id.as_str()).cloned(),
            current.full_name(),
            format!("depends on ingredient version {}, which isn't in the recipe", version_id),
          ));
        };

        // Runtime edges onto builder tooling don't contribute artifacts.
        let Some(dep_id) = self.artifact_ids.get(version_id) else {
          continue;
        };

        let mut subpath = path.clone();
        subpath.push((current, dep));

        if dep_id == root_id {
          let segments: Vec<String> = subpath.iter().map(|(i, d)| path_segment(i, d)).collect();
          return Err(ResolveError::new(
            InvalidRecipeKind::DependencyCycle,
            Some(dep_id.clone()),
            dep_ingredient.full_name(),
            format!(
              "depends upon itself to build: {} {}",
              segments.join(" "),
              dep_ingredient.full_name()
            ),
          ));
        }

        closure.insert(version_id);
        stack.push((dep_ingredient, subpath));
      }
    }

    Ok(())
  }

  /// Collect the runtime closure of a builder's own dependencies.
  ///
  /// Builders may only depend on other builder tooling, and only at runtime.
  fn collect_builder_closure(&self, builder: &'a ResolvedIngredient) -> Result<Vec<BuilderDependency>, ResolveError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut deps = Vec::new();
    let mut stack = vec![builder];

    while let Some(current) = stack.pop() {
      let disallowed = |message: String| {
        ResolveError::new(
          InvalidRecipeKind::DisallowedDependency,
          current.artifact_id.clone().map(ArtifactId),
          current.full_name(),
          message,
        )
      };

      for dep in &current.dependencies {
        let version_id = dep.ingredient_version_id.as_str();
        if !dep.is_type(DependencyType::Runtime) {
          return Err(disallowed(format!(
            "has a non-runtime dependency on ingredient version {}. Only runtime dependencies are supported for builders.",
            version_id
          )));
        }

        if !seen.insert(version_id) {
          continue;
        }

        let Some(&dep_ingredient) = self.ingredients.get(version_id) else {
          return Err(ResolveError::new(
            InvalidRecipeKind::MissingDependency,
            current.artifact_id.clone().map(ArtifactId),
            current.full_name(),
            format!("depends on ingredient version {}, which isn't in the recipe", version_id),
          ));
        };

        if !dep_ingredient.is_builder_related() {
          return Err(disallowed(format!(
            "has dependency on {}. Only ingredients in the builder or builder-lib namespaces are supported as dependencies for builders.",
            dep_ingredient.full_name()
          )));
        }

        deps.push(BuilderDependency::from_ingredient(dep_ingredient));
        stack.push(dep_ingredient);
      }
    }

    deps.sort_by(|a, b| {
      a.source_uri
        .cmp(&b.source_uri)
        .then_with(|| a.full_name().cmp(&b.full_name()))
    });

    Ok(deps)
  }

  fn sort_artifact_ids(&self, ids: &mut [ArtifactId]) {
    ids.sort_by(|a, b| {
      self
        .sort_keys
        .get(a)
        .cmp(&self.sort_keys.get(b))
        .then_with(|| a.cmp(b))
    });
  }
}

/// `namespace/name version rN -[build,runtime]>`
fn path_segment(ingredient: &ResolvedIngredient, dep: &IngredientDependency) -> String {
  format!("{} -[{}]>", ingredient.full_name(), dep.type_list())
}
