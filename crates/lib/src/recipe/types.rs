use serde::{Deserialize, Serialize};

/// Kind of dependency edge between two ingredients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
  Build,
  Runtime,
  Test,
}

/// A typed edge from one resolved ingredient to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngredientDependency {
  /// Version ID of the ingredient depended upon.
  pub ingredient_version_id: String,

  #[serde(default)]
  pub dependency_types: Vec<DependencyType>,
}

impl IngredientDependency {
  pub fn is_type(&self, dep_type: DependencyType) -> bool {
    self.dependency_types.contains(&dep_type)
  }

  /// Comma separated list of edge types, e.g. `build,runtime`.
  pub fn type_list(&self) -> String {
    self
      .dependency_types
      .iter()
      .map(|t| match t {
        DependencyType::Build => "build",
        DependencyType::Runtime => "runtime",
        DependencyType::Test => "test",
      })
      .collect::<Vec<_>>()
      .join(",")
  }
}

/// A patch applied to an ingredient's source before it is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
  pub sequence_number: u32,

  /// Location of the patch. Despite the name, this holds a URI.
  pub content: String,
}

/// One fully resolved ingredient of a recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIngredient {
  pub namespace: String,
  pub name: String,
  pub version: String,

  #[serde(default)]
  pub revision: u32,

  pub ingredient_version_id: String,

  /// Artifact provided by this ingredient. Absent for builder tooling.
  #[serde(default)]
  pub artifact_id: Option<String>,

  #[serde(default)]
  pub source_uri: String,

  #[serde(default)]
  pub source_checksum: String,

  #[serde(default)]
  pub dependencies: Vec<IngredientDependency>,

  #[serde(default)]
  pub patches: Vec<Patch>,

  #[serde(default)]
  pub options: Vec<String>,

  /// Order requirements this ingredient satisfies. Non-empty when the user asked for it directly.
  #[serde(default)]
  pub resolved_requirements: Vec<String>,
}

impl ResolvedIngredient {
  /// `namespace/name version rN`
  pub fn full_name(&self) -> String {
    format!("{}/{} {} r{}", self.namespace, self.name, self.version, self.revision)
  }

  pub fn is_builder_related(&self) -> bool {
    super::is_builder_related_namespace(&self.namespace)
  }
}

/// Solver output: a fully resolved ingredient set for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
  pub recipe_id: String,

  #[serde(default)]
  pub resolved_ingredients: Vec<ResolvedIngredient>,
}

impl Recipe {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }
}
