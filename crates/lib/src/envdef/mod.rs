//! Environment definitions shipped with artifacts.
//!
//! Each artifact contributes a fragment describing the environment variables
//! it needs. The installer merges the fragments of every installed artifact,
//! in dependency order, into one definition for the runtime.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::INSTALLDIR_PLACEHOLDER;

#[derive(Debug, Error)]
pub enum EnvDefError {
  #[error("failed to read environment definition {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse environment definition {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("cannot merge variable {name}: incompatible separator or inherit directives")]
  IncompatibleDirectives { name: String },

  #[error("cannot merge variable {name}: incompatible join directives")]
  IncompatibleJoin { name: String },

  #[error("cannot merge variable {name}: no join strategy for values {existing} and {incoming}")]
  ConflictingValues {
    name: String,
    existing: String,
    incoming: String,
  },
}

/// How values of the same variable from two definitions are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableJoin {
  #[default]
  Prepend,
  Append,
  /// Only identical values may be merged.
  Disallowed,
}

fn default_inherit() -> bool {
  true
}

fn default_separator() -> String {
  ":".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
  #[serde(rename = "env_name")]
  pub name: String,

  #[serde(default)]
  pub values: Vec<String>,

  #[serde(default)]
  pub join: VariableJoin,

  /// Whether the value inherited from the calling environment is kept.
  #[serde(default = "default_inherit")]
  pub inherit: bool,

  #[serde(default = "default_separator")]
  pub separator: String,
}

impl EnvironmentVariable {
  /// Merge `other` into this variable, following `other`'s join directive.
  pub fn merge(&self, other: &EnvironmentVariable) -> Result<EnvironmentVariable, EnvDefError> {
    if self.separator != other.separator || self.inherit != other.inherit {
      return Err(EnvDefError::IncompatibleDirectives {
        name: self.name.clone(),
      });
    }

    let disallowed = self.join == VariableJoin::Disallowed || other.join == VariableJoin::Disallowed;
    if disallowed && self.join != other.join {
      return Err(EnvDefError::IncompatibleJoin {
        name: self.name.clone(),
      });
    }

    let mut merged = self.clone();
    match other.join {
      VariableJoin::Prepend => {
        let values = other.values.iter().chain(&self.values).cloned().collect();
        merged.values = unique_values(values, true);
      }
      VariableJoin::Append => {
        let values = self.values.iter().chain(&other.values).cloned().collect();
        merged.values = unique_values(values, false);
      }
      VariableJoin::Disallowed => {
        if self.value_string() != other.value_string() {
          return Err(EnvDefError::ConflictingValues {
            name: self.name.clone(),
            existing: self.value_string(),
            incoming: other.value_string(),
          });
        }
      }
    }
    merged.join = other.join;

    Ok(merged)
  }

  /// Values joined with the variable's separator.
  pub fn value_string(&self) -> String {
    self.values.join(&self.separator)
  }
}

/// Deduplicate values, keeping either the first or the last occurrence.
fn unique_values(values: Vec<String>, keep_first: bool) -> Vec<String> {
  let mut seen = HashSet::new();
  if keep_first {
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
  } else {
    let mut kept: Vec<String> = values.into_iter().rev().filter(|v| seen.insert(v.clone())).collect();
    kept.reverse();
    kept
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
  #[serde(default)]
  pub env: Vec<EnvironmentVariable>,

  /// Directory the artifact's files were built into, relative to the artifact root.
  #[serde(default)]
  pub installdir: String,
}

impl EnvironmentDefinition {
  pub fn load(path: &Path) -> Result<Self, EnvDefError> {
    let content = std::fs::read_to_string(path).map_err(|source| EnvDefError::Read {
      path: path.display().to_string(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| EnvDefError::Parse {
      path: path.display().to_string(),
      source,
    })
  }

  pub fn get(&self, name: &str) -> Option<&EnvironmentVariable> {
    self.env.iter().find(|v| v.name == name)
  }

  /// Merge `other` into this definition.
  ///
  /// Variables present in both are merged with [`EnvironmentVariable::merge`].
  /// Variables only in `other` are appended in their original order.
  pub fn merge(&self, other: &EnvironmentDefinition) -> Result<EnvironmentDefinition, EnvDefError> {
    let mut env = Vec::with_capacity(self.env.len() + other.env.len());

    for var in &self.env {
      match other.get(&var.name) {
        Some(incoming) => env.push(var.merge(incoming)?),
        None => env.push(var.clone()),
      }
    }
    for var in &other.env {
      if self.get(&var.name).is_none() {
        env.push(var.clone());
      }
    }

    Ok(EnvironmentDefinition {
      env,
      installdir: self.installdir.clone(),
    })
  }

  /// Replace every `${INSTALLDIR}` in variable values with `install_dir`.
  pub fn expand_install_dir(&self, install_dir: &Path) -> EnvironmentDefinition {
    let replacement = install_dir.display().to_string();
    let mut expanded = self.clone();
    for var in &mut expanded.env {
      for value in &mut var.values {
        *value = value.replace(INSTALLDIR_PLACEHOLDER, &replacement);
      }
    }
    expanded
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn var(name: &str, values: &[&str], join: VariableJoin) -> EnvironmentVariable {
    EnvironmentVariable {
      name: name.to_string(),
      values: values.iter().map(|v| v.to_string()).collect(),
      join,
      inherit: true,
      separator: ":".to_string(),
    }
  }

  #[test]
  fn defaults_when_parsing() {
    let def: EnvironmentDefinition =
      serde_json::from_str(r#"{"env": [{"env_name": "PATH", "values": ["${INSTALLDIR}/bin"]}], "installdir": "usr"}"#)
        .unwrap();
    let path = &def.env[0];

    assert_eq!(path.join, VariableJoin::Prepend);
    assert!(path.inherit);
    assert_eq!(path.separator, ":");
    assert_eq!(def.installdir, "usr");
  }

  #[test]
  fn prepend_keeps_first_occurrence() {
    let existing = var("PATH", &["/a", "/b"], VariableJoin::Prepend);
    let incoming = var("PATH", &["/c", "/a"], VariableJoin::Prepend);
    let merged = existing.merge(&incoming).unwrap();
    assert_eq!(merged.values, vec!["/c", "/a", "/b"]);
  }

  #[test]
  fn append_keeps_last_occurrence() {
    let existing = var("PATH", &["/a", "/b"], VariableJoin::Append);
    let incoming = var("PATH", &["/a", "/c"], VariableJoin::Append);
    let merged = existing.merge(&incoming).unwrap();
    assert_eq!(merged.values, vec!["/b", "/a", "/c"]);
  }

  #[test]
  fn disallowed_requires_identical_values() {
    let existing = var("PYTHONHOME", &["/x"], VariableJoin::Disallowed);
    assert!(existing.merge(&var("PYTHONHOME", &["/x"], VariableJoin::Disallowed)).is_ok());

    let err = existing
      .merge(&var("PYTHONHOME", &["/y"], VariableJoin::Disallowed))
      .unwrap_err();
    assert!(matches!(err, EnvDefError::ConflictingValues { .. }));

    let err = existing.merge(&var("PYTHONHOME", &["/x"], VariableJoin::Append)).unwrap_err();
    assert!(matches!(err, EnvDefError::IncompatibleJoin { .. }));
  }

  #[test]
  fn mismatched_separator_is_rejected() {
    let existing = var("PATH", &["/a"], VariableJoin::Prepend);
    let mut incoming = var("PATH", &["/b"], VariableJoin::Prepend);
    incoming.separator = ";".to_string();
    assert!(matches!(
      existing.merge(&incoming),
      Err(EnvDefError::IncompatibleDirectives { .. })
    ));
  }

  #[test]
  fn merge_definitions() {
    let base = EnvironmentDefinition {
      env: vec![var("PATH", &["/a"], VariableJoin::Prepend), var("LANG", &["C"], VariableJoin::Disallowed)],
      installdir: String::new(),
    };
    let other = EnvironmentDefinition {
      env: vec![var("PATH", &["/b"], VariableJoin::Prepend), var("PERL5LIB", &["/p"], VariableJoin::Append)],
      installdir: String::new(),
    };

    let merged = base.merge(&other).unwrap();
    let names: Vec<&str> = merged.env.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["PATH", "LANG", "PERL5LIB"]);
    assert_eq!(merged.get("PATH").unwrap().value_string(), "/b:/a");
  }

  #[test]
  fn expands_install_dir() {
    let def = EnvironmentDefinition {
      env: vec![var("PATH", &["${INSTALLDIR}/bin", "/usr/bin"], VariableJoin::Prepend)],
      installdir: String::new(),
    };
    let expanded = def.expand_install_dir(Path::new("/opt/rt"));
    assert_eq!(expanded.env[0].values, vec!["/opt/rt/bin", "/usr/bin"]);
  }

  #[test]
  fn load_reports_path_on_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.json");
    std::fs::write(&path, "not json").unwrap();

    let err = EnvironmentDefinition::load(&path).unwrap_err();
    assert!(err.to_string().contains("runtime.json"));
  }
}
