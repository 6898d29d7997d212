//! CLI smoke tests for rtsetup.
//!
//! These tests drive every command against recipes and recorded builds
//! written to temporary directories.

use std::fs::File;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use flate2::Compression;
use flate2::write::GzEncoder;
use predicates::prelude::*;
use tempfile::TempDir;

fn rtsetup_cmd() -> Command {
  cargo_bin_cmd!("rtsetup")
}

const RECIPE: &str = r#"{
  "recipe_id": "recipe-1",
  "resolved_ingredients": [
    {
      "namespace": "builder",
      "name": "builder",
      "version": "1.0",
      "ingredient_version_id": "v-builder"
    },
    {
      "namespace": "language",
      "name": "python",
      "version": "3.10.4",
      "ingredient_version_id": "v-python",
      "artifact_id": "a-python",
      "dependencies": [
        { "ingredient_version_id": "v-builder", "dependency_types": ["build"] },
        { "ingredient_version_id": "v-zlib", "dependency_types": ["build", "runtime"] }
      ],
      "resolved_requirements": ["python"]
    },
    {
      "namespace": "language",
      "name": "zlib",
      "version": "1.2.13",
      "ingredient_version_id": "v-zlib",
      "artifact_id": "a-zlib",
      "dependencies": [
        { "ingredient_version_id": "v-builder", "dependency_types": ["build"] }
      ]
    }
  ]
}"#;

/// Isolated test environment with a recipe and artifact archives.
struct TestEnv {
  temp: TempDir,
}

impl TestEnv {
  fn new() -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("recipe.json"), RECIPE).unwrap();
    Self { temp }
  }

  fn path(&self, name: &str) -> PathBuf {
    self.temp.path().join(name)
  }

  fn install_dir(&self) -> PathBuf {
    self.path("runtime")
  }

  /// Write an artifact archive and return its `file://` URI.
  fn archive(&self, name: &str) -> String {
    let runtime_json = format!(
      r#"{{"env":[{{"env_name":"PATH","values":["${{INSTALLDIR}}/{name}/bin"]}}],"installdir":"installdir"}}"#
    );
    let tool = format!("installdir/{name}/bin/{name}");
    write_tarball(
      &self.path(&format!("{name}.tar.gz")),
      &[("runtime.json", runtime_json.as_str()), (tool.as_str(), "#!/bin/sh\n")],
    );
    format!("file://{}", self.path(&format!("{name}.tar.gz")).display())
  }

  fn install(&self) -> Command {
    let mut cmd = rtsetup_cmd();
    cmd
      .arg("install")
      .arg("--recipe")
      .arg(self.path("recipe.json"))
      .arg("--dir")
      .arg(self.install_dir())
      .arg("--commit")
      .arg("commit-1")
      .arg("--cache-dir")
      .arg(self.path("cache"));
    cmd
  }
}

fn write_tarball(path: &Path, files: &[(&str, &str)]) {
  let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (file, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, file, content.as_bytes()).unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap();
}

#[test]
fn help_lists_commands() {
  rtsetup_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("resolve"))
    .stdout(predicate::str::contains("install"));
}

#[test]
fn resolve_prints_build_tree() {
  let env = TestEnv::new();

  rtsetup_cmd()
    .arg("resolve")
    .arg(env.path("recipe.json"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Build of language/python 3.10.4 r0"))
    .stdout(predicate::str::contains("Recipe recipe-1 is valid"));
}

#[test]
fn resolve_json_lists_dependencies_first() {
  let env = TestEnv::new();

  let output = rtsetup_cmd()
    .arg("resolve")
    .arg("--json")
    .arg(env.path("recipe.json"))
    .output()
    .unwrap();
  assert!(output.status.success());

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let ids: Vec<&str> = json["artifacts"]
    .as_array()
    .unwrap()
    .iter()
    .map(|a| a["artifact_id"].as_str().unwrap())
    .collect();
  assert_eq!(ids, vec!["a-zlib", "a-python"]);
}

#[test]
fn resolve_rejects_missing_dependency() {
  let env = TestEnv::new();
  let broken = serde_json::json!({
    "recipe_id": "recipe-2",
    "resolved_ingredients": [{
      "namespace": "language",
      "name": "python",
      "version": "3.10.4",
      "ingredient_version_id": "v-python",
      "artifact_id": "a-python",
      "dependencies": [{ "ingredient_version_id": "v-missing", "dependency_types": ["build"] }]
    }]
  });
  std::fs::write(env.path("broken.json"), broken.to_string()).unwrap();

  rtsetup_cmd()
    .arg("resolve")
    .arg(env.path("broken.json"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid recipe"));
}

#[test]
fn diff_reports_updates() {
  let env = TestEnv::new();
  let newer = RECIPE
    .replace("\"version\": \"3.10.4\"", "\"version\": \"3.11.0\"")
    .replace("\"artifact_id\": \"a-python\"", "\"artifact_id\": \"a-python-2\"");
  std::fs::write(env.path("newer.json"), newer).unwrap();

  rtsetup_cmd()
    .arg("diff")
    .arg(env.path("recipe.json"))
    .arg(env.path("newer.json"))
    .assert()
    .success()
    .stdout(predicate::str::contains("python@3.10.4"))
    .stdout(predicate::str::contains("3.11.0"));
}

#[test]
fn diff_of_identical_recipes_is_empty() {
  let env = TestEnv::new();

  rtsetup_cmd()
    .arg("diff")
    .arg(env.path("recipe.json"))
    .arg(env.path("recipe.json"))
    .assert()
    .success()
    .stdout(predicate::str::contains("No changes."));
}

#[test]
fn status_of_empty_dir() {
  let env = TestEnv::new();

  rtsetup_cmd()
    .arg("status")
    .arg(env.install_dir())
    .arg("commit-1")
    .assert()
    .success()
    .stdout(predicate::str::contains("No runtime installed"));
}

#[test]
fn install_from_download_list() {
  let env = TestEnv::new();
  let downloads = serde_json::json!([
    { "artifact_id": "a-zlib", "download_uri": env.archive("zlib") },
    { "artifact_id": "a-python", "download_uri": env.archive("python") },
  ]);
  std::fs::write(env.path("downloads.json"), downloads.to_string()).unwrap();

  env
    .install()
    .arg("--downloads")
    .arg(env.path("downloads.json"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Runtime installed"));
  assert!(env.install_dir().join("python/bin/python").exists());

  rtsetup_cmd()
    .arg("status")
    .arg(env.install_dir())
    .arg("commit-1")
    .assert()
    .success()
    .stdout(predicate::str::contains("is installed"));

  env
    .install()
    .arg("--downloads")
    .arg(env.path("downloads.json"))
    .assert()
    .success()
    .stdout(predicate::str::contains("already installed"));
}

#[test]
fn install_from_recorded_build_log() {
  let env = TestEnv::new();
  let zlib = env.archive("zlib");
  let python = env.archive("python");
  let events = [
    serde_json::json!({ "type": "build_started" }),
    serde_json::json!({ "type": "artifact_started", "artifact_id": "a-zlib", "cache_hit": true }),
    serde_json::json!({ "type": "artifact_succeeded", "artifact_id": "a-zlib", "uri": zlib }),
    serde_json::json!({ "type": "artifact_started", "artifact_id": "a-python", "cache_hit": false }),
    serde_json::json!({ "type": "artifact_succeeded", "artifact_id": "a-python", "uri": python }),
    serde_json::json!({ "type": "build_succeeded" }),
  ];
  let lines: Vec<String> = events.iter().map(|e| e.to_string()).collect();
  std::fs::write(env.path("events.jsonl"), lines.join("\n")).unwrap();

  env
    .install()
    .arg("--events")
    .arg(env.path("events.jsonl"))
    .arg("--build-log")
    .arg(env.path("build.log"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Artifacts installed: 2"));

  let log = std::fs::read_to_string(env.path("build.log")).unwrap();
  assert!(log.contains("python (a-python): Artifact Build Succeeded"));
}

#[test]
fn failed_build_exits_with_build_failed_code() {
  let env = TestEnv::new();
  let events = [
    serde_json::json!({ "type": "build_started" }),
    serde_json::json!({ "type": "artifact_failed", "artifact_id": "a-zlib", "error_message": "configure failed" }),
    serde_json::json!({ "type": "build_failed", "error_message": "1 artifact failed" }),
  ];
  let lines: Vec<String> = events.iter().map(|e| e.to_string()).collect();
  std::fs::write(env.path("events.jsonl"), lines.join("\n")).unwrap();

  env
    .install()
    .arg("--events")
    .arg(env.path("events.jsonl"))
    .assert()
    .code(3)
    .stderr(predicate::str::contains("build failed"));
}

#[test]
fn install_requires_a_recorded_build() {
  let env = TestEnv::new();

  env.install().assert().failure();
}
