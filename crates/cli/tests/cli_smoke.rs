//! CLI smoke tests for frontbuild.
//!
//! Everything that actually builds runs on the host engine with `/bin/sh`
//! scripts standing in for yarn, so no container runtime is needed.

use std::path::Path;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the frontbuild binary, isolated from the caller's overrides.
fn frontbuild_cmd(cwd: &Path) -> Command {
  let mut cmd = cargo_bin_cmd!("frontbuild");
  cmd
    .current_dir(cwd)
    .env_remove("FRONTBUILD_SOURCE")
    .env_remove("FRONTBUILD_DEST")
    .env_remove("FRONTBUILD_ENGINE")
    .env_remove("FRONTBUILD_IMAGE")
    .env_remove("FRONTBUILD_LAYER_CACHE")
    .env_remove("RUST_LOG");
  cmd
}

fn write(path: &Path, content: &str) {
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, content).unwrap();
}

/// Host-engine config whose stages mimic `yarn install` and `yarn build`.
const HOST_CONFIG: &str = r#"
engine = "host"
install_command = [
  "/bin/sh", "-c",
  "test -f package.json && mkdir -p node_modules/dep && echo dep > node_modules/dep/index.js",
]
build_command = [
  "/bin/sh", "-c",
  "test -f node_modules/dep/index.js && test ! -e node_modules/stale.js && mkdir -p build && cat src/index.js > build/out.js",
]
"#;

/// `<temp>/tools` holds the config; the project sits at the default `../src`.
fn project() -> TempDir {
  let temp = TempDir::new().unwrap();
  write(&temp.path().join("tools/frontbuild.toml"), HOST_CONFIG);
  write(&temp.path().join("src/package.json"), "{\"name\":\"app\"}");
  write(&temp.path().join("src/yarn.lock"), "# yarn lockfile v1");
  write(&temp.path().join("src/src/index.js"), "console.log('hi')");
  write(&temp.path().join("src/node_modules/stale.js"), "stale");
  temp
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  let temp = TempDir::new().unwrap();
  frontbuild_cmd(temp.path())
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  let temp = TempDir::new().unwrap();
  frontbuild_cmd(temp.path())
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("frontbuild"));
}

// =============================================================================
// plan
// =============================================================================

#[test]
fn plan_shows_defaults() {
  let temp = TempDir::new().unwrap();

  frontbuild_cmd(temp.path())
    .arg("plan")
    .assert()
    .success()
    .stdout(predicate::str::contains("node:16"))
    .stdout(predicate::str::contains("yarn install --immutable"))
    .stdout(predicate::str::contains("/src/build"));
}

#[test]
fn plan_json_reflects_env_overrides() {
  let temp = TempDir::new().unwrap();

  let output = frontbuild_cmd(temp.path())
    .args(["plan", "--output", "json"])
    .env("FRONTBUILD_ENGINE", "host")
    .env("FRONTBUILD_IMAGE", "node:20")
    .output()
    .unwrap();

  assert!(output.status.success());
  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["engine"], "host");
  assert_eq!(json["base_image"], "node:20");
  assert_eq!(json["source_exclude"], serde_json::json!(["node_modules", ".yarn"]));
  assert_eq!(json["layer_cache"], true);
}

#[test]
fn missing_explicit_config_fails() {
  let temp = TempDir::new().unwrap();

  frontbuild_cmd(temp.path())
    .args(["--config", "nope.toml", "plan"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn unknown_config_key_fails() {
  let temp = TempDir::new().unwrap();
  write(&temp.path().join("frontbuild.toml"), "sources = \"../app\"\n");

  frontbuild_cmd(temp.path())
    .arg("plan")
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to load configuration"));
}

// =============================================================================
// build
// =============================================================================

#[cfg(unix)]
#[test]
fn bare_invocation_builds_into_embed() {
  let temp = project();

  frontbuild_cmd(&temp.path().join("tools"))
    .assert()
    .success()
    .stdout(predicate::str::contains("exported 1 file(s)"));

  let embed = temp.path().join("embed");
  assert_eq!(std::fs::read_to_string(embed.join("out.js")).unwrap(), "console.log('hi')");
  assert_eq!(std::fs::read_dir(&embed).unwrap().count(), 1);
  assert!(!embed.join("node_modules").exists());
}

#[cfg(unix)]
#[test]
fn rebuild_replaces_previous_output() {
  let temp = project();
  write(&temp.path().join("embed/old.js"), "old");

  frontbuild_cmd(&temp.path().join("tools")).arg("build").assert().success();

  assert!(!temp.path().join("embed/old.js").exists());
  assert!(temp.path().join("embed/out.js").exists());
}

#[cfg(unix)]
#[test]
fn failed_install_exits_non_zero_with_output() {
  let temp = project();
  std::fs::remove_file(temp.path().join("src/package.json")).unwrap();

  frontbuild_cmd(&temp.path().join("tools"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("stage `install` failed with exit code 1"))
    .stderr(predicate::str::contains("step=install"));

  assert!(!temp.path().join("embed").exists());
}

#[cfg(unix)]
#[test]
fn build_json_report_lists_stages() {
  let temp = project();

  let output = frontbuild_cmd(&temp.path().join("tools"))
    .args(["--output", "json"])
    .output()
    .unwrap();

  assert!(output.status.success());
  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["files_exported"], 1);
  assert_eq!(json["stages"][0]["name"], "install");
  assert_eq!(json["stages"][1]["name"], "build");
  assert_eq!(json["layers"].as_array().unwrap().len(), 5);
  assert_eq!(json["output_digest"].as_str().unwrap().len(), 64);
}

#[test]
fn destination_enclosing_the_source_is_refused() {
  let temp = project();

  frontbuild_cmd(&temp.path().join("tools"))
    .env("FRONTBUILD_DEST", "..")
    .assert()
    .failure()
    .stderr(predicate::str::contains("contains the source root"));

  assert!(temp.path().join("src/package.json").exists());
}

#[test]
fn missing_source_fails() {
  let temp = TempDir::new().unwrap();

  frontbuild_cmd(temp.path())
    .env("FRONTBUILD_ENGINE", "host")
    .env("FRONTBUILD_SOURCE", "does-not-exist")
    .env("FRONTBUILD_DEST", "out")
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed to project"));
}
