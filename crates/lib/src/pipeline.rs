//! Pipeline composition.
//!
//! The build is a fixed sequence:
//!
//! ```text
//! resolve -> clean -> connect -> base -> project manifest -> install
//!         -> project source -> build -> export -> release
//! ```
//!
//! Each step consumes the environment produced by the previous one, so steps
//! cannot be reordered or skipped. The first failure ends the run; the engine
//! session is released regardless.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{Instrument, info, info_span};

use crate::clean::clean_destination;
use crate::config::{BuildConfig, BuildPlan, ConfigError};
use crate::engine::{Connector, DockerConnector, Engine, EngineKind, HostConnector};
use crate::environment::{Environment, Layer};
use crate::error::{BuildError, PipelineStep};
use crate::export::{ExportSummary, export_artifact};
use crate::lifecycle::with_session;
use crate::paths::BuildRequest;
use crate::projection::project_into;
use crate::stage::{StageReport, execute_stage};
use crate::util::hash::ContentHash;

/// Summary of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
  pub engine: String,
  pub destination: PathBuf,
  pub files_exported: usize,
  /// Digest of the exported tree; equal across byte-identical runs.
  pub output_digest: ContentHash,
  /// Layer chain of the final environment, base first.
  pub layers: Vec<Layer>,
  pub stages: Vec<StageReport>,
  pub elapsed: Duration,
}

/// A validated configuration and the plan derived from it.
#[derive(Debug, Clone)]
pub struct Pipeline {
  config: BuildConfig,
  plan: BuildPlan,
}

impl Pipeline {
  pub fn new(config: BuildConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    let plan = config.plan()?;
    Ok(Self { config, plan })
  }

  pub fn config(&self) -> &BuildConfig {
    &self.config
  }

  pub fn plan(&self) -> &BuildPlan {
    &self.plan
  }

  /// Run on the engine selected by the configuration.
  pub async fn run(&self) -> Result<BuildReport, BuildError> {
    match self.config.engine {
      EngineKind::Docker => {
        let connector = DockerConnector::new().with_layer_cache(self.config.layer_cache);
        self.run_with(&connector).await
      }
      EngineKind::Host => self.run_with(&HostConnector::new()).await,
    }
  }

  /// Run on the engine `connector` opens.
  pub async fn run_with<C: Connector>(&self, connector: &C) -> Result<BuildReport, BuildError> {
    let span = info_span!("pipeline", name = %self.config.pipeline_name);
    async {
      let started = Instant::now();
      let request = BuildRequest::resolve(&self.config.source_root, &self.config.destination_root)?;
      info!(
        source = %request.source_root().display(),
        destination = %request.destination_root().display(),
        engine = connector.name(),
        "pipeline started"
      );

      clean_destination(&request).await?;

      let (export, layers, stages) =
        with_session(connector, async |engine| compose(engine, &request, &self.plan).await).await?;

      let elapsed = started.elapsed();
      info!(
        files = export.files,
        output = %export.digest.short(),
        elapsed_ms = elapsed.as_millis() as u64,
        "pipeline finished"
      );

      Ok(BuildReport {
        engine: connector.name().to_string(),
        destination: request.destination_root().to_path_buf(),
        files_exported: export.files,
        output_digest: export.digest,
        layers,
        stages,
        elapsed,
      })
    }
    .instrument(span)
    .await
  }
}

/// Drive one engine session through the fixed build sequence.
async fn compose<E: Engine>(
  engine: &E,
  request: &BuildRequest,
  plan: &BuildPlan,
) -> Result<(ExportSummary, Vec<Layer>, Vec<StageReport>), BuildError> {
  let handle = engine
    .base(&plan.base_image)
    .await
    .map_err(|source| BuildError::EngineCommunication {
      step: PipelineStep::Base,
      source,
    })?;
  let env = Environment::base(handle, &plan.base_image);
  info!(image = %plan.base_image, layer = %env.digest().short(), "base environment ready");

  let env = project_into(
    engine,
    env,
    request.source_root(),
    &plan.manifest,
    PipelineStep::ProjectManifest,
  )
  .await?;
  let (env, install) = execute_stage(engine, env, &plan.install).await?;

  let env = project_into(
    engine,
    env,
    request.source_root(),
    &plan.source,
    PipelineStep::ProjectSource,
  )
  .await?;
  let (env, build) = execute_stage(engine, env, &plan.build).await?;

  let export = export_artifact(engine, &env, &plan.output_path, request.destination_root()).await?;

  Ok((export, env.layers().to_vec(), vec![install, build]))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::ExecOutput;
  use crate::engine::memory::{MemoryConnector, MemoryFs, MemoryOp};
  use crate::util::testutil::{list_files, write_tree};
  use tempfile::TempDir;

  fn ok() -> ExecOutput {
    ExecOutput::exited(0, "")
  }

  fn fail(output: &str) -> ExecOutput {
    ExecOutput::exited(1, output)
  }

  /// Stand-in for yarn: install needs a manifest, build bundles `src/index.js`.
  fn yarn() -> MemoryConnector {
    MemoryConnector::new()
      .on_command(&["yarn", "install", "--immutable"], |fs, workdir| {
        if !fs.exists(&MemoryFs::join(workdir, "package.json")) {
          return fail("Usage Error: The nearest package directory doesn't seem to be part of the project\n");
        }
        fs.write(&MemoryFs::join(workdir, "node_modules/react/index.js"), "react");
        ok()
      })
      .on_command(&["yarn", "build"], |fs, workdir| {
        if fs.exists(&MemoryFs::join(workdir, "node_modules/host-only.js")) {
          return fail("host node_modules leaked into the build\n");
        }
        if !fs.exists(&MemoryFs::join(workdir, "node_modules/react/index.js")) {
          return fail("Cannot find module 'react'\n");
        }
        let Some(entry) = fs.read_to_string(&MemoryFs::join(workdir, "src/index.js")) else {
          return fail("Module not found: ./src/index.js\n");
        };
        fs.write(&MemoryFs::join(workdir, "build/out.js"), format!("/* bundled */{}", entry));
        ok()
      })
  }

  struct Project {
    _temp: TempDir,
    source: PathBuf,
    dest: PathBuf,
  }

  fn scenario() -> Project {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    write_tree(
      &source,
      &[
        ("package.json", "{\"name\":\"app\"}"),
        ("yarn.lock", "# yarn lockfile v1"),
        ("src/index.js", "console.log('hi')"),
      ],
    );
    let dest = temp.path().join("embed");
    Project {
      _temp: temp,
      source,
      dest,
    }
  }

  fn pipeline(project: &Project) -> Pipeline {
    pipeline_with(project, |_| {})
  }

  fn pipeline_with(project: &Project, tweak: impl FnOnce(&mut BuildConfig)) -> Pipeline {
    let mut config = BuildConfig {
      source_root: project.source.clone(),
      destination_root: project.dest.clone(),
      ..BuildConfig::default()
    };
    tweak(&mut config);
    Pipeline::new(config).unwrap()
  }

  #[tokio::test]
  async fn scenario_exports_exactly_the_bundle() {
    let project = scenario();
    let connector = yarn();

    let report = pipeline(&project).run_with(&connector).await.unwrap();

    assert_eq!(list_files(&project.dest), vec!["out.js"]);
    assert_eq!(
      std::fs::read_to_string(project.dest.join("out.js")).unwrap(),
      "/* bundled */console.log('hi')"
    );
    assert_eq!(report.files_exported, 1);
    assert_eq!(report.engine, "memory");
    assert_eq!(report.layers.len(), 5);
    let stage_names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(stage_names, vec!["install", "build"]);
    assert_eq!(connector.releases(), 1);
  }

  #[tokio::test]
  async fn steps_run_in_fixed_order() {
    let project = scenario();
    let connector = yarn();

    pipeline(&project).run_with(&connector).await.unwrap();

    let journal = connector.journal();
    assert_eq!(journal[0], "connect");
    assert_eq!(journal[1], "base node:16");
    assert_eq!(journal[2], "project /src [package.json, yarn.lock]");
    assert_eq!(journal[3], "run /src yarn install --immutable");
    assert_eq!(journal[4], "project /src [package.json, src/index.js, yarn.lock]");
    assert_eq!(journal[5], "run /src yarn build");
    assert!(journal[6].starts_with("export /src/build "));
    assert_eq!(journal[7], "release");
    assert_eq!(journal.len(), 8);
  }

  #[tokio::test]
  async fn failed_install_skips_build_and_leaves_no_output() {
    let project = scenario();
    write_tree(&project.dest, &[("stale.js", "old")]);
    let connector = yarn().on_command(&["yarn", "install", "--immutable"], |_, _| {
      fail("YN0028: The lockfile would have been modified by this install, which is explicitly forbidden.\n")
    });

    let err = pipeline(&project).run_with(&connector).await.unwrap_err();

    assert_eq!(err.step(), PipelineStep::Install);
    assert!(err.output_tail(1).unwrap().contains("YN0028"));
    assert!(!connector.ran("run /src yarn build"));
    assert!(!connector.ran("export"));
    assert!(!project.dest.exists());
    assert_eq!(connector.releases(), 1);
  }

  #[tokio::test]
  async fn unmatched_manifest_patterns_still_run_install() {
    let project = scenario();
    let connector = yarn();
    let pipeline = pipeline_with(&project, |c| c.manifest_include = vec!["Cargo.toml".into()]);

    let err = pipeline.run_with(&connector).await.unwrap_err();

    assert!(connector.ran("project /src []"));
    assert!(connector.ran("run /src yarn install --immutable"));
    assert!(matches!(
      err,
      BuildError::StageExecution {
        step: PipelineStep::Install,
        code: Some(1),
        ..
      }
    ));
  }

  #[tokio::test]
  async fn stale_destination_is_replaced() {
    let project = scenario();
    write_tree(&project.dest, &[("old.js", "old"), ("assets/logo.svg", "<svg/>")]);

    pipeline(&project).run_with(&yarn()).await.unwrap();

    assert_eq!(list_files(&project.dest), vec!["out.js"]);
  }

  #[tokio::test]
  async fn reruns_are_byte_identical() {
    let project = scenario();
    let pipeline = pipeline(&project);

    let first = pipeline.run_with(&yarn()).await.unwrap();
    let second = pipeline.run_with(&yarn()).await.unwrap();

    assert_eq!(first.output_digest, second.output_digest);
    assert_eq!(first.layers, second.layers);
  }

  #[tokio::test]
  async fn host_install_output_never_reaches_the_build() {
    let project = scenario();
    write_tree(
      &project.source,
      &[("node_modules/host-only.js", "stale"), (".yarn/cache/pkg.zip", "zip")],
    );
    let connector = yarn();

    pipeline(&project).run_with(&connector).await.unwrap();

    let source_projection = connector
      .journal()
      .into_iter()
      .filter(|entry| entry.starts_with("project"))
      .nth(1)
      .unwrap();
    assert!(!source_projection.contains("node_modules"));
    assert!(!source_projection.contains(".yarn"));
    assert_eq!(list_files(&project.dest), vec!["out.js"]);
  }

  #[tokio::test]
  async fn manifest_change_changes_every_later_layer() {
    let project = scenario();
    let pipeline = pipeline(&project);
    let before = pipeline.run_with(&yarn()).await.unwrap();

    std::fs::write(project.source.join("yarn.lock"), "# bumped").unwrap();
    let after = pipeline.run_with(&yarn()).await.unwrap();

    assert_eq!(before.layers[0], after.layers[0]);
    for (old, new) in before.layers.iter().zip(&after.layers).skip(1) {
      assert_ne!(old.digest, new.digest);
    }
  }

  #[tokio::test]
  async fn source_change_keeps_install_layers() {
    let project = scenario();
    let pipeline = pipeline(&project);
    let before = pipeline.run_with(&yarn()).await.unwrap();

    std::fs::write(project.source.join("src/index.js"), "console.log('bye')").unwrap();
    let after = pipeline.run_with(&yarn()).await.unwrap();

    assert_eq!(before.layers[..3], after.layers[..3]);
    assert_ne!(before.layers[3], after.layers[3]);
  }

  #[tokio::test]
  async fn connection_failure_touches_nothing_in_the_engine() {
    let project = scenario();
    let connector = yarn().fail_on(MemoryOp::Connect);

    let err = pipeline(&project).run_with(&connector).await.unwrap_err();

    assert_eq!(err.step(), PipelineStep::Connect);
    assert_eq!(connector.journal(), vec!["connect"]);
    assert_eq!(connector.releases(), 0);
  }

  #[tokio::test]
  async fn missing_source_root_is_a_projection_error() {
    let project = scenario();
    let connector = yarn();
    let pipeline = pipeline_with(&project, |c| c.source_root = project.source.join("missing"));

    let err = pipeline.run_with(&connector).await.unwrap_err();

    assert!(matches!(
      err,
      BuildError::Projection {
        step: PipelineStep::ProjectManifest,
        ..
      }
    ));
    assert_eq!(connector.releases(), 1);
  }

  #[tokio::test]
  async fn invalid_pattern_is_a_projection_error() {
    let project = scenario();
    let pipeline = pipeline_with(&project, |c| c.source_exclude = vec!["../secrets".into()]);

    let err = pipeline.run_with(&yarn()).await.unwrap_err();

    assert_eq!(err.step(), PipelineStep::ProjectSource);
  }

  #[tokio::test]
  async fn missing_build_output_is_an_export_error() {
    let project = scenario();
    let connector = yarn();
    let pipeline = pipeline_with(&project, |c| c.output_dir = "dist".into());

    let err = pipeline.run_with(&connector).await.unwrap_err();

    assert!(matches!(err, BuildError::Export { ref path, .. } if path == "/src/dist"));
    assert!(!project.dest.exists());
    assert_eq!(connector.releases(), 1);
  }

  #[tokio::test]
  async fn engine_loss_mid_run_is_a_communication_error() {
    let project = scenario();
    let connector = yarn().fail_on(MemoryOp::Project);

    let err = pipeline(&project).run_with(&connector).await.unwrap_err();

    assert!(matches!(
      err,
      BuildError::EngineCommunication {
        step: PipelineStep::ProjectManifest,
        ..
      }
    ));
    assert!(!connector.ran("run"));
    assert_eq!(connector.releases(), 1);
  }

  #[tokio::test]
  async fn unchanged_manifest_reuses_the_install_layer() {
    let project = scenario();
    let pipeline = pipeline(&project);
    let connector = yarn().with_layer_cache();
    let first = pipeline.run_with(&connector).await.unwrap();

    std::fs::write(project.source.join("src/index.js"), "console.log('bye')").unwrap();
    let second = pipeline.run_with(&connector).await.unwrap();

    assert!(!first.stages[0].cached);
    assert!(second.stages[0].cached);
    assert!(!second.stages[1].cached);
    assert!(connector.ran("cached run /src yarn install --immutable"));
    assert_eq!(connector.commands_run(), 3);
    assert_eq!(
      std::fs::read_to_string(project.dest.join("out.js")).unwrap(),
      "/* bundled */console.log('bye')"
    );
    assert_ne!(first.output_digest, second.output_digest);
  }

  #[tokio::test]
  async fn lockfile_change_reruns_the_install() {
    let project = scenario();
    let pipeline = pipeline(&project);
    let connector = yarn().with_layer_cache();
    pipeline.run_with(&connector).await.unwrap();

    std::fs::write(project.source.join("yarn.lock"), "# bumped").unwrap();
    let second = pipeline.run_with(&connector).await.unwrap();

    assert!(!second.stages[0].cached);
    assert_eq!(connector.commands_run(), 4);
  }

  #[tokio::test]
  async fn destination_enclosing_the_source_is_never_cleaned() {
    let project = scenario();
    let connector = yarn();
    let parent = project.source.parent().unwrap().to_path_buf();
    let pipeline = pipeline_with(&project, |c| c.destination_root = parent);

    let err = pipeline.run_with(&connector).await.unwrap_err();

    assert_eq!(err.step(), PipelineStep::Clean);
    assert!(project.source.join("package.json").exists());
    assert!(connector.journal().is_empty());
  }

  #[cfg(unix)]
  mod host {
    use super::*;
    use crate::util::testutil::shell_cmd;
    use std::path::Path;

    fn host_pipeline(project: &Project, sandboxes: &Path) -> (Pipeline, HostConnector) {
      let pipeline = pipeline_with(project, |c| {
        c.engine = EngineKind::Host;
        c.install_command =
          shell_cmd("test -f package.json && mkdir -p node_modules/dep && echo dep > node_modules/dep/index.js");
        c.build_command = shell_cmd(
          "test ! -e node_modules/host-only.js && test -f node_modules/dep/index.js \
           && mkdir -p build && cat src/index.js > build/out.js",
        );
      });
      (pipeline, HostConnector::with_sandbox_parent(sandboxes))
    }

    #[tokio::test]
    async fn scenario_runs_in_a_host_sandbox() {
      let project = scenario();
      write_tree(&project.source, &[("node_modules/host-only.js", "stale")]);
      let sandboxes = project.source.parent().unwrap().join("sandboxes");
      let (pipeline, connector) = host_pipeline(&project, &sandboxes);

      let report = pipeline.run_with(&connector).await.unwrap();

      assert_eq!(report.engine, "host");
      assert_eq!(list_files(&project.dest), vec!["out.js"]);
      assert_eq!(
        std::fs::read_to_string(project.dest.join("out.js")).unwrap(),
        "console.log('hi')"
      );
      assert!(project.source.join("node_modules/host-only.js").exists());
      assert_eq!(std::fs::read_dir(&sandboxes).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn host_sandbox_is_removed_after_failure() {
      let project = scenario();
      std::fs::remove_file(project.source.join("package.json")).unwrap();
      let sandboxes = project.source.parent().unwrap().join("sandboxes");
      let (pipeline, connector) = host_pipeline(&project, &sandboxes);

      let err = pipeline.run_with(&connector).await.unwrap_err();

      assert_eq!(err.step(), PipelineStep::Install);
      assert!(!project.dest.exists());
      assert_eq!(std::fs::read_dir(&sandboxes).unwrap().count(), 0);
    }
  }

  #[cfg(unix)]
  mod docker {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A `docker` stand-in that keeps tags and ids as files next to itself and
    /// logs every invocation. Started containers "build" by writing `out.js`.
    const FAKE_DOCKER: &str = r#"#!/bin/sh
state="$(dirname "$0")"
echo "$*" >> "$state/calls.log"
next_id() {
  n=$(($(cat "$state/ids" 2>/dev/null || echo 0) + 1))
  echo "$n" > "$state/ids"
  echo "$n"
}
case "$1" in
  version) echo "24.0.7" ;;
  image)
    ref="$5"
    if [ "$ref" = "node:16" ]; then echo "sha256:base"; exit 0; fi
    key=$(echo "$ref" | tr ':/' '__')
    if [ -f "$state/tags/$key" ]; then cat "$state/tags/$key"; exit 0; fi
    echo "Error response from daemon: No such image: $ref" >&2
    exit 1 ;;
  create) echo "container$(next_id)" ;;
  commit) echo "sha256:layer$(next_id)" ;;
  tag)
    mkdir -p "$state/tags"
    echo "$2" > "$state/tags/$(echo "$3" | tr ':/' '__')" ;;
  cp)
    case "$2" in
      *:*) mkdir -p "$3" && echo "bundle" > "$3/out.js" ;;
    esac ;;
  start) echo "ran $3" ;;
esac
"#;

    fn fake_docker(dir: &Path) -> String {
      std::fs::create_dir_all(dir).unwrap();
      let program = dir.join("docker");
      std::fs::write(&program, FAKE_DOCKER).unwrap();
      std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
      program.display().to_string()
    }

    fn calls(dir: &Path, command: &str) -> usize {
      std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .filter(|line| line.split_whitespace().next() == Some(command))
        .count()
    }

    #[tokio::test]
    async fn unchanged_manifest_skips_the_install_container() {
      let project = scenario();
      let state = project.source.parent().unwrap().join("docker");
      let connector = DockerConnector::with_program(fake_docker(&state)).with_layer_cache(true);
      let pipeline = pipeline(&project);

      let first = pipeline.run_with(&connector).await.unwrap();
      assert_eq!(calls(&state, "start"), 2);

      std::fs::write(project.source.join("src/index.js"), "console.log('bye')").unwrap();
      let second = pipeline.run_with(&connector).await.unwrap();

      assert_eq!(calls(&state, "start"), 3);
      assert!(!first.stages[0].cached);
      assert!(second.stages[0].cached);
      assert!(!second.stages[1].cached);
      assert_eq!(calls(&state, "rmi"), 0);
      assert_eq!(list_files(&project.dest), vec!["out.js"]);
    }

    #[tokio::test]
    async fn disabled_cache_runs_everything_and_removes_its_images() {
      let project = scenario();
      let state = project.source.parent().unwrap().join("docker");
      let connector = DockerConnector::with_program(fake_docker(&state)).with_layer_cache(false);
      let pipeline = pipeline(&project);

      pipeline.run_with(&connector).await.unwrap();
      pipeline.run_with(&connector).await.unwrap();

      assert_eq!(calls(&state, "start"), 4);
      assert_eq!(calls(&state, "tag"), 0);
      assert_eq!(calls(&state, "rmi"), 8);
    }
  }
}

