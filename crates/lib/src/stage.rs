//! Stage execution.
//!
//! A stage is one command run inside the environment. It either exits zero
//! and yields the next environment, or fails the whole build.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::environment::Environment;
use crate::error::{BuildError, PipelineStep};
use crate::util::hash::DigestBuilder;

/// A named command bound to a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
  name: String,
  step: PipelineStep,
  command: Vec<String>,
  workdir: String,
}

impl Stage {
  pub fn new(name: impl Into<String>, step: PipelineStep, command: Vec<String>, workdir: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      step,
      command,
      workdir: workdir.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn command(&self) -> &[String] {
    &self.command
  }

  pub fn workdir(&self) -> &str {
    &self.workdir
  }

  fn describe(&self) -> String {
    format!("run {} {}", self.workdir, self.command.join(" "))
  }
}

/// Timing of one completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
  pub name: String,
  pub duration: Duration,
  /// The engine reused a cached layer instead of running the command.
  pub cached: bool,
}

/// Run `stage` on top of `env`.
///
/// The returned environment carries a new layer whose digest chains the
/// command and working directory onto the previous layer.
pub async fn execute_stage<E: Engine>(
  engine: &E,
  env: Environment<E::Env>,
  stage: &Stage,
) -> Result<(Environment<E::Env>, StageReport), BuildError> {
  let started = Instant::now();
  info!(stage = %stage.name, command = ?stage.command, workdir = %stage.workdir, "stage started");

  let mut builder = DigestBuilder::chained(env.digest());
  let mut fields: Vec<&str> = vec!["run", stage.workdir.as_str()];
  fields.extend(stage.command.iter().map(String::as_str));
  builder.record(&fields);
  let digest = builder.finish();

  let (handle, lineage) = env.detach();
  let (handle, output) = engine
    .run(handle, &stage.command, &stage.workdir, &digest)
    .await
    .map_err(|source| BuildError::EngineCommunication {
      step: stage.step,
      source,
    })?;

  if !output.success() {
    error!(stage = %stage.name, code = ?output.code, "stage failed");
    return Err(BuildError::StageExecution {
      step: stage.step,
      stage: stage.name.clone(),
      code: output.code,
      output: output.output,
    });
  }

  let duration = started.elapsed();
  if output.cached {
    info!(stage = %stage.name, layer = %digest.short(), "stage reused from layer cache");
  } else {
    info!(
      stage = %stage.name,
      layer = %digest.short(),
      elapsed_ms = duration.as_millis() as u64,
      "stage finished"
    );
    debug!(stage = %stage.name, bytes = output.output.len(), "captured stage output");
  }

  let env = lineage.extend(handle, stage.describe(), digest);
  Ok((
    env,
    StageReport {
      name: stage.name.clone(),
      duration,
      cached: output.cached,
    },
  ))
}
