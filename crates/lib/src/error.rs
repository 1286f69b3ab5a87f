//! Pipeline error taxonomy.
//!
//! Every error is fatal: the pipeline never retries or continues past a
//! failure. Each variant identifies the step that failed so the caller can
//! report it without inspecting the cause.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

/// One step of the fixed build sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
  Resolve,
  Clean,
  Connect,
  Base,
  ProjectManifest,
  Install,
  ProjectSource,
  Build,
  Export,
}

impl PipelineStep {
  pub fn as_str(self) -> &'static str {
    match self {
      PipelineStep::Resolve => "resolve",
      PipelineStep::Clean => "clean",
      PipelineStep::Connect => "connect",
      PipelineStep::Base => "base",
      PipelineStep::ProjectManifest => "project-manifest",
      PipelineStep::Install => "install",
      PipelineStep::ProjectSource => "project-source",
      PipelineStep::Build => "build",
      PipelineStep::Export => "export",
    }
  }
}

impl fmt::Display for PipelineStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Terminal failure of a build.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A host path could not be made absolute.
  #[error("failed to resolve path {}: {source}", path.display())]
  PathResolution {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The destination could not be emptied before the run.
  #[error("failed to clean {}: {source}", path.display())]
  Cleanup {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// No session could be established with the execution engine.
  #[error("failed to connect to {engine} engine: {source}")]
  EngineConnection {
    engine: &'static str,
    #[source]
    source: EngineError,
  },

  /// Host files could not be selected for a projection.
  #[error("failed to project {} for {step}: {message}", root.display())]
  Projection {
    step: PipelineStep,
    root: PathBuf,
    message: String,
  },

  /// A stage command exited unsuccessfully.
  #[error("stage `{stage}` failed with {}", describe_code(*code))]
  StageExecution {
    step: PipelineStep,
    stage: String,
    code: Option<i32>,
    output: String,
  },

  /// The engine stopped responding mid-pipeline.
  #[error("engine error during {step}: {source}")]
  EngineCommunication {
    step: PipelineStep,
    #[source]
    source: EngineError,
  },

  /// The build output could not be materialized on the host.
  #[error("failed to export {path} to {}: {message}", destination.display())]
  Export {
    path: String,
    destination: PathBuf,
    message: String,
  },
}

impl BuildError {
  /// The step that produced this error.
  pub fn step(&self) -> PipelineStep {
    match self {
      BuildError::PathResolution { .. } => PipelineStep::Resolve,
      BuildError::Cleanup { .. } => PipelineStep::Clean,
      BuildError::EngineConnection { .. } => PipelineStep::Connect,
      BuildError::Projection { step, .. } => *step,
      BuildError::StageExecution { step, .. } => *step,
      BuildError::EngineCommunication { step, .. } => *step,
      BuildError::Export { .. } => PipelineStep::Export,
    }
  }

  /// Last `lines` lines of captured stage output, if this is a stage failure.
  pub fn output_tail(&self, lines: usize) -> Option<String> {
    let BuildError::StageExecution { output, .. } = self else {
      return None;
    };
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
  }
}

fn describe_code(code: Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {}", code),
    None => "no exit code (terminated by signal)".to_string(),
  }
}
