//! Execution engine capability interface.
//!
//! The pipeline only ever talks to an engine through these traits, so the
//! orchestration logic is identical whether commands run in Docker, in a
//! host sandbox, or in the in-memory engine used by tests.
//!
//! Environment handles are passed by value: every operation consumes the
//! previous handle and returns the next one, which keeps stale handles from
//! being reused after a later layer was added.
//!
//! Layer-adding operations receive the content digest of the layer they are
//! asked to produce. An engine with a persistent layer cache may answer from
//! the cache instead of doing the work again.

pub mod docker;
pub mod fs;
pub mod host;
pub mod memory;
pub mod process;

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projection::Projection;
use crate::util::hash::ContentHash;

pub use docker::{DockerConnector, DockerEngine};
pub use host::{HostConnector, HostEngine};
pub use memory::{MemoryConnector, MemoryEngine};

/// Errors reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The engine binary or daemon cannot be reached.
  #[error("{program} is unavailable: {message}")]
  Unavailable { program: String, message: String },

  /// An engine command ran but reported failure.
  #[error("`{command}` failed: {message}")]
  Command { command: String, message: String },

  /// A path requested from the environment does not exist.
  #[error("{path} does not exist in the environment")]
  MissingPath { path: String },

  /// A path cannot be mapped into the environment.
  #[error("invalid environment path `{path}`: {message}")]
  InvalidPath { path: String, message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Which engine drives the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
  /// Containers via the `docker` CLI.
  #[default]
  Docker,
  /// A throwaway sandbox directory on the host.
  Host,
}

impl EngineKind {
  pub fn as_str(self) -> &'static str {
    match self {
      EngineKind::Docker => "docker",
      EngineKind::Host => "host",
    }
  }
}

impl std::str::FromStr for EngineKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "docker" => Ok(EngineKind::Docker),
      "host" => Ok(EngineKind::Host),
      other => Err(format!("unknown engine `{}` (expected docker or host)", other)),
    }
  }
}

/// Termination status and combined stdout/stderr of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
  pub code: Option<i32>,
  pub output: String,
  /// The layer came from the engine's cache and the command did not run.
  pub cached: bool,
}

impl ExecOutput {
  /// A command that ran and exited with `code`.
  pub fn exited(code: i32, output: impl Into<String>) -> Self {
    Self {
      code: Some(code),
      output: output.into(),
      cached: false,
    }
  }

  /// A successful run answered from the layer cache.
  pub fn cached() -> Self {
    Self {
      code: Some(0),
      output: String::new(),
      cached: true,
    }
  }

  pub fn success(&self) -> bool {
    self.code == Some(0)
  }
}

/// A live session with an execution engine.
#[allow(async_fn_in_trait)]
pub trait Engine {
  /// Opaque handle to one state of the environment.
  type Env;

  fn name(&self) -> &'static str;

  /// Start a fresh environment from a base image.
  async fn base(&self, image: &str) -> Result<Self::Env, EngineError>;

  /// Add `projection`'s files as a new layer at its mount path.
  ///
  /// `layer` is the digest of the resulting layer.
  async fn project(
    &self,
    env: Self::Env,
    projection: &Projection,
    layer: &ContentHash,
  ) -> Result<Self::Env, EngineError>;

  /// Run `argv` in `workdir`, producing the layer with digest `layer`.
  ///
  /// A non-zero exit is not an engine error: it is reported through
  /// [`ExecOutput`] together with the environment as it was before the run.
  /// Nothing the failed command wrote is visible through that environment.
  async fn run(
    &self,
    env: Self::Env,
    argv: &[String],
    workdir: &str,
    layer: &ContentHash,
  ) -> Result<(Self::Env, ExecOutput), EngineError>;

  /// Copy the directory at `path` out of the environment to `destination`.
  async fn export(&self, env: &Self::Env, path: &str, destination: &Path) -> Result<(), EngineError>;

  /// End the session and free everything it created.
  async fn release(self) -> Result<(), EngineError>;
}

/// Opens engine sessions.
#[allow(async_fn_in_trait)]
pub trait Connector {
  type Engine: Engine;

  fn name(&self) -> &'static str;

  async fn connect(&self) -> Result<Self::Engine, EngineError>;
}

/// Resolve `path` against `workdir` into a normalized absolute environment path.
///
/// `..` may not climb above the environment root.
pub fn resolve_env_path(workdir: &str, path: &str) -> Result<String, EngineError> {
  let joined = if path.starts_with('/') {
    path.to_string()
  } else {
    format!("{}/{}", workdir.trim_end_matches('/'), path)
  };

  if !joined.starts_with('/') {
    return Err(EngineError::InvalidPath {
      path: joined,
      message: "working directory must be absolute".to_string(),
    });
  }

  let mut parts: Vec<&str> = Vec::new();
  for component in Path::new(&joined).components() {
    match component {
      Component::RootDir | Component::CurDir => {}
      Component::ParentDir => {
        if parts.pop().is_none() {
          return Err(EngineError::InvalidPath {
            path: joined.clone(),
            message: "path escapes the environment root".to_string(),
          });
        }
      }
      Component::Normal(name) => parts.push(name.to_str().unwrap_or_default()),
      Component::Prefix(_) => {
        return Err(EngineError::InvalidPath {
          path: joined.clone(),
          message: "drive prefixes are not valid inside the environment".to_string(),
        });
      }
    }
  }

  Ok(format!("/{}", parts.join("/")))
}
