//! Host sandbox engine.
//!
//! Each environment state is a private directory under the system temp dir
//! that stands in for the container root filesystem. Commands run directly
//! on the host (no shell) with a scrubbed environment, following the same
//! isolation rules as a hermetic build:
//! - all variables cleared except `PATH`
//! - `HOME` and `TMPDIR` point inside the sandbox
//! - `LANG`/`LC_ALL` are `C`
//! - `SOURCE_DATE_EPOCH` is pinned
//!
//! Every command runs in a fresh copy of the previous sandbox. A successful
//! run retires the old copy; a failed one discards the new copy, so the
//! environment handed back is exactly the one the command started from.
//!
//! The base image name is only logged, nothing is pulled, and there is no
//! layer cache.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::consts::{APP_NAME, SOURCE_DATE_EPOCH};
use crate::engine::fs::{copy_tree, materialize_projection};
use crate::engine::process::{Echo, render, run_streaming};
use crate::engine::{Connector, Engine, EngineError, ExecOutput, resolve_env_path};
use crate::projection::Projection;
use crate::util::hash::ContentHash;
use crate::util::task::blocking;

/// Opens [`HostEngine`] sessions.
#[derive(Debug, Default, Clone)]
pub struct HostConnector {
  sandbox_parent: Option<PathBuf>,
}

impl HostConnector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create sandboxes under `dir` instead of the system temp dir.
  pub fn with_sandbox_parent(dir: impl Into<PathBuf>) -> Self {
    Self {
      sandbox_parent: Some(dir.into()),
    }
  }
}

impl Connector for HostConnector {
  type Engine = HostEngine;

  fn name(&self) -> &'static str {
    "host"
  }

  async fn connect(&self) -> Result<HostEngine, EngineError> {
    let parent = self.sandbox_parent.clone().unwrap_or_else(std::env::temp_dir);
    tokio::fs::create_dir_all(&parent).await.map_err(|e| EngineError::Unavailable {
      program: "host sandbox".to_string(),
      message: format!("{}: {}", parent.display(), e),
    })?;
    Ok(HostEngine {
      parent,
      sandboxes: Mutex::new(Vec::new()),
    })
  }
}

/// Engine session backed by sandbox directories.
#[derive(Debug)]
pub struct HostEngine {
  parent: PathBuf,
  sandboxes: Mutex<Vec<TempDir>>,
}

/// One state of a host sandbox.
#[derive(Debug)]
pub struct HostEnv {
  root: PathBuf,
}

impl HostEnv {
  /// Host location of an absolute environment path.
  pub fn host_path(&self, env_path: &str) -> Result<PathBuf, EngineError> {
    let normalized = resolve_env_path("/", env_path)?;
    Ok(self.root.join(normalized.trim_start_matches('/')))
  }
}

impl HostEngine {
  fn new_sandbox(&self) -> Result<TempDir, EngineError> {
    let sandbox = tempfile::Builder::new()
      .prefix(&format!("{}-", APP_NAME))
      .tempdir_in(&self.parent)?;
    Ok(sandbox)
  }

  fn keep(&self, sandbox: TempDir) {
    self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner).push(sandbox);
  }

  /// Remove the sandbox at `root` once no environment refers to it.
  async fn retire(&self, root: &Path) {
    let retired = {
      let mut sandboxes = self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner);
      sandboxes
        .iter()
        .position(|sandbox| sandbox.path() == root)
        .map(|i| sandboxes.swap_remove(i))
    };
    let Some(sandbox) = retired else {
      return;
    };
    if let Err(e) = discard(sandbox).await {
      warn!(path = %root.display(), error = %e, "failed to remove retired sandbox");
    }
  }
}

/// Delete a sandbox tree off the async workers.
async fn discard(sandbox: TempDir) -> std::io::Result<()> {
  blocking(move || sandbox.close()).await
}

impl Engine for HostEngine {
  type Env = HostEnv;

  fn name(&self) -> &'static str {
    "host"
  }

  async fn base(&self, image: &str) -> Result<HostEnv, EngineError> {
    let sandbox = self.new_sandbox()?;
    let root = sandbox.path().to_path_buf();
    tokio::fs::create_dir_all(root.join("tmp")).await?;
    tokio::fs::create_dir_all(root.join("home")).await?;

    warn!(image = %image, "host engine does not pull images, commands use host tools");
    debug!(root = %root.display(), "created sandbox");

    self.keep(sandbox);
    Ok(HostEnv { root })
  }

  async fn project(&self, env: HostEnv, projection: &Projection, _layer: &ContentHash) -> Result<HostEnv, EngineError> {
    let dest = env.host_path(projection.mount_path())?;
    let owned = projection.clone();
    blocking(move || materialize_projection(&owned, &dest)).await?;
    debug!(
      mount = %projection.mount_path(),
      files = projection.len(),
      "projected files into sandbox"
    );
    Ok(env)
  }

  async fn run(
    &self,
    env: HostEnv,
    argv: &[String],
    workdir: &str,
    _layer: &ContentHash,
  ) -> Result<(HostEnv, ExecOutput), EngineError> {
    let Some((program, args)) = argv.split_first() else {
      return Err(EngineError::Command {
        command: String::new(),
        message: "empty command".to_string(),
      });
    };

    let scratch = self.new_sandbox()?;
    let next = HostEnv {
      root: scratch.path().to_path_buf(),
    };
    let (from, to) = (env.root.clone(), next.root.clone());
    blocking(move || copy_tree(&from, &to)).await?;
    debug!(from = %env.root.display(), to = %next.root.display(), "copied sandbox for run");

    let cwd = next.host_path(workdir)?;
    tokio::fs::create_dir_all(&cwd).await?;

    let tmp = next.root.join("tmp");
    let mut command = Command::new(program);
    command
      .args(args)
      .current_dir(&cwd)
      .env_clear()
      .env("HOME", next.root.join("home"))
      .env("TMPDIR", &tmp)
      .env("TMP", &tmp)
      .env("TEMP", &tmp)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);
    if let Some(path) = std::env::var_os("PATH") {
      command.env("PATH", path);
    }

    let rendered = render(program, args);
    info!(command = %rendered, workdir = %workdir, "running in sandbox");

    let output = match run_streaming(command, program, Echo::Info).await {
      Ok(output) => output,
      // Mirror a container runtime: a missing executable is a failed command, not a broken engine.
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        ExecOutput::exited(127, format!("{}: command not found\n", program))
      }
      Err(e) => return Err(EngineError::Io(e)),
    };

    if !output.success() {
      if let Err(e) = discard(scratch).await {
        warn!(error = %e, "failed to discard sandbox of failed run");
      }
      return Ok((env, output));
    }

    self.keep(scratch);
    self.retire(&env.root).await;
    Ok((next, output))
  }

  async fn export(&self, env: &HostEnv, path: &str, destination: &Path) -> Result<(), EngineError> {
    let src = env.host_path(path)?;
    if !src.is_dir() {
      return Err(EngineError::MissingPath { path: path.to_string() });
    }
    let destination = destination.to_path_buf();
    blocking(move || copy_tree(&src, &destination)).await?;
    Ok(())
  }

  async fn release(self) -> Result<(), EngineError> {
    let sandboxes = self.sandboxes.into_inner().unwrap_or_else(PoisonError::into_inner);
    let count = sandboxes.len();
    let mut first_err = None;
    for sandbox in sandboxes {
      let path = sandbox.path().to_path_buf();
      if let Err(e) = discard(sandbox).await {
        warn!(path = %path.display(), error = %e, "failed to remove sandbox");
        first_err.get_or_insert(e);
      }
    }
    debug!(sandboxes = count, "released host engine");
    match first_err {
      Some(e) => Err(EngineError::Io(e)),
      None => Ok(()),
    }
  }
}
