//! Docker CLI engine.
//!
//! Every environment state is a Docker image. Projections and commands each
//! produce a new image via `docker commit`.
//!
//! With the layer cache on, each committed image is tagged
//! `frontbuild-cache:<key>`, where the key combines the base image ID with
//! the layer digest. A later session asked for the same layer finds the tag
//! with `docker image inspect` and skips the copy or the command. Tagged
//! images outlive the session; everything else the session created is
//! removed on release.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::engine::fs::materialize_projection;
use crate::engine::process::{Echo, capture, render, run_streaming};
use crate::engine::{Connector, Engine, EngineError, ExecOutput};
use crate::projection::Projection;
use crate::util::hash::{ContentHash, DigestBuilder};
use crate::util::task::blocking;

const DEFAULT_PROGRAM: &str = "docker";

/// Repository that holds cached layers.
pub const CACHE_REPOSITORY: &str = "frontbuild-cache";

/// Command used to create containers that are never started.
const IDLE_COMMAND: &str = "/bin/true";

/// Opens [`DockerEngine`] sessions.
#[derive(Debug, Clone)]
pub struct DockerConnector {
  program: String,
  layer_cache: bool,
}

impl Default for DockerConnector {
  fn default() -> Self {
    Self {
      program: DEFAULT_PROGRAM.to_string(),
      layer_cache: true,
    }
  }
}

impl DockerConnector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use a different Docker-compatible CLI binary.
  pub fn with_program(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      ..Self::default()
    }
  }

  /// Turn the tagged layer cache on or off.
  pub fn with_layer_cache(mut self, enabled: bool) -> Self {
    self.layer_cache = enabled;
    self
  }
}

impl Connector for DockerConnector {
  type Engine = DockerEngine;

  fn name(&self) -> &'static str {
    "docker"
  }

  async fn connect(&self) -> Result<DockerEngine, EngineError> {
    let args = vec!["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()];
    let version = capture(&self.program, &args).await.map_err(|e| match e {
      EngineError::Command { message, .. } => EngineError::Unavailable {
        program: self.program.clone(),
        message,
      },
      other => other,
    })?;
    info!(server = %version, layer_cache = self.layer_cache, "connected to docker");

    Ok(DockerEngine {
      program: self.program.clone(),
      layer_cache: self.layer_cache,
      created: Mutex::new(Created::default()),
    })
  }
}

/// What a session must remove on release.
#[derive(Debug, Default)]
struct Created {
  containers: Vec<String>,
  /// Committed images that were not tagged into the cache.
  images: Vec<String>,
}

/// Engine session driving the Docker CLI.
#[derive(Debug)]
pub struct DockerEngine {
  program: String,
  layer_cache: bool,
  created: Mutex<Created>,
}

/// One state of the environment.
#[derive(Debug)]
pub struct DockerEnv {
  /// Image ID of this state.
  image: String,
  /// Image ID of the base it was built on, part of every cache key.
  base: String,
}

impl DockerEngine {
  async fn docker(&self, args: Vec<String>) -> Result<String, EngineError> {
    capture(&self.program, &args).await
  }

  fn track(&self, f: impl FnOnce(&mut Created)) {
    let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut *created);
  }

  async fn create(&self, image: &str, workdir: Option<&str>, argv: &[String]) -> Result<String, EngineError> {
    let id = self.docker(create_args(image, workdir, argv)).await?;
    self.track(|c| c.containers.push(id.clone()));
    Ok(id)
  }

  async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
    self.docker(vec!["rm".into(), "-f".into(), id.to_string()]).await?;
    self.track(|c| c.containers.retain(|known| known != id));
    Ok(())
  }

  async fn commit(&self, container: &str) -> Result<String, EngineError> {
    self.docker(vec!["commit".into(), container.to_string()]).await
  }

  /// Cache tag for `layer` on top of `env`'s base, if caching is on.
  fn cache_tag(&self, env: &DockerEnv, layer: &ContentHash) -> Option<String> {
    self.layer_cache.then(|| cache_tag(&env.base, layer))
  }

  /// Image ID of a cached layer.
  async fn lookup(&self, tag: Option<&str>) -> Option<String> {
    let tag = tag?;
    match self.docker(inspect_args(tag)).await {
      Ok(id) => Some(id),
      Err(e) => {
        debug!(tag = %tag, error = %e, "layer not cached");
        None
      }
    }
  }

  /// Tag a freshly committed image into the cache, or schedule it for removal.
  async fn keep(&self, image: &str, tag: Option<&str>) {
    if let Some(tag) = tag {
      match self.docker(vec!["tag".into(), image.to_string(), tag.to_string()]).await {
        Ok(_) => {
          debug!(image = %image, tag = %tag, "cached layer");
          return;
        }
        Err(e) => warn!(image = %image, tag = %tag, error = %e, "failed to tag layer, it will not be cached"),
      }
    }
    self.track(|c| c.images.push(image.to_string()));
  }
}

impl Engine for DockerEngine {
  type Env = DockerEnv;

  fn name(&self) -> &'static str {
    "docker"
  }

  async fn base(&self, image: &str) -> Result<DockerEnv, EngineError> {
    if let Ok(id) = self.docker(inspect_args(image)).await {
      debug!(image = %image, id = %id, "base image present locally");
      return Ok(DockerEnv {
        image: id.clone(),
        base: id,
      });
    }

    info!(image = %image, "pulling base image");
    let mut pull = Command::new(&self.program);
    pull.arg("pull").arg(image);
    let output = run_streaming(pull, "pull", Echo::Debug).await?;
    if !output.success() {
      return Err(EngineError::Command {
        command: format!("{} pull {}", self.program, image),
        message: output.output.trim().to_string(),
      });
    }

    let id = self.docker(inspect_args(image)).await?;
    Ok(DockerEnv {
      image: id.clone(),
      base: id,
    })
  }

  async fn project(
    &self,
    env: DockerEnv,
    projection: &Projection,
    layer: &ContentHash,
  ) -> Result<DockerEnv, EngineError> {
    let tag = self.cache_tag(&env, layer);
    if let Some(image) = self.lookup(tag.as_deref()).await {
      info!(mount = %projection.mount_path(), layer = %layer.short(), "reusing cached projection layer");
      return Ok(DockerEnv { image, base: env.base });
    }

    let staging = tempfile::tempdir()?;
    let (owned, dest) = (projection.clone(), staging.path().to_path_buf());
    blocking(move || materialize_projection(&owned, &dest)).await?;

    let container = self.create(&env.image, None, &[IDLE_COMMAND.to_string()]).await?;
    let result = async {
      self
        .docker(vec![
          "cp".into(),
          format!("{}/.", staging.path().display()),
          format!("{}:{}", container, projection.mount_path()),
        ])
        .await?;
      self.commit(&container).await
    }
    .await;
    self.remove_container(&container).await?;

    let image = result?;
    self.keep(&image, tag.as_deref()).await;
    debug!(
      mount = %projection.mount_path(),
      files = projection.len(),
      image = %image,
      "committed projection layer"
    );
    Ok(DockerEnv { image, base: env.base })
  }

  async fn run(
    &self,
    env: DockerEnv,
    argv: &[String],
    workdir: &str,
    layer: &ContentHash,
  ) -> Result<(DockerEnv, ExecOutput), EngineError> {
    if argv.is_empty() {
      return Err(EngineError::Command {
        command: String::new(),
        message: "empty command".to_string(),
      });
    }

    let tag = self.cache_tag(&env, layer);
    if let Some(image) = self.lookup(tag.as_deref()).await {
      info!(command = %render(&argv[0], &argv[1..]), layer = %layer.short(), "reusing cached run layer");
      return Ok((DockerEnv { image, base: env.base }, ExecOutput::cached()));
    }

    let container = self.create(&env.image, Some(workdir), argv).await?;
    info!(command = %render(&argv[0], &argv[1..]), workdir = %workdir, "running in container");

    let mut start = Command::new(&self.program);
    start.arg("start").arg("--attach").arg(&container);
    let output = match run_streaming(start, &argv[0], Echo::Info).await {
      Ok(output) => output,
      Err(e) => {
        let _ = self.remove_container(&container).await;
        return Err(EngineError::Io(e));
      }
    };

    if !output.success() {
      self.remove_container(&container).await?;
      return Ok((env, output));
    }

    let committed = self.commit(&container).await;
    self.remove_container(&container).await?;
    let image = committed?;
    self.keep(&image, tag.as_deref()).await;
    Ok((DockerEnv { image, base: env.base }, output))
  }

  async fn export(&self, env: &DockerEnv, path: &str, destination: &Path) -> Result<(), EngineError> {
    let container = self.create(&env.image, None, &[IDLE_COMMAND.to_string()]).await?;
    let copied = self
      .docker(vec![
        "cp".into(),
        format!("{}:{}/.", container, path.trim_end_matches('/')),
        destination.display().to_string(),
      ])
      .await;
    self.remove_container(&container).await?;

    copied.map(|_| ()).map_err(|e| match e {
      EngineError::Command { message, .. } if is_missing_path(&message) => {
        EngineError::MissingPath { path: path.to_string() }
      }
      other => other,
    })
  }

  async fn release(self) -> Result<(), EngineError> {
    let created = self.created.into_inner().unwrap_or_else(PoisonError::into_inner);
    let mut failures = Vec::new();

    for container in &created.containers {
      if let Err(e) = capture(&self.program, &["rm".into(), "-f".into(), container.clone()]).await {
        warn!(container = %container, error = %e, "failed to remove container");
        failures.push(container.clone());
      }
    }

    // Children before parents.
    for image in created.images.iter().rev() {
      if let Err(e) = capture(&self.program, &["rmi".into(), image.clone()]).await {
        warn!(image = %image, error = %e, "failed to remove intermediate image");
        failures.push(image.clone());
      }
    }

    debug!(
      containers = created.containers.len(),
      images = created.images.len(),
      "released docker session"
    );

    if failures.is_empty() {
      Ok(())
    } else {
      Err(EngineError::Command {
        command: format!("{} rm/rmi", self.program),
        message: format!("could not remove {}", failures.join(", ")),
      })
    }
  }
}

/// `<repository>:<key>` for a layer on top of the base image `base_id`.
pub fn cache_tag(base_id: &str, layer: &ContentHash) -> String {
  let mut key = DigestBuilder::new();
  key.record(&["cache", base_id, layer.0.as_str()]);
  format!("{}:{}", CACHE_REPOSITORY, key.finish())
}

fn inspect_args(reference: &str) -> Vec<String> {
  vec![
    "image".to_string(),
    "inspect".to_string(),
    "--format".to_string(),
    "{{.Id}}".to_string(),
    reference.to_string(),
  ]
}

/// Arguments for `docker create`. The image entrypoint is cleared so `argv`
/// runs exactly as given.
fn create_args(image: &str, workdir: Option<&str>, argv: &[String]) -> Vec<String> {
  let mut args = vec!["create".to_string(), "--entrypoint".to_string(), String::new()];
  if let Some(workdir) = workdir {
    args.push("--workdir".to_string());
    args.push(workdir.to_string());
  }
  args.push(image.to_string());
  args.extend(argv.iter().cloned());
  args
}

fn is_missing_path(message: &str) -> bool {
  let lower = message.to_ascii_lowercase();
  lower.contains("could not find the file") || lower.contains("no such file or directory")
}
