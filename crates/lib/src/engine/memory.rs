//! In-memory engine.
//!
//! Environments are plain file maps and commands are Rust closures keyed by
//! their exact argv. Every engine call is written to a journal so callers
//! can assert on ordering, and any operation can be made to fail.
//!
//! With [`MemoryConnector::with_layer_cache`], produced layers are kept by
//! digest across sessions of the same connector, the way a container daemon
//! keeps tagged images between builds. Cache hits are journaled with a
//! `cached ` prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::{Connector, Engine, EngineError, ExecOutput, resolve_env_path};
use crate::projection::{EntryKind, Projection};
use crate::util::hash::ContentHash;
use crate::util::task::blocking;

/// Engine operations, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryOp {
  Connect,
  Base,
  Project,
  Run,
  Export,
  Release,
}

/// A command implementation: mutates the filesystem, returns exit status and output.
pub type CommandHandler = Arc<dyn Fn(&mut MemoryFs, &str) -> ExecOutput + Send + Sync>;

/// Flat in-memory filesystem keyed by absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFs {
  files: BTreeMap<String, Vec<u8>>,
  dirs: BTreeSet<String>,
}

impl MemoryFs {
  /// Resolve `rel` against `workdir`; unresolvable paths map to themselves.
  pub fn join(workdir: &str, rel: &str) -> String {
    resolve_env_path(workdir, rel).unwrap_or_else(|_| rel.to_string())
  }

  pub fn write(&mut self, path: &str, content: impl Into<Vec<u8>>) {
    self.files.insert(normalize(path), content.into());
  }

  pub fn create_dir(&mut self, path: &str) {
    self.dirs.insert(normalize(path));
  }

  pub fn read(&self, path: &str) -> Option<&[u8]> {
    self.files.get(&normalize(path)).map(Vec::as_slice)
  }

  pub fn read_to_string(&self, path: &str) -> Option<String> {
    self.read(path).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
  }

  /// Whether `path` is a file, an explicit directory, or has files below it.
  pub fn exists(&self, path: &str) -> bool {
    let path = normalize(path);
    self.files.contains_key(&path) || self.is_dir(&path)
  }

  pub fn is_dir(&self, path: &str) -> bool {
    let path = normalize(path);
    let prefix = dir_prefix(&path);
    self.dirs.contains(&path)
      || self.files.keys().any(|k| k.starts_with(&prefix))
      || self.dirs.iter().any(|d| d.starts_with(&prefix))
  }

  /// Files below `dir`, relative to it.
  pub fn list(&self, dir: &str) -> Vec<String> {
    let prefix = dir_prefix(&normalize(dir));
    self
      .files
      .keys()
      .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
      .collect()
  }
}

fn normalize(path: &str) -> String {
  resolve_env_path("/", path).unwrap_or_else(|_| path.to_string())
}

fn dir_prefix(path: &str) -> String {
  if path == "/" { "/".to_string() } else { format!("{}/", path) }
}

/// One environment state.
#[derive(Debug, Clone)]
pub struct MemoryEnv {
  pub image: String,
  pub fs: MemoryFs,
}

#[derive(Default)]
struct Shared {
  journal: Mutex<Vec<String>>,
  releases: Mutex<usize>,
  commands_run: Mutex<usize>,
  layers: Mutex<BTreeMap<ContentHash, MemoryFs>>,
}

/// Opens [`MemoryEngine`] sessions and records what they did.
#[derive(Clone, Default)]
pub struct MemoryConnector {
  handlers: BTreeMap<Vec<String>, CommandHandler>,
  failures: BTreeSet<MemoryOp>,
  layer_cache: bool,
  shared: Arc<Shared>,
}

impl fmt::Debug for MemoryConnector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemoryConnector")
      .field("commands", &self.handlers.keys().collect::<Vec<_>>())
      .field("failures", &self.failures)
      .field("layer_cache", &self.layer_cache)
      .finish()
  }
}

impl MemoryConnector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the behavior of `argv`. Unregistered commands exit 127.
  pub fn on_command<F>(mut self, argv: &[&str], handler: F) -> Self
  where
    F: Fn(&mut MemoryFs, &str) -> ExecOutput + Send + Sync + 'static,
  {
    self
      .handlers
      .insert(argv.iter().map(|s| s.to_string()).collect(), Arc::new(handler));
    self
  }

  /// Make `op` fail with [`EngineError::Unavailable`].
  pub fn fail_on(mut self, op: MemoryOp) -> Self {
    self.failures.insert(op);
    self
  }

  /// Keep produced layers by digest and reuse them in later sessions.
  pub fn with_layer_cache(mut self) -> Self {
    self.layer_cache = true;
    self
  }

  /// Every engine call made so far, in order.
  pub fn journal(&self) -> Vec<String> {
    self.shared.journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Number of sessions released.
  pub fn releases(&self) -> usize {
    *self.shared.releases.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Number of registered commands actually executed.
  pub fn commands_run(&self) -> usize {
    *self.shared.commands_run.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Whether any journal entry starts with `prefix`.
  pub fn ran(&self, prefix: &str) -> bool {
    self.journal().iter().any(|entry| entry.starts_with(prefix))
  }
}

impl Connector for MemoryConnector {
  type Engine = MemoryEngine;

  fn name(&self) -> &'static str {
    "memory"
  }

  async fn connect(&self) -> Result<MemoryEngine, EngineError> {
    let engine = MemoryEngine {
      handlers: self.handlers.clone(),
      failures: self.failures.clone(),
      layer_cache: self.layer_cache,
      shared: Arc::clone(&self.shared),
    };
    engine.log("connect".to_string());
    engine.check(MemoryOp::Connect)?;
    Ok(engine)
  }
}

/// In-memory engine session.
pub struct MemoryEngine {
  handlers: BTreeMap<Vec<String>, CommandHandler>,
  failures: BTreeSet<MemoryOp>,
  layer_cache: bool,
  shared: Arc<Shared>,
}

impl MemoryEngine {
  fn log(&self, entry: String) {
    self.shared.journal.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
  }

  fn cached_layer(&self, layer: &ContentHash) -> Option<MemoryFs> {
    if !self.layer_cache {
      return None;
    }
    let layers = self.shared.layers.lock().unwrap_or_else(PoisonError::into_inner);
    layers.get(layer).cloned()
  }

  fn store_layer(&self, layer: &ContentHash, fs: &MemoryFs) {
    if self.layer_cache {
      let mut layers = self.shared.layers.lock().unwrap_or_else(PoisonError::into_inner);
      layers.insert(layer.clone(), fs.clone());
    }
  }

  fn check(&self, op: MemoryOp) -> Result<(), EngineError> {
    if self.failures.contains(&op) {
      return Err(EngineError::Unavailable {
        program: "memory".to_string(),
        message: format!("injected failure during {:?}", op),
      });
    }
    Ok(())
  }
}

impl Engine for MemoryEngine {
  type Env = MemoryEnv;

  fn name(&self) -> &'static str {
    "memory"
  }

  async fn base(&self, image: &str) -> Result<MemoryEnv, EngineError> {
    self.log(format!("base {}", image));
    self.check(MemoryOp::Base)?;
    Ok(MemoryEnv {
      image: image.to_string(),
      fs: MemoryFs::default(),
    })
  }

  async fn project(
    &self,
    mut env: MemoryEnv,
    projection: &Projection,
    layer: &ContentHash,
  ) -> Result<MemoryEnv, EngineError> {
    let names: Vec<&str> = projection.entries().map(|(rel, _)| rel).collect();
    let entry = format!("project {} [{}]", projection.mount_path(), names.join(", "));
    if let Some(fs) = self.cached_layer(layer) {
      self.log(format!("cached {}", entry));
      env.fs = fs;
      return Ok(env);
    }
    self.log(entry);
    self.check(MemoryOp::Project)?;

    let sources: Vec<(String, PathBuf, EntryKind)> = projection
      .entries()
      .map(|(rel, kind)| {
        (
          MemoryFs::join(projection.mount_path(), rel),
          projection.host_path(rel),
          kind.clone(),
        )
      })
      .collect();
    let files = blocking(move || {
      sources
        .into_iter()
        .map(|(path, host, kind)| -> std::io::Result<(String, Vec<u8>)> {
          let content = match kind {
            EntryKind::File => std::fs::read(host)?,
            EntryKind::Symlink(target) => target.to_string_lossy().into_owned().into_bytes(),
          };
          Ok((path, content))
        })
        .collect::<std::io::Result<Vec<_>>>()
    })
    .await?;

    for (path, content) in files {
      env.fs.write(&path, content);
    }
    self.store_layer(layer, &env.fs);
    Ok(env)
  }

  async fn run(
    &self,
    mut env: MemoryEnv,
    argv: &[String],
    workdir: &str,
    layer: &ContentHash,
  ) -> Result<(MemoryEnv, ExecOutput), EngineError> {
    let entry = format!("run {} {}", workdir, argv.join(" "));
    if let Some(fs) = self.cached_layer(layer) {
      self.log(format!("cached {}", entry));
      env.fs = fs;
      return Ok((env, ExecOutput::cached()));
    }
    self.log(entry);
    self.check(MemoryOp::Run)?;

    let Some(handler) = self.handlers.get(argv) else {
      let program = argv.first().map(String::as_str).unwrap_or_default();
      return Ok((env, ExecOutput::exited(127, format!("{}: command not found\n", program))));
    };

    let mut scratch = env.fs.clone();
    scratch.create_dir(workdir);
    let output = handler(&mut scratch, workdir);
    *self.shared.commands_run.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    if output.success() {
      env.fs = scratch;
      self.store_layer(layer, &env.fs);
    }
    Ok((env, output))
  }

  async fn export(&self, env: &MemoryEnv, path: &str, destination: &Path) -> Result<(), EngineError> {
    self.log(format!("export {} {}", path, destination.display()));
    self.check(MemoryOp::Export)?;

    if !env.fs.is_dir(path) {
      return Err(EngineError::MissingPath { path: path.to_string() });
    }
    let files: Vec<(PathBuf, Vec<u8>)> = env
      .fs
      .list(path)
      .into_iter()
      .map(|rel| {
        let content = env.fs.read(&MemoryFs::join(path, &rel)).unwrap_or_default().to_vec();
        (destination.join(rel), content)
      })
      .collect();
    let destination = destination.to_path_buf();
    blocking(move || {
      std::fs::create_dir_all(&destination)?;
      for (target, content) in files {
        if let Some(parent) = target.parent() {
          std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
      }
      Ok::<_, std::io::Error>(())
    })
    .await?;
    Ok(())
  }

  async fn release(self) -> Result<(), EngineError> {
    self.log("release".to_string());
    *self.shared.releases.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    self.check(MemoryOp::Release)
  }
}
