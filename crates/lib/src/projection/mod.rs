//! Filtered projection of host files into the execution environment.
//!
//! A projection is computed entirely on the host: the source tree is walked,
//! filtered, and the resulting set of relative paths is handed to the engine,
//! which copies them into a new layer at the mount path. The host tree is
//! never modified.

pub mod filter;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::Engine;
use crate::environment::Environment;
use crate::error::{BuildError, PipelineStep};
use crate::util::hash::{ContentHash, DigestBuilder, DirHashError, hash_bytes, hash_file};
use crate::util::task::blocking;

pub use filter::{CompiledFilter, Filter, FilterError};

/// Where a projection lands and which files it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionSpec {
  pub mount_path: String,
  pub filter: Filter,
}

impl ProjectionSpec {
  pub fn include(mount_path: impl Into<String>, patterns: Vec<String>) -> Self {
    Self {
      mount_path: mount_path.into(),
      filter: Filter::IncludeOnly(patterns),
    }
  }

  pub fn exclude(mount_path: impl Into<String>, patterns: Vec<String>) -> Self {
    Self {
      mount_path: mount_path.into(),
      filter: Filter::ExcludeOnly(patterns),
    }
  }
}

/// Kind of a projected entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
  File,
  Symlink(PathBuf),
}

#[derive(Debug, Error)]
pub enum ProjectionError {
  #[error("{0}")]
  Filter(#[from] FilterError),

  #[error("source root {} is not a directory", .0.display())]
  NotADirectory(PathBuf),

  #[error("failed to read source tree: {0}")]
  Walk(String),

  #[error("failed to hash projected file: {0}")]
  Hash(#[from] DirHashError),
}

/// The resolved set of files for one projection.
///
/// Entries are keyed by `/`-separated path relative to `root`, so iteration
/// order is stable regardless of the order the filesystem returns them in.
#[derive(Debug, Clone)]
pub struct Projection {
  root: PathBuf,
  mount_path: String,
  entries: BTreeMap<String, EntryKind>,
}

impl Projection {
  /// Walk `root` and collect every entry `spec` selects.
  pub fn select(root: &Path, spec: &ProjectionSpec) -> Result<Self, ProjectionError> {
    let compiled = spec.filter.compile()?;

    match std::fs::metadata(root) {
      Ok(meta) if meta.is_dir() => {}
      Ok(_) => return Err(ProjectionError::NotADirectory(root.to_path_buf())),
      Err(e) => return Err(ProjectionError::Walk(format!("{}: {}", root.display(), e))),
    }

    let mut entries = BTreeMap::new();
    let walker = WalkDir::new(root)
      .follow_links(false)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
          return true;
        }
        relative(root, entry.path()).is_some_and(|rel| compiled.descend(&rel))
      });

    for entry in walker {
      let entry = entry.map_err(|e| ProjectionError::Walk(e.to_string()))?;
      let file_type = entry.file_type();
      if file_type.is_dir() {
        continue;
      }
      let Some(rel) = relative(root, entry.path()) else {
        continue;
      };
      if !compiled.selects(&rel) {
        continue;
      }

      let kind = if file_type.is_symlink() {
        let target = std::fs::read_link(entry.path()).map_err(|e| ProjectionError::Walk(e.to_string()))?;
        EntryKind::Symlink(target)
      } else if file_type.is_file() {
        EntryKind::File
      } else {
        debug!(path = %rel, "skipping special file");
        continue;
      };
      entries.insert(rel, kind);
    }

    debug!(
      root = %root.display(),
      mode = spec.filter.mode(),
      selected = entries.len(),
      "selected projection entries"
    );

    Ok(Self {
      root: root.to_path_buf(),
      mount_path: spec.mount_path.clone(),
      entries,
    })
  }

  pub fn mount_path(&self) -> &str {
    &self.mount_path
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn contains(&self, rel: &str) -> bool {
    self.entries.contains_key(rel)
  }

  /// Entries in path order.
  pub fn entries(&self) -> impl Iterator<Item = (&str, &EntryKind)> {
    self.entries.iter().map(|(rel, kind)| (rel.as_str(), kind))
  }

  /// Host path of a projected entry.
  pub fn host_path(&self, rel: &str) -> PathBuf {
    self.root.join(rel)
  }

  /// Content digest of this projection layered on `parent`.
  ///
  /// Covers the mount path, every relative path and each file's content.
  /// The host location of the source root is not part of it.
  pub fn digest(&self, parent: &ContentHash) -> Result<ContentHash, ProjectionError> {
    let mut builder = DigestBuilder::chained(parent);
    builder.record(&["project", self.mount_path.as_str()]);
    for (rel, kind) in &self.entries {
      let content = match kind {
        EntryKind::File => hash_file(&self.host_path(rel))?,
        EntryKind::Symlink(target) => hash_bytes(target.to_string_lossy().as_bytes()),
      };
      let tag = match kind {
        EntryKind::File => "F",
        EntryKind::Symlink(_) => "L",
      };
      builder.record(&[tag, rel.as_str(), content.0.as_str()]);
    }
    Ok(builder.finish())
  }
}

/// Select files under `source_root` and add them to `env` as a new layer.
pub async fn project_into<E: Engine>(
  engine: &E,
  env: Environment<E::Env>,
  source_root: &Path,
  spec: &ProjectionSpec,
  step: PipelineStep,
) -> Result<Environment<E::Env>, BuildError> {
  let projection_err = |e: ProjectionError| BuildError::Projection {
    step,
    root: source_root.to_path_buf(),
    message: e.to_string(),
  };

  let (root, owned_spec, parent) = (source_root.to_path_buf(), spec.clone(), env.digest().clone());
  let (projection, digest) = blocking(move || {
    let projection = Projection::select(&root, &owned_spec)?;
    let digest = projection.digest(&parent)?;
    Ok::<_, ProjectionError>((projection, digest))
  })
  .await
  .map_err(projection_err)?;

  if projection.is_empty() {
    warn!(step = %step, mode = spec.filter.mode(), "projection matched no files");
  }

  let (handle, lineage) = env.detach();
  let handle = engine
    .project(handle, &projection, &digest)
    .await
    .map_err(|source| BuildError::EngineCommunication { step, source })?;

  info!(
    step = %step,
    mount = %projection.mount_path(),
    files = projection.len(),
    layer = %digest.short(),
    "projected source files"
  );

  let description = format!("project {} ({} files)", projection.mount_path(), projection.len());
  Ok(lineage.extend(handle, description, digest))
}

fn relative(root: &Path, path: &Path) -> Option<String> {
  let rel = path.strip_prefix(root).ok()?;
  let joined = rel
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/");
  if joined.is_empty() { None } else { Some(joined) }
}
