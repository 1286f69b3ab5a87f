//! Artifact export.
//!
//! Copies the build output directory out of the final environment onto the
//! host. The destination is expected to be absent (see [`crate::clean`]); if
//! the copy fails part-way, whatever was written is removed again so a failed
//! run never leaves a half-populated destination behind.
//!
//! The exported tree is hashed afterwards. Two runs over identical inputs
//! report the same output digest.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::{Engine, EngineError};
use crate::environment::Environment;
use crate::error::BuildError;
use crate::util::hash::{ContentHash, hash_directory};
use crate::util::task::blocking;

/// What ended up in the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
  pub files: usize,
  /// Digest of the exported tree: paths and contents, no timestamps.
  pub digest: ContentHash,
}

/// Export `in_env_path` from `env` to `destination`.
pub async fn export_artifact<E: Engine>(
  engine: &E,
  env: &Environment<E::Env>,
  in_env_path: &str,
  destination: &Path,
) -> Result<ExportSummary, BuildError> {
  let export_err = |message: String| BuildError::Export {
    path: in_env_path.to_string(),
    destination: destination.to_path_buf(),
    message,
  };

  if let Some(parent) = destination.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(|e| export_err(format!("cannot create {}: {}", parent.display(), e)))?;
  }

  debug!(path = %in_env_path, destination = %destination.display(), layer = %env.digest().short(), "exporting");

  if let Err(e) = engine.export(env.handle(), in_env_path, destination).await {
    discard_partial(destination).await;
    let message = match e {
      EngineError::MissingPath { .. } => format!("{} was not produced by the build", in_env_path),
      other => other.to_string(),
    };
    return Err(export_err(message));
  }

  let root = destination.to_path_buf();
  let summarized = blocking(move || hash_directory(&root).map(|digest| (count_files(&root), digest))).await;
  let (files, digest) = match summarized {
    Ok(summary) => summary,
    Err(e) => {
      discard_partial(destination).await;
      return Err(export_err(format!("cannot read exported output: {}", e)));
    }
  };

  info!(
    destination = %destination.display(),
    files,
    digest = %digest.short(),
    "exported build output"
  );
  Ok(ExportSummary { files, digest })
}

async fn discard_partial(destination: &Path) {
  match tokio::fs::remove_dir_all(destination).await {
    Ok(()) => debug!(path = %destination.display(), "removed partial export"),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => warn!(path = %destination.display(), error = %e, "failed to remove partial export"),
  }
}

fn count_files(root: &Path) -> usize {
  WalkDir::new(root)
    .into_iter()
    .filter_map(Result::ok)
    .filter(|e| !e.file_type().is_dir())
    .count()
}
