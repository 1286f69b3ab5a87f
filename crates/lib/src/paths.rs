//! Host path resolution.
//!
//! Source and destination are resolved once, before anything else runs, so
//! later steps never depend on the process working directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::BuildError;

/// The two host directories a build reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
  source_root: PathBuf,
  destination_root: PathBuf,
}

impl BuildRequest {
  /// Resolve both paths against the current working directory.
  pub fn resolve(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<Self, BuildError> {
    Ok(Self {
      source_root: resolve_path(source.as_ref())?,
      destination_root: resolve_path(destination.as_ref())?,
    })
  }

  pub fn source_root(&self) -> &Path {
    &self.source_root
  }

  pub fn destination_root(&self) -> &Path {
    &self.destination_root
  }
}

/// Make `path` absolute without following symlinks.
///
/// Relative paths are joined onto the current directory and `.`/`..`
/// components are folded lexically. The path does not need to exist.
pub fn resolve_path(path: &Path) -> Result<PathBuf, BuildError> {
  let absolute = if path.is_absolute() {
    path.to_path_buf()
  } else {
    let cwd = std::env::current_dir().map_err(|source| BuildError::PathResolution {
      path: path.to_path_buf(),
      source,
    })?;
    cwd.join(path)
  };

  if absolute.as_os_str().is_empty() {
    return Err(BuildError::PathResolution {
      path: path.to_path_buf(),
      source: io::Error::new(io::ErrorKind::InvalidInput, "empty path"),
    });
  }

  Ok(dunce::simplified(&normalize(&absolute)).to_path_buf())
}

/// Fold `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        // `..` at the root stays at the root
        if !matches!(out.components().next_back(), Some(Component::RootDir | Component::Prefix(_)) | None) {
          out.pop();
        }
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}
