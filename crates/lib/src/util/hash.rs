//! Hashing for layer digests and exported output.
//!
//! Layer digests are built from tagged records with [`DigestBuilder`]; the
//! exported build directory is summarized with [`hash_directory`].

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::DIGEST_DISPLAY_LEN;

/// A full 64-character SHA-256 hash, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Shortened form for log lines.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(DIGEST_DISPLAY_LEN)]
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Incremental SHA-256 over newline-terminated records.
///
/// Layer digests chain the parent digest into the child, so the same
/// records on top of a different parent yield a different digest.
#[derive(Clone, Default)]
pub struct DigestBuilder {
  hasher: Sha256,
}

impl DigestBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start from a parent digest.
  pub fn chained(parent: &ContentHash) -> Self {
    let mut builder = Self::new();
    builder.record(&["parent", parent.0.as_str()]);
    builder
  }

  /// Append one record. Fields are NUL-separated so `["a b"]` and `["a", "b"]` differ.
  pub fn record(&mut self, fields: &[&str]) -> &mut Self {
    for (i, field) in fields.iter().enumerate() {
      if i > 0 {
        self.hasher.update([0u8]);
      }
      self.hasher.update(field.as_bytes());
    }
    self.hasher.update(b"\n");
    self
  }

  pub fn finish(self) -> ContentHash {
    ContentHash(hex::encode(self.hasher.finalize()))
  }
}

/// Digest of a directory tree.
///
/// Covers relative paths, file contents and symlink targets in walk order,
/// but not timestamps or permissions, so two byte-identical exports of the
/// same build produce the same digest.
pub fn hash_directory(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut builder = DigestBuilder::new();

  for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let Ok(rel) = entry.path().strip_prefix(path) else {
      continue;
    };
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    if file_type.is_dir() {
      builder.record(&["D", rel.as_str()]);
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| DirHashError::ReadSymlink {
        path: entry.path().display().to_string(),
        message: e.to_string(),
      })?;
      let target = hash_bytes(target.to_string_lossy().as_bytes());
      builder.record(&["L", rel.as_str(), target.0.as_str()]);
    } else if file_type.is_file() {
      let content = hash_file(entry.path())?;
      builder.record(&["F", rel.as_str(), content.0.as_str()]);
    }
  }

  Ok(builder.finish())
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read_err = |e: std::io::Error| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}
