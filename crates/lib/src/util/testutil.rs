//! Test utilities for frontbuild-lib.
//!
//! Helpers for building scratch source trees and reading back exported ones.

use std::path::Path;

use walkdir::WalkDir;

use crate::util::hash::{ContentHash, hash_bytes};

/// Write `(relative path, content)` pairs under `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
  for (rel, content) in files {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }
}

/// Relative paths of every file under `root`, sorted, `/`-separated.
pub fn list_files(root: &Path) -> Vec<String> {
  let mut files: Vec<String> = WalkDir::new(root)
    .into_iter()
    .filter_map(Result::ok)
    .filter(|e| !e.file_type().is_dir())
    .filter_map(|e| {
      e.path()
        .strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
    })
    .collect();
  files.sort();
  files
}

/// Returns the command and args to run a shell script.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> Vec<String> {
  vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A stand-in layer digest for driving engines directly.
pub fn layer(name: &str) -> ContentHash {
  hash_bytes(name.as_bytes())
}
