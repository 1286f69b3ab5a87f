//! Host filesystem copies used by the engines.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::projection::{EntryKind, Projection};

/// Copy every entry of `projection` into `dest`, creating parents.
///
/// Existing files at the same relative paths are replaced, which gives
/// projection layers overlay semantics.
pub fn materialize_projection(projection: &Projection, dest: &Path) -> io::Result<()> {
  fs::create_dir_all(dest)?;
  for (rel, kind) in projection.entries() {
    let target = dest.join(rel);
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent)?;
    }
    remove_existing(&target)?;
    match kind {
      EntryKind::File => {
        fs::copy(projection.host_path(rel), &target)?;
      }
      EntryKind::Symlink(link_target) => create_symlink(link_target, &target)?,
    }
  }
  Ok(())
}

/// Copy the tree at `src` to `dst`, preserving symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
  fs::create_dir_all(dst)?;
  for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let Ok(rel) = entry.path().strip_prefix(src) else {
      continue;
    };
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dst.join(rel);
    let file_type = entry.file_type();
    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
    } else if file_type.is_symlink() {
      create_symlink(&fs::read_link(entry.path())?, &target)?;
    } else if file_type.is_file() {
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
  match fs::symlink_metadata(path) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(target, link)
}
