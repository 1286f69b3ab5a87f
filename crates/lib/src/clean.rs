//! Destination cleanup before a run.

use std::io;

use tokio::fs;
use tracing::{debug, info};

use crate::error::BuildError;
use crate::paths::BuildRequest;

/// Remove the request's destination recursively so the export starts from nothing.
///
/// A missing destination is fine. A destination that is a plain file or
/// symlink is removed as well; the export recreates it as a directory. A
/// destination that is, or contains, the source root is refused before
/// anything is touched.
pub async fn clean_destination(request: &BuildRequest) -> Result<(), BuildError> {
  let destination = request.destination_root();
  let cleanup_err = |source: io::Error| BuildError::Cleanup {
    path: destination.to_path_buf(),
    source,
  };

  if request.source_root().starts_with(destination) {
    return Err(cleanup_err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("destination contains the source root {}", request.source_root().display()),
    )));
  }

  let metadata = match fs::symlink_metadata(destination).await {
    Ok(metadata) => metadata,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      debug!(path = %destination.display(), "destination absent, nothing to clean");
      return Ok(());
    }
    Err(e) => return Err(cleanup_err(e)),
  };

  let result = if metadata.is_dir() {
    fs::remove_dir_all(destination).await
  } else {
    fs::remove_file(destination).await
  };

  match result {
    Ok(()) => {
      info!(path = %destination.display(), "removed previous output");
      Ok(())
    }
    // Raced with another remover; the end state is what we wanted.
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(cleanup_err(e)),
  }
}
