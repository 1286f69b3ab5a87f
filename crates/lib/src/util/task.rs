//! Bridging blocking filesystem work onto the async runtime.

/// Run `f` on tokio's blocking pool and wait for it.
///
/// Tree walks, copies and hashing go through here so they never stall the
/// runtime's worker threads. A panic inside `f` is resumed on the caller.
pub async fn blocking<T, F>(f: F) -> T
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  match tokio::task::spawn_blocking(f).await {
    Ok(value) => value,
    Err(e) => std::panic::resume_unwind(e.into_panic()),
  }
}
