//! Engine session lifecycle.
//!
//! [`with_session`] connects, lends the engine to the pipeline body and
//! releases it afterwards, on success and on every failure path alike.

use tracing::{debug, warn};

use crate::engine::{Connector, Engine};
use crate::error::BuildError;

/// Run `body` against a freshly connected engine, then release it.
///
/// A connection failure is returned before `body` runs. A release failure is
/// logged and does not override the outcome of `body`.
pub async fn with_session<C, T>(
  connector: &C,
  body: impl AsyncFnOnce(&C::Engine) -> Result<T, BuildError>,
) -> Result<T, BuildError>
where
  C: Connector,
{
  let engine = connector.connect().await.map_err(|source| BuildError::EngineConnection {
    engine: connector.name(),
    source,
  })?;
  debug!(engine = connector.name(), "engine session opened");

  let result = body(&engine).await;

  match engine.release().await {
    Ok(()) => debug!(engine = connector.name(), "engine session released"),
    Err(e) => warn!(engine = connector.name(), error = %e, "failed to release engine session"),
  }

  result
}
