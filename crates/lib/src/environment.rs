//! The execution environment threaded through the pipeline.
//!
//! Wraps an engine's opaque handle together with the digest chain of the
//! layers that produced it. Every step takes the environment by value and
//! returns the next one, so the ordering of steps is enforced by ownership.

use serde::Serialize;

use crate::util::hash::{ContentHash, DigestBuilder};

/// One layer of the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
  /// Short human-readable origin, e.g. `project /src (3 files)`.
  pub description: String,
  /// Digest of this layer chained onto its parent.
  pub digest: ContentHash,
}

/// An engine handle plus the layers it was built from.
#[derive(Debug)]
pub struct Environment<H> {
  handle: H,
  lineage: Lineage,
}

/// The layer history of an environment whose handle is currently lent to the engine.
#[derive(Debug)]
pub struct Lineage {
  layers: Vec<Layer>,
}

impl Lineage {
  /// Digest of the top layer.
  pub fn digest(&self) -> &ContentHash {
    // never empty: every lineage starts with a base layer
    &self.layers[self.layers.len() - 1].digest
  }

  pub fn layers(&self) -> &[Layer] {
    &self.layers
  }

  /// Attach the engine's new handle and record the layer that produced it.
  pub fn extend<H>(mut self, handle: H, description: String, digest: ContentHash) -> Environment<H> {
    self.layers.push(Layer { description, digest });
    Environment { handle, lineage: self }
  }
}

impl<H> Environment<H> {
  /// Environment for a freshly selected base image.
  pub fn base(handle: H, image: &str) -> Self {
    let mut builder = DigestBuilder::new();
    builder.record(&["base", image]);
    Self {
      handle,
      lineage: Lineage {
        layers: vec![Layer {
          description: format!("base {}", image),
          digest: builder.finish(),
        }],
      },
    }
  }

  /// Digest of the top layer.
  pub fn digest(&self) -> &ContentHash {
    self.lineage.digest()
  }

  pub fn layers(&self) -> &[Layer] {
    self.lineage.layers()
  }

  pub fn handle(&self) -> &H {
    &self.handle
  }

  /// Hand the engine handle out for the next operation.
  pub fn detach(self) -> (H, Lineage) {
    (self.handle, self.lineage)
  }
}
