//! Shared utilities.
//!
//! Content hashing for layer digests, blocking-pool bridging, and test helpers.

pub mod hash;
pub mod task;

#[cfg(test)]
pub mod testutil;
