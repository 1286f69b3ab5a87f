//! frontbuild-lib: reproducible frontend builds in an isolated environment
//!
//! This crate provides the build pipeline used by the `frontbuild` binary:
//! - `config`: layered build configuration and the plan derived from it
//! - `projection`: filtered, deterministic selection of host files
//! - `engine`: the execution engine interface and its Docker, host and in-memory engines
//! - `pipeline`: the fixed install/build sequence and its report

pub mod clean;
pub mod config;
pub mod consts;
pub mod engine;
pub mod environment;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod paths;
pub mod pipeline;
pub mod projection;
pub mod stage;
pub mod util;

pub use config::{BuildConfig, BuildPlan, ConfigError};
pub use error::{BuildError, PipelineStep};
pub use pipeline::{BuildReport, Pipeline};
