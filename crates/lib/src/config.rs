//! Build configuration.
//!
//! Every option has a default, so a bare invocation builds `../src` into
//! `../embed` with yarn on `node:16`. Options are layered:
//! 1. built-in defaults
//! 2. a TOML file (`frontbuild.toml` or `--config <path>`)
//! 3. `FRONTBUILD_*` environment variables
//!
//! Relative host paths are resolved against the current directory, not the
//! config file's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{
  DEFAULT_BASE_IMAGE, DEFAULT_BUILD_COMMAND, DEFAULT_CONFIG_FILE, DEFAULT_DESTINATION_ROOT, DEFAULT_INSTALL_COMMAND,
  DEFAULT_MANIFEST_INCLUDE, DEFAULT_MOUNT_PATH, DEFAULT_OUTPUT_DIR, DEFAULT_PIPELINE_NAME, DEFAULT_SOURCE_EXCLUDE,
  DEFAULT_SOURCE_ROOT, DEFAULT_WORKDIR, ENV_DEST, ENV_ENGINE, ENV_IMAGE, ENV_LAYER_CACHE, ENV_SOURCE,
};
use crate::engine::{EngineKind, resolve_env_path};
use crate::error::PipelineStep;
use crate::projection::ProjectionSpec;
use crate::stage::Stage;

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {}", .0.display())]
  NotFound(PathBuf),

  #[error("failed to read {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid config {}: {message}", path.display())]
  Parse { path: PathBuf, message: String },

  #[error("invalid value in {var}: {message}")]
  Override { var: &'static str, message: String },

  #[error("invalid `{field}`: {message}")]
  Invalid { field: &'static str, message: String },
}

/// All options of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct BuildConfig {
  /// Host directory holding the frontend project.
  pub source_root: PathBuf,
  /// Host directory that receives the build output.
  pub destination_root: PathBuf,
  pub base_image: String,
  pub engine: EngineKind,
  /// Where the project is mounted inside the environment.
  pub mount_path: String,
  /// Working directory of both stages.
  pub workdir: String,
  /// Build output directory, relative to `workdir` unless absolute.
  pub output_dir: String,
  /// Name carried by the pipeline's log span.
  pub pipeline_name: String,
  pub manifest_include: Vec<String>,
  pub source_exclude: Vec<String>,
  pub install_command: Vec<String>,
  pub build_command: Vec<String>,
  /// Reuse cached layers between Docker runs.
  pub layer_cache: bool,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      source_root: PathBuf::from(DEFAULT_SOURCE_ROOT),
      destination_root: PathBuf::from(DEFAULT_DESTINATION_ROOT),
      base_image: DEFAULT_BASE_IMAGE.to_string(),
      engine: EngineKind::default(),
      mount_path: DEFAULT_MOUNT_PATH.to_string(),
      workdir: DEFAULT_WORKDIR.to_string(),
      output_dir: DEFAULT_OUTPUT_DIR.to_string(),
      pipeline_name: DEFAULT_PIPELINE_NAME.to_string(),
      manifest_include: owned(DEFAULT_MANIFEST_INCLUDE),
      source_exclude: owned(DEFAULT_SOURCE_EXCLUDE),
      install_command: owned(DEFAULT_INSTALL_COMMAND),
      build_command: owned(DEFAULT_BUILD_COMMAND),
      layer_cache: true,
    }
  }
}

fn owned(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

/// The fixed pipeline derived from a [`BuildConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
  pub base_image: String,
  pub manifest: ProjectionSpec,
  pub install: Stage,
  pub source: ProjectionSpec,
  pub build: Stage,
  /// Absolute in-environment path of the build output.
  pub output_path: String,
}

impl BuildConfig {
  /// Load, apply environment overrides and validate.
  ///
  /// With `path = None`, `frontbuild.toml` in the current directory is used
  /// if it exists. An explicit path must exist.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(path) => Self::from_file(path)?,
      None => {
        let default = Path::new(DEFAULT_CONFIG_FILE);
        if default.is_file() {
          Self::from_file(default)?
        } else {
          debug!(file = DEFAULT_CONFIG_FILE, "no config file, using defaults");
          Self::default()
        }
      }
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
  }

  /// Parse a TOML file. Missing keys take their defaults.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
      if source.kind() == std::io::ErrorKind::NotFound {
        ConfigError::NotFound(path.to_path_buf())
      } else {
        ConfigError::Read {
          path: path.to_path_buf(),
          source,
        }
      }
    })?;
    let config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      message: e.to_string().trim_end().to_string(),
    })?;
    debug!(path = %path.display(), "loaded config file");
    Ok(config)
  }

  /// Apply `FRONTBUILD_*` overrides. Empty values are ignored.
  pub fn apply_env(&mut self) -> Result<(), ConfigError> {
    if let Some(source) = env_value(ENV_SOURCE) {
      self.source_root = PathBuf::from(source);
    }
    if let Some(dest) = env_value(ENV_DEST) {
      self.destination_root = PathBuf::from(dest);
    }
    if let Some(engine) = env_value(ENV_ENGINE) {
      self.engine = engine
        .parse()
        .map_err(|message| ConfigError::Override { var: ENV_ENGINE, message })?;
    }
    if let Some(image) = env_value(ENV_IMAGE) {
      self.base_image = image;
    }
    if let Some(cache) = env_value(ENV_LAYER_CACHE) {
      self.layer_cache = parse_flag(&cache).map_err(|message| ConfigError::Override {
        var: ENV_LAYER_CACHE,
        message,
      })?;
    }
    Ok(())
  }

  /// Reject configurations that cannot describe a runnable pipeline.
  ///
  /// An empty manifest include list is accepted: the install stage then runs
  /// against an empty mount and fails on its own terms.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.base_image.trim().is_empty() {
      return Err(invalid("base_image", "must not be empty"));
    }
    if self.install_command.first().is_none_or(|program| program.is_empty()) {
      return Err(invalid("install_command", "must name a program"));
    }
    if self.build_command.first().is_none_or(|program| program.is_empty()) {
      return Err(invalid("build_command", "must name a program"));
    }
    if !self.mount_path.starts_with('/') {
      return Err(invalid("mount_path", "must be an absolute environment path"));
    }
    if !self.workdir.starts_with('/') {
      return Err(invalid("workdir", "must be an absolute environment path"));
    }
    if self.output_dir.trim().is_empty() {
      return Err(invalid("output_dir", "must not be empty"));
    }
    if self.source_root.as_os_str().is_empty() {
      return Err(invalid("source_root", "must not be empty"));
    }
    if self.destination_root.as_os_str().is_empty() {
      return Err(invalid("destination_root", "must not be empty"));
    }
    Ok(())
  }

  /// Derive the two projections, the two stages and the export path.
  pub fn plan(&self) -> Result<BuildPlan, ConfigError> {
    let output_path = resolve_env_path(&self.workdir, &self.output_dir).map_err(|e| invalid_owned("output_dir", e))?;
    let mount_path = resolve_env_path("/", &self.mount_path).map_err(|e| invalid_owned("mount_path", e))?;
    let workdir = resolve_env_path("/", &self.workdir).map_err(|e| invalid_owned("workdir", e))?;

    Ok(BuildPlan {
      base_image: self.base_image.clone(),
      manifest: ProjectionSpec::include(mount_path.clone(), self.manifest_include.clone()),
      install: Stage::new(
        "install",
        PipelineStep::Install,
        self.install_command.clone(),
        workdir.clone(),
      ),
      source: ProjectionSpec::exclude(mount_path, self.source_exclude.clone()),
      build: Stage::new("build", PipelineStep::Build, self.build_command.clone(), workdir),
      output_path,
    })
  }
}

fn env_value(var: &str) -> Option<String> {
  std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> Result<bool, String> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    other => Err(format!("expected true or false, got `{other}`")),
  }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
  ConfigError::Invalid {
    field,
    message: message.to_string(),
  }
}

fn invalid_owned(field: &'static str, err: impl std::fmt::Display) -> ConfigError {
  ConfigError::Invalid {
    field,
    message: err.to_string(),
  }
}
