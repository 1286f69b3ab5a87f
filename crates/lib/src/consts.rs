//! Application-wide constants and pipeline defaults.

pub const APP_NAME: &str = "frontbuild";

/// Config file looked up in the current directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "frontbuild.toml";

pub const DEFAULT_SOURCE_ROOT: &str = "../src";
pub const DEFAULT_DESTINATION_ROOT: &str = "../embed";
pub const DEFAULT_BASE_IMAGE: &str = "node:16";
pub const DEFAULT_PIPELINE_NAME: &str = "build";

/// Where project files land inside the environment.
pub const DEFAULT_MOUNT_PATH: &str = "/src";
pub const DEFAULT_WORKDIR: &str = "/src";

/// Build output directory, relative to the working directory.
pub const DEFAULT_OUTPUT_DIR: &str = "build";

/// Files that fully determine the install step's output.
pub const DEFAULT_MANIFEST_INCLUDE: &[&str] = &["package.json", "yarn.lock", "yarn", "vendor", ".yarnrc.yml"];

/// Directories produced by the install step.
pub const DEFAULT_SOURCE_EXCLUDE: &[&str] = &["node_modules", ".yarn"];

pub const DEFAULT_INSTALL_COMMAND: &[&str] = &["yarn", "install", "--immutable"];
pub const DEFAULT_BUILD_COMMAND: &[&str] = &["yarn", "build"];

/// Environment variable overrides, applied after the config file.
pub const ENV_SOURCE: &str = "FRONTBUILD_SOURCE";
pub const ENV_DEST: &str = "FRONTBUILD_DEST";
pub const ENV_ENGINE: &str = "FRONTBUILD_ENGINE";
pub const ENV_IMAGE: &str = "FRONTBUILD_IMAGE";
pub const ENV_LAYER_CACHE: &str = "FRONTBUILD_LAYER_CACHE";

/// January 1, 1980 00:00:00 UTC (ZIP epoch), for reproducible timestamps.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Length of the digest prefix shown in logs.
pub const DIGEST_DISPLAY_LEN: usize = 12;
