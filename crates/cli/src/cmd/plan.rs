//! Implementation of `frontbuild plan`.
//!
//! Prints the fully resolved configuration (defaults, config file and
//! environment overrides applied) and the stages it expands to, without
//! touching the destination or the engine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use frontbuild_lib::paths::BuildRequest;
use frontbuild_lib::{BuildConfig, Pipeline};

use crate::output::{OutputFormat, print_info, print_json, print_stat};

#[derive(Debug, Serialize)]
struct PlanSummary<'a> {
  engine: &'static str,
  base_image: &'a str,
  source_root: PathBuf,
  destination_root: PathBuf,
  mount_path: &'a str,
  manifest_include: &'a [String],
  install: &'a [String],
  source_exclude: &'a [String],
  build: &'a [String],
  workdir: &'a str,
  output_path: &'a str,
  layer_cache: bool,
}

pub fn cmd_plan(config: Option<&Path>, format: OutputFormat) -> Result<()> {
  let config = BuildConfig::load(config).context("Failed to load configuration")?;
  let pipeline = Pipeline::new(config).context("Invalid configuration")?;
  let config = pipeline.config();
  let plan = pipeline.plan();
  let request =
    BuildRequest::resolve(&config.source_root, &config.destination_root).context("Failed to resolve paths")?;

  let summary = PlanSummary {
    engine: config.engine.as_str(),
    base_image: &plan.base_image,
    source_root: request.source_root().to_path_buf(),
    destination_root: request.destination_root().to_path_buf(),
    mount_path: &plan.manifest.mount_path,
    manifest_include: plan.manifest.filter.patterns(),
    install: plan.install.command(),
    source_exclude: plan.source.filter.patterns(),
    build: plan.build.command(),
    workdir: plan.build.workdir(),
    output_path: &plan.output_path,
    layer_cache: config.layer_cache,
  };

  if format.is_json() {
    return print_json(&summary);
  }

  print_info(&format!("{} on {} ({} engine)", config.pipeline_name, summary.base_image, summary.engine));
  print_stat("source", &summary.source_root.display().to_string());
  print_stat("destination", &summary.destination_root.display().to_string());
  print_stat("mount", summary.mount_path);
  print_stat("manifest", &summary.manifest_include.join(", "));
  print_stat("install", &summary.install.join(" "));
  print_stat("exclude", &summary.source_exclude.join(", "));
  print_stat("build", &summary.build.join(" "));
  print_stat("output", summary.output_path);
  print_stat("layer cache", if summary.layer_cache { "on" } else { "off" });

  Ok(())
}
