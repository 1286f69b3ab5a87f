//! Implementation of `frontbuild build`, also run by a bare `frontbuild`.
//!
//! Loads the configuration, runs the pipeline on the configured engine and
//! prints a summary of what was exported.

use std::path::Path;

use anyhow::{Context, Result};

use frontbuild_lib::{BuildConfig, Pipeline};

use crate::output::{OutputFormat, format_duration, print_json, print_stat, print_success, truncate_hash};

pub fn cmd_build(config: Option<&Path>, format: OutputFormat) -> Result<()> {
  let config = BuildConfig::load(config).context("Failed to load configuration")?;
  let pipeline = Pipeline::new(config).context("Invalid configuration")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(pipeline.run()).context("Build failed")?;

  if format.is_json() {
    return print_json(&report);
  }

  print_success(&format!(
    "exported {} file(s) to {}",
    report.files_exported,
    report.destination.display()
  ));
  for stage in &report.stages {
    let took = format_duration(stage.duration);
    if stage.cached {
      print_stat(&stage.name, &format!("{took} (cached)"));
    } else {
      print_stat(&stage.name, &took);
    }
  }
  if let Some(top) = report.layers.last() {
    print_stat("layer", truncate_hash(&top.digest.0));
  }
  print_stat("output", truncate_hash(&report.output_digest.0));
  print_stat("total", &format_duration(report.elapsed));

  Ok(())
}
