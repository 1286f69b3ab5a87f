mod cmd;
mod output;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use frontbuild_lib::BuildError;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::output::{OutputFormat, print_error, print_output_tail};

/// Lines of stage output echoed when a stage fails.
const FAILURE_TAIL_LINES: usize = 20;

/// frontbuild - reproducible frontend builds in an isolated environment
#[derive(Parser)]
#[command(name = "frontbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Config file (default: frontbuild.toml in the current directory, if present)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Install dependencies, build, and export the output (the default)
  Build,

  /// Show the resolved configuration without running anything
  Plan,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let config = cli.config.as_deref();
  let result = match cli.command.unwrap_or(Commands::Build) {
    Commands::Build => cmd::cmd_build(config, cli.output),
    Commands::Plan => cmd::cmd_plan(config, cli.output),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      let build_err = err.downcast_ref::<BuildError>();
      match build_err {
        Some(build_err) => error!(step = %build_err.step(), "{:#}", err),
        None => error!("{:#}", err),
      }
      print_error(&format!("{:#}", err));
      if let Some(tail) = build_err.and_then(|e| e.output_tail(FAILURE_TAIL_LINES)) {
        print_output_tail(&tail);
      }
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(verbose: bool) {
  let default_level = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_ansi(std::io::stderr().is_terminal())
    .without_time()
    .init();
}
