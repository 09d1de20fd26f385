//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `run`     | `Run`            |
//! | `plan`    | `Plan`           |
//! | `config`  | `Config`         |

pub mod config;
pub mod plan;
pub mod run;

pub use config::cmd_config;
pub use plan::cmd_plan;
pub use run::cmd_run;

use anyhow::{Context, Result};
use containment::config::{CliOverrides, PipelineConfig, PipelineToml};
use std::path::PathBuf;

use super::{Cli, RunArgs};

/// Load `containment.toml` from `--config` or the working directory.
pub fn load_toml(cli: &Cli) -> Result<(PipelineToml, Option<PathBuf>)> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    PipelineToml::discover(cli.config.as_deref(), &cwd)
}

/// Resolve file, environment and CLI layers into a run configuration.
pub fn load_config(cli: &Cli, args: &RunArgs, fail_fast: bool) -> Result<PipelineConfig> {
    let (toml, _) = load_toml(cli)?;
    let overrides = CliOverrides {
        references: args.references.clone(),
        reads: args.reads.clone(),
        outdir: args.outdir.clone(),
        kmer: args.kmer,
        scaled: args.scaled,
        min_depth: args.min_depth,
        threshold: args.threshold,
        no_plot: args.no_plot,
        max_parallel: args.max_parallel,
        fail_fast,
        verbose: cli.verbose,
    };
    Ok(PipelineConfig::resolve(toml, overrides)?)
}
