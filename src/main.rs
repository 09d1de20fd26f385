use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use containment::logging::LogFormat;
use containment::ui::UiMode;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "containment")]
#[command(version, about = "Estimate how much of each reference is contained in sequencing samples")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to containment.toml (defaults to ./containment.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Inputs and parameters shared by `run` and `plan`.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Reference sequences (FASTA) or a pre-built reference sketch
    #[arg(long)]
    pub references: Option<PathBuf>,

    /// A sample file, or a directory of sample files
    #[arg(long)]
    pub reads: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    pub outdir: Option<PathBuf>,

    /// K-mer size
    #[arg(long)]
    pub kmer: Option<u32>,

    /// Sketch resolution (keep 1 in N hashes)
    #[arg(long)]
    pub scaled: Option<u32>,

    /// Drop sample hashes seen fewer than N times
    #[arg(long)]
    pub min_depth: Option<u32>,

    /// Minimum containment to report
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Skip plot rendering
    #[arg(long)]
    pub no_plot: bool,

    /// Maximum concurrent nodes
    #[arg(long)]
    pub max_parallel: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the containment pipeline
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Cancel remaining nodes on the first terminal failure
        #[arg(long)]
        fail_fast: bool,

        /// UI output mode
        #[arg(long, value_enum, default_value_t = UiMode::Full)]
        ui: UiMode,
    },
    /// Show the task graph a run would execute, without running it
    Plan {
        #[command(flatten)]
        args: RunArgs,

        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default containment.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run {
            args,
            fail_fast,
            ui,
        } => cmd::cmd_run(cli, args, *fail_fast, *ui).await,
        Commands::Plan { args, json } => cmd::cmd_plan(cli, args, *json),
        Commands::Config { command } => cmd::cmd_config(cli, command.clone()),
    }
}
