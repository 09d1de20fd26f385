//! Configuration view and validation commands: `containment config`.

use anyhow::{Context, Result};
use containment::config::{CONFIG_FILE_NAME, PipelineToml};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let (mut toml, path) = super::load_toml(cli)?;

            println!();
            println!("Containment Configuration");
            println!("=========================");
            println!();
            match &path {
                Some(path) => println!("Config file: {}", path.display()),
                None => {
                    println!("No {} found, using defaults.", CONFIG_FILE_NAME);
                    println!("Run 'containment config init' to create one.");
                }
            }
            println!();

            toml.apply_env(|key| std::env::var(key).ok());
            println!("Effective values (with environment overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&toml).context("Failed to serialize configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let (toml, path) = super::load_toml(cli)?;
            if path.is_none() {
                println!("No {} found. Using defaults.", CONFIG_FILE_NAME);
            }

            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();

            // Warnings are advisory; settings that make a run impossible are not.
            toml.check()?;
        }
        Some(ConfigCommands::Init { force }) => {
            let config_path = match &cli.config {
                Some(path) => path.clone(),
                None => std::env::current_dir()
                    .context("Failed to get current directory")?
                    .join(CONFIG_FILE_NAME),
            };

            if config_path.exists() && !force {
                println!("{} already exists.", config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            PipelineToml::default().save(&config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [params] references, reads, kmer, scaled, min_depth, plot");
            println!("  - [retry] max_attempts, memory_factor, oom_exit_codes");
            println!("  - [resources.<stage>] and [tools.<stage>] per pipeline stage");
            println!();
        }
    }

    Ok(())
}
