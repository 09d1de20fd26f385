//! `tracing` subscriber setup.
//!
//! Console output goes to stderr. When a log file is given, everything at
//! `info` (or `debug` with `--verbose`) is also written there through a
//! non-blocking appender; keep the returned guard alive until exit.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub format: LogFormat,
    /// Only warnings reach the console (a progress display owns it)
    pub quiet_console: bool,
    pub file: Option<PathBuf>,
}

impl LogOptions {
    fn console_directive(&self) -> &'static str {
        match (self.verbose, self.quiet_console) {
            (true, _) => "debug",
            (false, true) => "warn",
            (false, false) => "info",
        }
    }

    fn file_directive(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }
}

/// `RUST_LOG` wins over the built-in default.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    }
}

/// Install the global subscriber.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let console = format_layer(options.format, std::io::stderr, true)
        .with_filter(env_filter(options.console_directive()));

    let (file, guard) = match &options.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, name));
            let layer = format_layer(options.format, writer, false)
                .with_filter(env_filter(options.file_directive()));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_level_follows_flags() {
        let mut options = LogOptions::default();
        assert_eq!(options.console_directive(), "info");

        options.quiet_console = true;
        assert_eq!(options.console_directive(), "warn");
        assert_eq!(options.file_directive(), "info");

        options.verbose = true;
        assert_eq!(options.console_directive(), "debug");
        assert_eq!(options.file_directive(), "debug");
    }
}
