//! Pipeline execution: `containment run`.

use anyhow::Result;
use containment::dag::NodeEvent;
use containment::errors::PipelineError;
use containment::logging::{self, LogOptions};
use containment::pipeline::Pipeline;
use containment::ui::icons::FOLDER;
use containment::ui::progress::format_duration;
use containment::ui::{RunUI, UiMode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::super::{Cli, RunArgs};

pub async fn cmd_run(cli: &Cli, args: &RunArgs, fail_fast: bool, ui_mode: UiMode) -> Result<()> {
    let config = super::load_config(cli, args, fail_fast)?;
    let layout = config.layout();

    let (event_tx, mut event_rx) = mpsc::channel::<NodeEvent>(256);
    let pipeline = Pipeline::new(config).with_event_channel(event_tx);

    // Bad inputs are reported before the output tree or log file exist.
    let plan = pipeline.plan()?;

    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        quiet_console: ui_mode == UiMode::Full,
        file: Some(layout.log_file()),
    })?;

    let config = pipeline.config();
    for warning in config.toml.validate() {
        warn!(%warning, "Configuration warning");
    }
    info!(
        references = %config.references.display(),
        reads = %config.reads.display(),
        outdir = %config.outdir.display(),
        samples = plan.inputs.samples.len(),
        nodes = plan.graph.len(),
        kmer = config.params().kmer,
        scaled = config.params().scaled,
        min_depth = config.params().min_depth,
        plot = config.params().plot,
        "Starting containment run"
    );

    let run_ui = Arc::new(RunUI::new(ui_mode, cli.verbose));
    let display_handle = {
        let run_ui = Arc::clone(&run_ui);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                run_ui.handle_event(&event);
            }
        })
    };

    let cancel = CancellationToken::new();
    let interrupt_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                cancel.cancel();
            }
        })
    };

    let outcome = pipeline.execute(plan, cancel).await;
    interrupt_handle.abort();

    // Dropping the pipeline closes the event channel so the display drains.
    drop(pipeline);
    display_handle.await.ok();

    match outcome {
        Ok(report) => {
            if ui_mode == UiMode::Json {
                let final_state = serde_json::json!({
                    "type": "final",
                    "success": true,
                    "duration_secs": report.result.duration.as_secs_f64(),
                    "completed": report.result.summary.completed,
                    "retries": report.result.summary.retries,
                    "outdir": layout.outdir(),
                    "summary": report.summary_path,
                });
                println!("{}", final_state);
            } else {
                println!(
                    "{}Results in {} ({})",
                    FOLDER,
                    layout.outdir().display(),
                    format_duration(report.result.duration)
                );
                if layout.combined_csv().is_file() {
                    println!("  combined table: {}", layout.combined_csv().display());
                }
                println!("  run summary:    {}", report.summary_path.display());
            }
            Ok(())
        }
        Err(e) => {
            match &e {
                PipelineError::RunFailed(failures) => {
                    for failure in failures {
                        error!(
                            node = %failure.node,
                            attempts = failure.attempts,
                            error = %failure.error,
                            "Node failed"
                        );
                    }
                    eprintln!("Run summary: {}", layout.summary_file().display());
                }
                PipelineError::Cancelled => {
                    eprintln!("Completed artifacts were kept in {}", layout.outdir().display());
                }
                _ => {}
            }
            Err(e.into())
        }
    }
}
