//! End-to-end run: resolve inputs, build the graph, execute it and publish
//! the run summary.

use crate::config::PipelineConfig;
use crate::dag::{
    DagBuilder, DagConfig, DagExecutor, DagScheduler, ExecutionResult, NodeEvent, RetryPolicy,
    RunGraph, RunState,
};
use crate::errors::PipelineError;
use crate::input::{InputResolver, ResolvedInputs};
use crate::layout::ArtifactLayout;
use crate::sketch::{SignatureStore, SketchKey};
use crate::stages::StageRunner;
use crate::tools::{CommandRunner, ProcessRunner};
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What a run would do, computed without executing anything.
#[derive(Debug, Serialize)]
pub struct RunPlan {
    pub inputs: ResolvedInputs,
    pub graph: RunGraph,
    /// Node ids grouped by the earliest point they can start
    pub waves: Vec<Vec<String>>,
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct RunReport {
    pub result: ExecutionResult,
    pub summary_path: PathBuf,
}

/// A configured containment run.
pub struct Pipeline<C = ProcessRunner> {
    config: PipelineConfig,
    layout: ArtifactLayout,
    commands: Arc<C>,
    events: Option<mpsc::Sender<NodeEvent>>,
}

impl Pipeline<ProcessRunner> {
    /// A pipeline running the configured tools as child processes.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_command_runner(config, Arc::new(ProcessRunner::new()))
    }
}

impl<C: CommandRunner> Pipeline<C> {
    pub fn with_command_runner(config: PipelineConfig, commands: Arc<C>) -> Self {
        let layout = config.layout();
        Self {
            config,
            layout,
            commands,
            events: None,
        }
    }

    /// Forward executor events (for progress display).
    pub fn with_event_channel(mut self, tx: mpsc::Sender<NodeEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Resolve inputs and build the run graph.
    pub fn plan(&self) -> Result<RunPlan, PipelineError> {
        let inputs = InputResolver::new(&self.config.toml.inputs)
            .resolve(&self.config.references, &self.config.reads)?;
        info!(
            reference = %inputs.reference.path.display(),
            presketched = inputs.reference.is_presketched(),
            samples = inputs.samples.len(),
            "Resolved inputs"
        );

        let graph = DagBuilder::new(&inputs, &self.layout, &self.config.toml).build()?;
        let graph = Arc::new(graph);
        let waves = DagScheduler::new(Arc::clone(&graph)).compute_waves();
        let graph = Arc::try_unwrap(graph)
            .map_err(|_| anyhow::anyhow!("Run graph is still shared after planning"))?;

        Ok(RunPlan {
            inputs,
            graph,
            waves,
        })
    }

    /// Execute the run to completion.
    ///
    /// Inputs are resolved before anything executes. Every node is accounted
    /// for in `run_summary.json`, whatever the outcome.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, PipelineError> {
        let plan = self.plan()?;
        self.execute(plan, cancel).await
    }

    /// Execute a plan produced by [`Pipeline::plan`]. The output tree is
    /// created here, not during planning.
    pub async fn execute(
        &self,
        plan: RunPlan,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        self.config.ensure_directories()?;

        let store = Arc::new(seed_store(&plan.inputs));
        let runner = StageRunner::new(
            &self.config.toml,
            self.layout.clone(),
            store,
            Arc::clone(&self.commands),
        );

        let execution = &self.config.toml.execution;
        let dag_config = DagConfig::default()
            .with_max_parallel(execution.max_parallel)
            .with_fail_fast(execution.fail_fast);
        let policy = RetryPolicy::from_config(&self.config.toml.retry);

        let mut executor = DagExecutor::new(Arc::new(runner), dag_config, policy);
        if let Some(tx) = &self.events {
            executor = executor.with_event_channel(tx.clone());
        }

        let result = executor.execute(Arc::new(plan.graph), cancel).await;

        let summary_path = self.layout.summary_file();
        if let Err(e) = write_summary(&summary_path, &result) {
            warn!(error = %e, "Failed to write run summary");
        }

        match result.state {
            RunState::Completed => Ok(RunReport {
                result,
                summary_path,
            }),
            RunState::Cancelled => Err(PipelineError::Cancelled),
            _ => Err(PipelineError::RunFailed(result.failures)),
        }
    }
}

/// Register user-supplied sketches so stages find them in the store.
fn seed_store(inputs: &ResolvedInputs) -> SignatureStore {
    let store = SignatureStore::new();
    let reference = &inputs.reference;
    if reference.is_presketched() {
        store.supply(SketchKey::reference(&reference.id), reference.path.clone());
    }
    for sample in inputs.samples.iter().filter(|s| s.is_presketched()) {
        store.supply(SketchKey::base(&sample.id), sample.path.clone());
    }
    store
}

fn write_summary(path: &std::path::Path, result: &ExecutionResult) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&result.summary)
        .context("Failed to serialize run summary")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
    Ok(())
}
