//! Stage implementations behind the executor's `NodeRunner` seam.
//!
//! Each stage renders its tool template, runs it through a `CommandRunner`
//! and checks what the tool left behind. Sketch-producing stages go through
//! the `SignatureStore` so a sketch is created at most once per run.

use crate::aggregate::{Aggregator, BranchStatus, SampleRecords};
use crate::config::{ParamsSection, PipelineToml, ResourceProfile, ToolsSection};
use crate::dag::{ArtifactKind, ArtifactRef, NodeRunner, RetryPolicy, Stage, TaskNode};
use crate::errors::TaskError;
use crate::layout::{ArtifactLayout, COMBINED_NAME};
use crate::records::RecordTable;
use crate::sketch::{SignatureStore, Sketch, SketchKey, SketchOrigin, SketchVariant};
use crate::tools::{CommandRunner, Invocation, TemplateVars};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const NO_PLOT_FLAG: &str = "--no-plot";

/// Runs task nodes by invoking the configured external tools.
pub struct StageRunner<C> {
    params: ParamsSection,
    tools: ToolsSection,
    launcher: Vec<String>,
    policy: RetryPolicy,
    layout: ArtifactLayout,
    store: Arc<SignatureStore>,
    commands: Arc<C>,
}

impl<C: CommandRunner> StageRunner<C> {
    pub fn new(
        config: &PipelineToml,
        layout: ArtifactLayout,
        store: Arc<SignatureStore>,
        commands: Arc<C>,
    ) -> Self {
        Self {
            params: config.params.clone(),
            tools: config.tools.clone(),
            launcher: config.execution.launcher.clone(),
            policy: RetryPolicy::from_config(&config.retry),
            layout,
            store,
            commands,
        }
    }

    pub fn store(&self) -> &Arc<SignatureStore> {
        &self.store
    }

    fn vars(&self, node: &TaskNode, resources: ResourceProfile) -> TemplateVars {
        TemplateVars::new(&self.params, resources).set("name", owner(node))
    }

    /// Run the stage's tool once and classify its exit.
    async fn invoke(
        &self,
        node: &TaskNode,
        vars: TemplateVars,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let invocation = Invocation::build(
            node.stage,
            node.sample.as_deref(),
            self.tools.for_stage(node.stage),
            &self.launcher,
            &vars,
            resources,
            attempt,
        );
        let outcome = self.commands.run(&invocation, cancel).await?;
        debug!(
            node = %node.id,
            exit = %outcome.exit,
            elapsed_ms = outcome.duration.as_millis() as u64,
            "Tool exited"
        );
        outcome.into_result(&invocation, &self.policy)
    }

    async fn sketch(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let input = required_input(node, ArtifactKind::Sequence)?;
        let output = required_output(node, ArtifactKind::Sketch)?;
        let key = if node.stage == Stage::SketchReference {
            SketchKey::reference(&output.owner)
        } else {
            SketchKey::base(&output.owner)
        };

        let sketch = self
            .store
            .get_or_build(&key, || async {
                prepare_output(&output.path)?;
                let vars = self
                    .vars(node, resources)
                    .set_path("input", &input.path)
                    .set_path("output", &output.path);
                self.invoke(node, vars, attempt, resources, cancel).await?;
                require_file(&output.path)?;
                Ok::<_, TaskError>(Sketch {
                    owner: output.owner.clone(),
                    path: output.path.clone(),
                    origin: SketchOrigin::Built,
                })
            })
            .await?;
        Ok(vec![sketch.path.clone()])
    }

    async fn filter(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let input = self.sketch_for(required_input(node, ArtifactKind::Sketch)?)?;
        let output = required_output(node, ArtifactKind::Sketch)?;
        let key = SketchKey::filtered(&output.owner);

        let sketch = self
            .store
            .get_or_build(&key, || async {
                prepare_output(&output.path)?;
                if self.params.filter_is_noop() {
                    tokio::fs::copy(input.path(), &output.path)
                        .await
                        .map_err(|source| TaskError::Artifact {
                            path: output.path.clone(),
                            source,
                        })?;
                } else {
                    let vars = self
                        .vars(node, resources)
                        .set_path("input", input.path())
                        .set_path("output", &output.path);
                    self.invoke(node, vars, attempt, resources, cancel).await?;
                    require_file(&output.path)?;
                }
                Ok::<_, TaskError>(Sketch {
                    owner: output.owner.clone(),
                    path: output.path.clone(),
                    origin: SketchOrigin::Filtered,
                })
            })
            .await?;
        Ok(vec![sketch.path.clone()])
    }

    async fn search(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let [query, reference] = node.inputs.as_slice() else {
            return Err(malformed(node, "expected a query and a reference sketch"));
        };
        let query = self.sketch_for(query)?;
        let reference = self.sketch_for(reference)?;
        let output = required_output(node, ArtifactKind::Records)?;

        prepare_output(&output.path)?;
        let vars = self
            .vars(node, resources)
            .set_path("query", query.path())
            .set_path("reference", reference.path())
            .set_path("output", &output.path);
        self.invoke(node, vars, attempt, resources, cancel).await?;

        require_file(&output.path)?;
        let records = RecordTable::read(&output.path)?.records();
        for record in &records {
            debug!(
                node = %node.id,
                query = %record.query_name,
                containment = record.containment,
                "Containment hit"
            );
        }
        let best = records
            .iter()
            .max_by(|a, b| a.containment.total_cmp(&b.containment));
        info!(
            node = %node.id,
            records = records.len(),
            best = best.map(|r| r.query_name.as_str()),
            best_containment = best.map(|r| r.containment),
            "Containment search finished"
        );
        Ok(vec![output.path.clone()])
    }

    async fn render_sample(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let input = required_input(node, ArtifactKind::Records)?;
        let csv = required_output(node, ArtifactKind::Records)?;
        let name = owner(node);

        let records = RecordTable::read(&input.path)?;
        let plotted = self.params.plot && !records.is_empty();
        let plot = match node.output(ArtifactKind::Plot) {
            Some(plot) if plotted => plot.path.clone(),
            _ => self.layout.render_scratch(name, "png"),
        };

        prepare_output(&csv.path)?;
        prepare_output(&plot)?;
        let vars = self
            .vars(node, resources)
            .set_list("inputs", vec![input.path.to_string_lossy().into_owned()])
            .set_path("output_csv", &csv.path)
            .set_path("output_plot", &plot)
            .set_list("plot_flag", plot_flag(plotted));
        self.invoke(node, vars, attempt, resources, cancel).await?;

        require_file(&csv.path)?;
        RecordTable::read(&csv.path)?;

        let mut outputs = vec![csv.path.clone()];
        if plotted {
            require_file(&plot)?;
            outputs.push(plot);
        }
        Ok(outputs)
    }

    async fn render_combined(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let branches: Vec<BranchStatus> = node
            .inputs
            .iter()
            .map(|input| BranchStatus {
                sample: input.owner.clone(),
                succeeded: input.path.is_file(),
            })
            .collect();
        Aggregator::ensure_ready(&branches)?;

        let inputs: Vec<SampleRecords> = node
            .inputs
            .iter()
            .map(|input| SampleRecords::new(&input.owner, &input.path))
            .collect();
        let combined = Aggregator::merge(&inputs)?;

        let csv = required_output(node, ArtifactKind::Records)?;
        combined.write(&csv.path)?;
        info!(
            samples = combined.samples.len(),
            records = combined.table.len(),
            path = %csv.path.display(),
            "Combined records written"
        );

        let mut outputs = vec![csv.path.clone()];
        let Some(plot) = node.output(ArtifactKind::Plot) else {
            return Ok(outputs);
        };
        if combined.is_empty() {
            debug!("No combined records, skipping combined plot");
            return Ok(outputs);
        }

        // The renderer's own table goes to scratch; the merged one is published.
        let scratch = self.layout.render_scratch(COMBINED_NAME, "csv");
        prepare_output(&scratch)?;
        prepare_output(&plot.path)?;
        let vars = self
            .vars(node, resources)
            .set_list(
                "inputs",
                inputs
                    .iter()
                    .map(|i| i.path.to_string_lossy().into_owned())
                    .collect(),
            )
            .set_path("output_csv", &scratch)
            .set_path("output_plot", &plot.path)
            .set_list("plot_flag", plot_flag(true));
        self.invoke(node, vars, attempt, resources, cancel).await?;

        require_file(&plot.path)?;
        outputs.push(plot.path.clone());
        Ok(outputs)
    }

    /// The store's sketch for an input handle. Dependencies have completed by
    /// the time a node runs, so a missing sketch means the graph is broken.
    fn sketch_for(&self, artifact: &ArtifactRef) -> Result<Arc<Sketch>, TaskError> {
        [
            SketchVariant::Filtered,
            SketchVariant::Base,
            SketchVariant::Reference,
        ]
        .into_iter()
        .filter_map(|variant| {
            self.store.get(&SketchKey {
                owner: artifact.owner.clone(),
                variant,
            })
        })
        .find(|sketch| sketch.path == artifact.path)
        .ok_or_else(|| TaskError::Artifact {
            path: artifact.path.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "sketch was never created"),
        })
    }
}

#[async_trait]
impl<C: CommandRunner> NodeRunner for StageRunner<C> {
    async fn run_node(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError> {
        info!(
            node = %node.id,
            attempt,
            memory_mb = resources.memory_mb,
            "Running stage"
        );
        match node.stage {
            Stage::SketchReference | Stage::SketchSample => {
                self.sketch(node, attempt, resources, cancel).await
            }
            Stage::FilterAbundance => self.filter(node, attempt, resources, cancel).await,
            Stage::SearchContainment => self.search(node, attempt, resources, cancel).await,
            Stage::RenderSample => self.render_sample(node, attempt, resources, cancel).await,
            Stage::RenderCombined => self.render_combined(node, attempt, resources, cancel).await,
        }
    }
}

fn owner(node: &TaskNode) -> &str {
    node.outputs
        .first()
        .map(|o| o.owner.as_str())
        .unwrap_or_default()
}

fn plot_flag(plotted: bool) -> Vec<String> {
    if plotted {
        Vec::new()
    } else {
        vec![NO_PLOT_FLAG.to_string()]
    }
}

fn malformed(node: &TaskNode, what: &str) -> TaskError {
    TaskError::Artifact {
        path: PathBuf::from(&node.id),
        source: io::Error::new(io::ErrorKind::InvalidInput, what.to_string()),
    }
}

fn required_input(node: &TaskNode, kind: ArtifactKind) -> Result<&ArtifactRef, TaskError> {
    node.input(kind)
        .ok_or_else(|| malformed(node, &format!("missing {:?} input", kind)))
}

fn required_output(node: &TaskNode, kind: ArtifactKind) -> Result<&ArtifactRef, TaskError> {
    node.output(kind)
        .ok_or_else(|| malformed(node, &format!("missing {:?} output", kind)))
}

fn prepare_output(path: &Path) -> Result<(), TaskError> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent).map_err(|source| TaskError::Artifact {
            path: parent.to_path_buf(),
            source,
        }),
        None => Ok(()),
    }
}

fn require_file(path: &Path) -> Result<(), TaskError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(TaskError::Artifact {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::NotFound,
                "tool exited successfully without writing it",
            ),
        })
    }
}
