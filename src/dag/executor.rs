//! DAG executor for running task nodes in parallel.
//!
//! The executor starts every node whose dependencies have succeeded, up to
//! `max_parallel` at once, and joins the spawned tasks as they finish. A task
//! that panics is a terminal failure of its node. Retries happen inside the
//! spawned task so a node in backoff holds its slot without blocking other
//! branches.

use super::builder::RunGraph;
use super::node::{NodeIndex, Stage, TaskNode};
use super::retry::{RetryMachine, RetryPolicy, Transition};
use super::scheduler::{DagConfig, DagScheduler};
use super::state::{ExecutionTimer, NodeResult, RunState, RunSummary};
use crate::config::ResourceProfile;
use crate::errors::{StageFailure, TaskError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs one attempt of a node.
#[async_trait]
pub trait NodeRunner: Send + Sync + 'static {
    /// Execute `node` with the given resources and return the artifacts it
    /// produced. Implementations must return promptly with
    /// `TaskError::Cancelled` once `cancel` fires.
    async fn run_node(
        &self,
        node: &TaskNode,
        attempt: u32,
        resources: ResourceProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TaskError>;
}

/// Events emitted during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    /// The graph was built and execution is about to start.
    GraphReady {
        nodes: usize,
        samples: usize,
        waves: Vec<Vec<String>>,
    },
    /// An attempt of a node has started.
    Started {
        node: String,
        stage: Stage,
        sample: Option<String>,
        attempt: u32,
        memory_mb: u64,
    },
    /// A node failed recoverably and will run again after a backoff.
    Retrying {
        node: String,
        attempt: u32,
        max_attempts: u32,
        backoff_ms: u64,
        memory_mb: u64,
        reason: String,
    },
    /// A node finished (success or terminal failure).
    Completed {
        node: String,
        result: Box<NodeResult>,
    },
    /// A node will not run because a dependency failed.
    Skipped { node: String, reason: String },
    /// A node was cancelled before or while running.
    Cancelled { node: String },
    /// Execution finished.
    RunCompleted { success: bool, summary: RunSummary },
}

/// Result of executing a run graph.
#[derive(Debug)]
pub struct ExecutionResult {
    pub state: RunState,
    pub summary: RunSummary,
    /// Terminal node failures, in the order they happened
    pub failures: Vec<StageFailure>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// What a spawned node task reports back to the loop.
struct Outcome {
    index: NodeIndex,
    attempts: u32,
    memory_mb: u64,
    duration: Duration,
    result: Result<Vec<PathBuf>, TaskError>,
}

/// Latest attempt of a running node, readable after its task died.
struct AttemptTracker {
    started: Instant,
    attempt: AtomicU32,
    memory_mb: AtomicU64,
}

impl AttemptTracker {
    fn new(memory_mb: u64) -> Self {
        Self {
            started: Instant::now(),
            attempt: AtomicU32::new(0),
            memory_mb: AtomicU64::new(memory_mb),
        }
    }

    fn record(&self, attempt: u32, memory_mb: u64) {
        self.attempt.store(attempt, Ordering::SeqCst);
        self.memory_mb.store(memory_mb, Ordering::SeqCst);
    }

    /// Outcome for a node whose task ended without reporting one.
    fn outcome(&self, node: &TaskNode, error: JoinError) -> Outcome {
        Outcome {
            index: node.index,
            attempts: self.attempt.load(Ordering::SeqCst).max(1),
            memory_mb: self.memory_mb.load(Ordering::SeqCst),
            duration: self.started.elapsed(),
            result: Err(TaskError::Panicked {
                stage: node.stage,
                message: panic_message(error),
            }),
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// The DAG executor runs nodes in parallel while respecting dependencies.
pub struct DagExecutor<R> {
    runner: Arc<R>,
    config: DagConfig,
    policy: RetryPolicy,
    event_tx: Option<mpsc::Sender<NodeEvent>>,
}

impl<R: NodeRunner> DagExecutor<R> {
    pub fn new(runner: Arc<R>, config: DagConfig, policy: RetryPolicy) -> Self {
        Self {
            runner,
            config,
            policy,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<NodeEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Execute every node of the graph.
    ///
    /// Cancelling `cancel` stops scheduling, interrupts running nodes and
    /// leaves already-produced artifacts in place.
    pub async fn execute(&self, graph: Arc<RunGraph>, cancel: CancellationToken) -> ExecutionResult {
        let timer = ExecutionTimer::start();
        let mut scheduler = DagScheduler::new(Arc::clone(&graph));
        let mut summary = RunSummary::new(scheduler.node_count());
        let mut failures = Vec::new();

        let waves = scheduler.compute_waves();
        info!(
            nodes = graph.len(),
            samples = graph.samples().len(),
            waves = waves.len(),
            "Executing task graph"
        );
        for (i, wave) in waves.iter().enumerate() {
            debug!(wave = i, nodes = ?wave, "Wave");
        }
        self.emit_event(NodeEvent::GraphReady {
            nodes: graph.len(),
            samples: graph.samples().len(),
            waves,
        })
        .await;

        // Fires on external cancellation, or on the first failure in fail-fast mode.
        let run_token = cancel.child_token();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut active: HashMap<task::Id, (NodeIndex, Arc<AttemptTracker>)> = HashMap::new();

        loop {
            if run_token.is_cancelled() {
                for node in scheduler.cancel_pending() {
                    summary.mark_cancelled(&node);
                    self.emit_event(NodeEvent::Cancelled { node }).await;
                }
            } else {
                let capacity = self.config.max_parallel.saturating_sub(active.len());
                let ready: Vec<TaskNode> = scheduler
                    .ready_nodes()
                    .into_iter()
                    .take(capacity)
                    .cloned()
                    .collect();

                for node in ready {
                    scheduler.mark_running(node.index);
                    let index = node.index;
                    let tracker = Arc::new(AttemptTracker::new(node.resources.memory_mb));
                    let handle = tasks.spawn(run_with_retry(
                        node,
                        Arc::clone(&self.runner),
                        self.policy.clone(),
                        run_token.clone(),
                        self.event_tx.clone(),
                        Arc::clone(&tracker),
                    ));
                    active.insert(handle.id(), (index, tracker));
                }
            }

            if active.is_empty() {
                break;
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    active.remove(&id);
                    outcome
                }
                Err(error) => {
                    let Some((index, tracker)) = active.remove(&error.id()) else {
                        continue;
                    };
                    let Some(node) = graph.node(index) else {
                        continue;
                    };
                    tracker.outcome(node, error)
                }
            };

            let Some(node) = graph.node(outcome.index) else {
                continue;
            };

            match outcome.result {
                Ok(outputs) => {
                    scheduler.mark_completed(node.index, outcome.attempts);
                    let result = NodeResult::success(
                        &node.id,
                        node.stage,
                        node.sample.as_deref(),
                        outcome.attempts,
                        outcome.memory_mb,
                        outputs,
                        outcome.duration,
                    );
                    info!(node = %node.id, attempts = outcome.attempts, "Node completed");
                    self.emit_event(NodeEvent::Completed {
                        node: node.id.clone(),
                        result: Box::new(result.clone()),
                    })
                    .await;
                    summary.add_result(result);
                }
                Err(error) if error.is_cancelled() => {
                    scheduler.mark_cancelled(node.index);
                    summary.mark_cancelled(&node.id);
                    debug!(node = %node.id, "Node cancelled");
                    self.emit_event(NodeEvent::Cancelled {
                        node: node.id.clone(),
                    })
                    .await;
                }
                Err(error) => {
                    let message = error.to_string();
                    warn!(
                        node = %node.id,
                        attempts = outcome.attempts,
                        error = %message,
                        "Node failed"
                    );
                    let skipped = scheduler.mark_failed(node.index, &message, outcome.attempts);
                    let result = NodeResult::failure(
                        &node.id,
                        node.stage,
                        node.sample.as_deref(),
                        &message,
                        outcome.attempts,
                        outcome.memory_mb,
                        outcome.duration,
                    );
                    self.emit_event(NodeEvent::Completed {
                        node: node.id.clone(),
                        result: Box::new(result.clone()),
                    })
                    .await;
                    summary.add_result(result);

                    for skipped_id in skipped {
                        summary.mark_skipped(&skipped_id);
                        self.emit_event(NodeEvent::Skipped {
                            node: skipped_id,
                            reason: format!("{} failed", node.id),
                        })
                        .await;
                    }

                    failures.push(StageFailure {
                        node: node.id.clone(),
                        stage: node.stage,
                        sample: node.sample.clone(),
                        attempts: outcome.attempts,
                        error,
                    });

                    if self.config.fail_fast && !run_token.is_cancelled() {
                        warn!("Fail-fast: cancelling remaining nodes");
                        run_token.cancel();
                    }
                }
            }
        }

        // Anything still unresolved could not be scheduled.
        for node in scheduler.cancel_pending() {
            summary.mark_cancelled(&node);
            self.emit_event(NodeEvent::Cancelled { node }).await;
        }

        let state = if cancel.is_cancelled() {
            RunState::Cancelled
        } else if !failures.is_empty() || !scheduler.all_success() {
            RunState::Failed
        } else {
            RunState::Completed
        };

        summary.duration = timer.elapsed();
        let success = state == RunState::Completed;
        info!(
            state = ?state,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            retries = summary.retries,
            "Execution finished"
        );

        self.emit_event(NodeEvent::RunCompleted {
            success,
            summary: summary.clone(),
        })
        .await;

        ExecutionResult {
            state,
            summary,
            failures,
            duration: timer.elapsed(),
        }
    }

    /// Emit an event to the event channel if configured.
    async fn emit_event(&self, event: NodeEvent) {
        emit(&self.event_tx, event).await;
    }
}

async fn emit(tx: &Option<mpsc::Sender<NodeEvent>>, event: NodeEvent) {
    if let Some(tx) = tx {
        tx.send(event).await.ok();
    }
}

/// Run a node until it succeeds or its retry machine gives up.
async fn run_with_retry<R: NodeRunner>(
    node: TaskNode,
    runner: Arc<R>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<NodeEvent>>,
    tracker: Arc<AttemptTracker>,
) -> Outcome {
    let timer = ExecutionTimer::start();
    let mut machine = RetryMachine::new(node.resources, node.max_attempts, node.retryable);

    let result = loop {
        if cancel.is_cancelled() {
            break Err(TaskError::Cancelled { stage: node.stage });
        }

        let attempt = machine.begin();
        let resources = machine.resources();
        tracker.record(attempt, resources.memory_mb);
        emit(
            &event_tx,
            NodeEvent::Started {
                node: node.id.clone(),
                stage: node.stage,
                sample: node.sample.clone(),
                attempt,
                memory_mb: resources.memory_mb,
            },
        )
        .await;

        let error = match runner.run_node(&node, attempt, resources, &cancel).await {
            Ok(outputs) => {
                machine.succeed();
                break Ok(outputs);
            }
            Err(error) => error,
        };

        match machine.fail(&error, &policy) {
            Transition::GiveUp => break Err(error),
            Transition::Retry {
                attempt: next,
                backoff,
                resources,
            } => {
                warn!(
                    node = %node.id,
                    attempt = next,
                    max_attempts = node.max_attempts,
                    memory_mb = resources.memory_mb,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Retrying with more resources"
                );
                emit(
                    &event_tx,
                    NodeEvent::Retrying {
                        node: node.id.clone(),
                        attempt: next,
                        max_attempts: node.max_attempts,
                        backoff_ms: backoff.as_millis() as u64,
                        memory_mb: resources.memory_mb,
                        reason: error.to_string(),
                    },
                )
                .await;

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break Err(TaskError::Cancelled { stage: node.stage }),
                }
            }
        }
    };

    Outcome {
        index: node.index,
        attempts: machine.attempts().max(1),
        memory_mb: machine.resources().memory_mb,
        duration: timer.elapsed(),
        result,
    }
}
