//! DAG scheduler for computing execution order and tracking node states.
//!
//! The scheduler computes execution waves (groups of nodes that can run in
//! parallel because their dependencies are satisfied) and records the status
//! of every node as the executor reports outcomes.

use super::builder::RunGraph;
use super::node::{NodeIndex, TaskNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Configuration for the DAG scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Maximum nodes to run in parallel
    pub max_parallel: usize,
    /// Cancel in-flight nodes on the first terminal failure
    pub fail_fast: bool,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            fail_fast: false,
        }
    }
}

impl DagConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Status of a node in the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for dependencies or a free slot
    #[default]
    Pending,
    /// Currently executing (including retry backoff)
    Running { started_at_ms: u64 },
    Completed { attempts: u32 },
    Failed { error: String, attempts: u32 },
    /// Not run because a dependency failed
    Skipped,
    /// Not run (or interrupted) because the run was cancelled
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Skipped | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// The main DAG scheduler.
#[derive(Debug)]
pub struct DagScheduler {
    graph: Arc<RunGraph>,
    status: Vec<NodeStatus>,
    completed: HashSet<NodeIndex>,
}

impl DagScheduler {
    pub fn new(graph: Arc<RunGraph>) -> Self {
        let status = vec![NodeStatus::Pending; graph.len()];
        Self {
            graph,
            status,
            completed: HashSet::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.len()
    }

    /// Compute execution waves - groups of nodes that can run in parallel.
    ///
    /// Returns a list of waves, where each wave lists the node ids that can
    /// execute once all previous waves complete.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<NodeIndex> = HashSet::new();

        loop {
            let ready: Vec<NodeIndex> = self
                .graph
                .nodes()
                .iter()
                .filter(|node| {
                    !completed.contains(&node.index)
                        && self.graph.dependencies_satisfied(node.index, &completed)
                })
                .map(|node| node.index)
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(
                ready
                    .into_iter()
                    .filter_map(|i| self.graph.node(i).map(|n| n.id.clone()))
                    .collect(),
            );
        }

        waves
    }

    /// Nodes whose dependencies all succeeded and which have not started.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        self.graph
            .nodes()
            .iter()
            .filter(|node| {
                matches!(self.status[node.index], NodeStatus::Pending)
                    && self.graph.dependencies_satisfied(node.index, &self.completed)
            })
            .collect()
    }

    pub fn mark_running(&mut self, index: NodeIndex) {
        if let Some(status) = self.status.get_mut(index) {
            *status = NodeStatus::Running {
                started_at_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            };
        }
    }

    pub fn mark_completed(&mut self, index: NodeIndex, attempts: u32) {
        if let Some(status) = self.status.get_mut(index) {
            *status = NodeStatus::Completed { attempts };
            self.completed.insert(index);
        }
    }

    /// Mark a node as failed and skip everything downstream of it.
    ///
    /// Returns the ids of the nodes that were skipped.
    pub fn mark_failed(&mut self, index: NodeIndex, error: &str, attempts: u32) -> Vec<String> {
        let Some(status) = self.status.get_mut(index) else {
            return Vec::new();
        };
        *status = NodeStatus::Failed {
            error: error.to_string(),
            attempts,
        };

        let mut skipped = Vec::new();
        self.skip_dependents(index, &mut skipped);
        skipped
    }

    /// Mark a node cancelled (interrupted or never started).
    pub fn mark_cancelled(&mut self, index: NodeIndex) {
        if let Some(status) = self.status.get_mut(index)
            && !status.is_terminal()
        {
            *status = NodeStatus::Cancelled;
        }
    }

    /// Cancel every node that has not started. Returns their ids.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        let pending: Vec<NodeIndex> = self
            .status
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, NodeStatus::Pending))
            .map(|(i, _)| i)
            .collect();

        pending
            .into_iter()
            .filter_map(|i| {
                self.mark_cancelled(i);
                self.graph.node(i).map(|n| n.id.clone())
            })
            .collect()
    }

    /// Skip all nodes that depend on a failed node.
    fn skip_dependents(&mut self, failed_idx: NodeIndex, skipped: &mut Vec<String>) {
        let graph = Arc::clone(&self.graph);
        for &dep_idx in graph.dependents(failed_idx) {
            if let Some(status) = self.status.get_mut(dep_idx)
                && !status.is_terminal()
            {
                *status = NodeStatus::Skipped;
                if let Some(node) = graph.node(dep_idx) {
                    skipped.push(node.id.clone());
                }
                self.skip_dependents(dep_idx, skipped);
            }
        }
    }

    pub fn all_success(&self) -> bool {
        self.status.iter().all(NodeStatus::is_success)
    }
}
