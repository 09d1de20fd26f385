//! Execution state tracking for a pipeline run.
//!
//! This module provides types for tracking the state of DAG execution,
//! including individual node results and overall run state.

use super::node::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Every node completed successfully
    Completed,
    /// One or more nodes failed terminally
    Failed,
    /// The run was cancelled externally
    Cancelled,
}

/// Result of executing a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    /// Node identifier
    pub node: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    /// Whether the node completed successfully
    pub success: bool,
    /// Attempts made (1 unless retried)
    pub attempts: u32,
    /// Memory granted to the last attempt
    pub memory_mb: u64,
    /// Artifacts produced
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PathBuf>,
    /// Error message if the node failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl NodeResult {
    pub fn success(
        node: &str,
        stage: Stage,
        sample: Option<&str>,
        attempts: u32,
        memory_mb: u64,
        outputs: Vec<PathBuf>,
        duration: Duration,
    ) -> Self {
        Self {
            node: node.to_string(),
            stage,
            sample: sample.map(String::from),
            success: true,
            attempts,
            memory_mb,
            outputs,
            error: None,
            duration,
        }
    }

    pub fn failure(
        node: &str,
        stage: Stage,
        sample: Option<&str>,
        error: &str,
        attempts: u32,
        memory_mb: u64,
        duration: Duration,
    ) -> Self {
        Self {
            node: node.to_string(),
            stage,
            sample: sample.map(String::from),
            success: false,
            attempts,
            memory_mb,
            outputs: Vec::new(),
            error: Some(error.to_string()),
            duration,
        }
    }

    /// Whether the node needed more than one attempt.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Summary of run results, written to `run_summary.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_nodes: usize,
    pub completed: usize,
    pub failed: usize,
    /// Nodes not run because a dependency failed
    pub skipped: usize,
    /// Nodes not run because the run was cancelled
    pub cancelled: usize,
    /// Attempts beyond the first, over all nodes
    pub retries: u32,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled_nodes: Vec<String>,
}

impl RunSummary {
    pub fn new(total_nodes: usize) -> Self {
        Self {
            total_nodes,
            ..Default::default()
        }
    }

    pub fn add_result(&mut self, result: NodeResult) {
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.retries += result.attempts.saturating_sub(1);
        self.node_results.insert(result.node.clone(), result);
    }

    pub fn mark_skipped(&mut self, node: &str) {
        self.skipped += 1;
        self.skipped_nodes.push(node.to_string());
    }

    pub fn mark_cancelled(&mut self, node: &str) {
        self.cancelled += 1;
        self.cancelled_nodes.push(node.to_string());
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_summary_counts() {
        let mut summary = RunSummary::new(4);

        summary.add_result(NodeResult::success(
            "sketch_sample:a",
            Stage::SketchSample,
            Some("a"),
            1,
            2048,
            vec![PathBuf::from("a.sig")],
            Duration::from_secs(3),
        ));
        summary.add_result(NodeResult::success(
            "search_containment:a",
            Stage::SearchContainment,
            Some("a"),
            3,
            16384,
            vec![],
            Duration::from_secs(9),
        ));
        summary.add_result(NodeResult::failure(
            "search_containment:b",
            Stage::SearchContainment,
            Some("b"),
            "exit code 2",
            1,
            4096,
            Duration::from_secs(1),
        ));
        summary.mark_skipped("render_sample:b");

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.retries, 2);
        assert!(summary.node_results["search_containment:a"].was_retried());
        assert_eq!(summary.skipped_nodes, vec!["render_sample:b".to_string()]);
    }

    #[test]
    fn test_summary_serializes_durations_as_millis() {
        let mut summary = RunSummary::new(1);
        summary.duration = Duration::from_millis(1500);
        summary.add_result(NodeResult::success(
            "render_sample:a",
            Stage::RenderSample,
            Some("a"),
            1,
            1024,
            vec![],
            Duration::from_millis(250),
        ));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["node_results"]["render_sample:a"]["duration"], 250);
        assert_eq!(json["node_results"]["render_sample:a"]["stage"], "render_sample");

        let back: RunSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back.completed, back.total_nodes);
        assert_eq!(back.node_results["render_sample:a"].memory_mb, 1024);
    }
}
