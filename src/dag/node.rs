//! Task node types: stages, artifact handles and the node itself.

use crate::config::ResourceProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Index into the node list of a `RunGraph`.
pub type NodeIndex = usize;

/// The pipeline stage a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SketchReference,
    SketchSample,
    FilterAbundance,
    SearchContainment,
    RenderSample,
    RenderCombined,
}

impl Stage {
    /// Every stage in branch order.
    pub const ALL: [Stage; 6] = [
        Stage::SketchReference,
        Stage::SketchSample,
        Stage::FilterAbundance,
        Stage::SearchContainment,
        Stage::RenderSample,
        Stage::RenderCombined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SketchReference => "sketch_reference",
            Stage::SketchSample => "sketch_sample",
            Stage::FilterAbundance => "filter_abundance",
            Stage::SearchContainment => "search_containment",
            Stage::RenderSample => "render_sample",
            Stage::RenderCombined => "render_combined",
        }
    }

    /// Stages whose nodes get the out-of-memory retry policy.
    ///
    /// Only the containment search is memory sensitive enough to warrant it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Stage::SearchContainment)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown stage '{}'", s))
    }
}

/// What an artifact handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Raw sequence data supplied by the user
    Sequence,
    /// A sketch artifact (supplied or built)
    Sketch,
    /// A containment record table (CSV)
    Records,
    /// A rendered plot
    Plot,
}

/// A reference to an artifact consumed or produced by a node.
///
/// `producer` is the node that creates the artifact; `None` means the artifact
/// exists before the run starts (a user-supplied file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    /// Source identifier the artifact belongs to
    pub owner: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<NodeIndex>,
}

impl ArtifactRef {
    /// An artifact that exists before the run.
    pub fn supplied(kind: ArtifactKind, owner: &str, path: PathBuf) -> Self {
        Self {
            kind,
            owner: owner.to_string(),
            path,
            producer: None,
        }
    }

    /// An artifact created by node `producer`.
    pub fn produced(kind: ArtifactKind, owner: &str, path: PathBuf, producer: NodeIndex) -> Self {
        Self {
            kind,
            owner: owner.to_string(),
            path,
            producer: Some(producer),
        }
    }
}

/// A unit of work wrapping one external-tool invocation.
///
/// Nodes are immutable once the graph is built; attempt counts and status are
/// tracked by the scheduler and the per-node retry machine.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub index: NodeIndex,
    /// Unique identifier, `<stage>:<owner>`
    pub id: String,
    pub stage: Stage,
    /// Sample branch this node belongs to (`None` for shared nodes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    pub inputs: Vec<ArtifactRef>,
    pub outputs: Vec<ArtifactRef>,
    /// Resources granted to the first attempt
    pub resources: ResourceProfile,
    /// Whether the out-of-memory retry policy applies
    pub retryable: bool,
    /// Retry budget, counting the first attempt
    pub max_attempts: u32,
}

impl TaskNode {
    /// Build the canonical node identifier.
    pub fn make_id(stage: Stage, owner: &str) -> String {
        format!("{}:{}", stage, owner)
    }

    /// First input of the given kind.
    pub fn input(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.inputs.iter().find(|a| a.kind == kind)
    }

    /// First output of the given kind.
    pub fn output(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.outputs.iter().find(|a| a.kind == kind)
    }

    /// Nodes producing this node's inputs, deduplicated, in input order.
    pub fn dependencies(&self) -> Vec<NodeIndex> {
        let mut deps = Vec::new();
        for producer in self.inputs.iter().filter_map(|a| a.producer) {
            if !deps.contains(&producer) {
                deps.push(producer);
            }
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
        assert!("render".parse::<Stage>().is_err());
    }

    #[test]
    fn test_only_search_is_retryable() {
        let retryable: Vec<Stage> = Stage::ALL.into_iter().filter(|s| s.is_retryable()).collect();
        assert_eq!(retryable, vec![Stage::SearchContainment]);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::FilterAbundance).unwrap();
        assert_eq!(json, "\"filter_abundance\"");
    }

    #[test]
    fn test_dependencies_are_deduplicated() {
        let node = TaskNode {
            index: 3,
            id: TaskNode::make_id(Stage::RenderCombined, "containment"),
            stage: Stage::RenderCombined,
            sample: None,
            inputs: vec![
                ArtifactRef::produced(ArtifactKind::Records, "a", PathBuf::from("a.csv"), 1),
                ArtifactRef::produced(ArtifactKind::Plot, "a", PathBuf::from("a.png"), 1),
                ArtifactRef::produced(ArtifactKind::Records, "b", PathBuf::from("b.csv"), 2),
                ArtifactRef::supplied(ArtifactKind::Sketch, "ref", PathBuf::from("ref.sig")),
            ],
            outputs: vec![],
            resources: ResourceProfile::new(1, 1024, 60),
            retryable: false,
            max_attempts: 1,
        };
        assert_eq!(node.dependencies(), vec![1, 2]);
        assert_eq!(node.id, "render_combined:containment");
        assert_eq!(node.input(ArtifactKind::Sketch).unwrap().producer, None);
    }
}
