//! DAG builder for constructing the task graph of a run.
//!
//! The graph shape is a pure function of the resolved inputs and the
//! configuration: sketch nodes exist only for raw inputs, the filter node only
//! when `min_depth` filters anything, and the combined node only when more
//! than one sample was resolved.

use super::node::{ArtifactKind, ArtifactRef, NodeIndex, Stage, TaskNode};
use crate::config::PipelineToml;
use crate::input::{ResolvedInputs, SequenceSource};
use crate::layout::{ArtifactLayout, COMBINED_NAME};
use anyhow::{Result, bail};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A directed acyclic graph of task nodes.
#[derive(Debug, Serialize)]
pub struct RunGraph {
    /// Nodes indexed by their position
    nodes: Vec<TaskNode>,
    /// Map from node id to index
    #[serde(skip)]
    index_map: HashMap<String, NodeIndex>,
    /// Forward edges: index -> nodes consuming its outputs
    #[serde(skip)]
    forward_edges: Vec<Vec<NodeIndex>>,
    /// Reverse edges: index -> nodes producing its inputs
    #[serde(skip)]
    reverse_edges: Vec<Vec<NodeIndex>>,
    /// The single reference sketch every search consumes
    reference_sketch: ArtifactRef,
    /// Sample identifiers, one branch each
    samples: Vec<String>,
}

impl RunGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    pub fn node_by_id(&self, id: &str) -> Option<&TaskNode> {
        self.index_map.get(id).and_then(|&i| self.nodes.get(i))
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Nodes consuming the outputs of the given node.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Nodes producing the inputs of the given node.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies_satisfied(&self, index: NodeIndex, completed: &HashSet<NodeIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Handle to the shared reference sketch (built or supplied).
    pub fn reference_sketch(&self) -> &ArtifactRef {
        &self.reference_sketch
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// All nodes of one stage, in graph order.
    pub fn nodes_for_stage(&self, stage: Stage) -> Vec<&TaskNode> {
        self.nodes.iter().filter(|n| n.stage == stage).collect()
    }

    /// The fan-in node, present only for multi-sample runs.
    pub fn combined_node(&self) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.stage == Stage::RenderCombined)
    }

    /// Nodes belonging to one sample branch, in branch order.
    pub fn branch(&self, sample: &str) -> Vec<&TaskNode> {
        self.nodes
            .iter()
            .filter(|n| n.sample.as_deref() == Some(sample))
            .collect()
    }
}

/// Builder for constructing run graphs from resolved inputs.
pub struct DagBuilder<'a> {
    inputs: &'a ResolvedInputs,
    layout: &'a ArtifactLayout,
    config: &'a PipelineToml,
    nodes: Vec<TaskNode>,
}

impl<'a> DagBuilder<'a> {
    pub fn new(inputs: &'a ResolvedInputs, layout: &'a ArtifactLayout, config: &'a PipelineToml) -> Self {
        Self {
            inputs,
            layout,
            config,
            nodes: Vec::new(),
        }
    }

    /// Build the run graph.
    ///
    /// This validates the graph structure:
    /// - At least one sample must be present
    /// - Node ids are unique
    /// - No cycles are allowed
    pub fn build(mut self) -> Result<RunGraph> {
        let inputs = self.inputs;
        let samples = &inputs.samples;
        if samples.is_empty() {
            bail!("Cannot build a run graph without samples");
        }
        if samples.len() > 1 && samples.iter().any(|s| s.id == COMBINED_NAME) {
            bail!(
                "Sample name '{}' collides with the combined report name",
                COMBINED_NAME
            );
        }

        let reference_sketch = self.add_reference_branch();

        let mut published = Vec::with_capacity(samples.len());
        for sample in samples {
            published.push(self.add_sample_branch(sample, &reference_sketch));
        }

        if samples.len() > 1 {
            self.add_combined(published);
        }

        let samples = samples.iter().map(|s| s.id.clone()).collect();
        Self::finish(self.nodes, reference_sketch, samples)
    }

    fn add_node(
        &mut self,
        stage: Stage,
        owner: &str,
        sample: Option<&str>,
        inputs: Vec<ArtifactRef>,
        outputs: Vec<(ArtifactKind, PathBuf)>,
    ) -> NodeIndex {
        let index = self.nodes.len();
        let retryable = stage.is_retryable();
        let outputs = outputs
            .into_iter()
            .map(|(kind, path)| ArtifactRef::produced(kind, owner, path, index))
            .collect();

        self.nodes.push(TaskNode {
            index,
            id: TaskNode::make_id(stage, owner),
            stage,
            sample: sample.map(String::from),
            inputs,
            outputs,
            resources: self.config.resources.for_stage(stage),
            retryable,
            max_attempts: if retryable {
                self.config.retry.max_attempts
            } else {
                1
            },
        });
        index
    }

    /// A supplied sketch is used directly; raw references get one sketch node.
    fn add_reference_branch(&mut self) -> ArtifactRef {
        let inputs = self.inputs;
        let reference = &inputs.reference;
        if reference.is_presketched() {
            return ArtifactRef::supplied(ArtifactKind::Sketch, &reference.id, reference.path.clone());
        }
        let output = self.layout.reference_sketch(&reference.id);
        let index = self.add_node(
            Stage::SketchReference,
            &reference.id,
            None,
            vec![ArtifactRef::supplied(
                ArtifactKind::Sequence,
                &reference.id,
                reference.path.clone(),
            )],
            vec![(ArtifactKind::Sketch, output)],
        );
        self.nodes[index].outputs[0].clone()
    }

    /// sketch -> filter -> search -> render. Returns the published record table.
    fn add_sample_branch(&mut self, sample: &SequenceSource, reference: &ArtifactRef) -> ArtifactRef {
        let id = sample.id.as_str();

        let mut sketch = if sample.is_presketched() {
            ArtifactRef::supplied(ArtifactKind::Sketch, id, sample.path.clone())
        } else {
            let index = self.add_node(
                Stage::SketchSample,
                id,
                Some(id),
                vec![ArtifactRef::supplied(
                    ArtifactKind::Sequence,
                    id,
                    sample.path.clone(),
                )],
                vec![(ArtifactKind::Sketch, self.layout.sample_sketch(id))],
            );
            self.nodes[index].outputs[0].clone()
        };

        if !self.config.params.filter_is_noop() {
            let index = self.add_node(
                Stage::FilterAbundance,
                id,
                Some(id),
                vec![sketch],
                vec![(ArtifactKind::Sketch, self.layout.filtered_sketch(id))],
            );
            sketch = self.nodes[index].outputs[0].clone();
        }

        // Search inputs are ordered [query, reference].
        let search = self.add_node(
            Stage::SearchContainment,
            id,
            Some(id),
            vec![sketch, reference.clone()],
            vec![(ArtifactKind::Records, self.layout.search_records(id))],
        );
        let records = self.nodes[search].outputs[0].clone();

        let mut outputs = vec![(ArtifactKind::Records, self.layout.sample_csv(id))];
        if self.config.params.plot {
            outputs.push((ArtifactKind::Plot, self.layout.sample_plot(id)));
        }
        let render = self.add_node(Stage::RenderSample, id, Some(id), vec![records], outputs);
        self.nodes[render].outputs[0].clone()
    }

    fn add_combined(&mut self, published: Vec<ArtifactRef>) {
        let mut outputs = vec![(ArtifactKind::Records, self.layout.combined_csv())];
        if self.config.params.plot {
            outputs.push((ArtifactKind::Plot, self.layout.combined_plot()));
        }
        self.add_node(Stage::RenderCombined, COMBINED_NAME, None, published, outputs);
    }

    fn finish(nodes: Vec<TaskNode>, reference_sketch: ArtifactRef, samples: Vec<String>) -> Result<RunGraph> {
        let mut index_map = HashMap::new();
        for node in &nodes {
            if index_map.insert(node.id.clone(), node.index).is_some() {
                bail!("Duplicate node id: {}", node.id);
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];

        for node in &nodes {
            for from in node.dependencies() {
                if from >= nodes.len() {
                    bail!("Node '{}' depends on unknown node index {}", node.id, from);
                }
                forward_edges[from].push(node.index);
                reverse_edges[node.index].push(from);
            }
        }

        let graph = RunGraph {
            nodes,
            index_map,
            forward_edges,
            reverse_edges,
            reference_sketch,
            samples,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &RunGraph) -> Result<()> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_nodes: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.node(i).map(|n| n.id.as_str()))
                .collect();

            bail!("Cycle detected in task graph. Involved nodes: {:?}", cycle_nodes);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::SourceKind;

    fn source(id: &str, kind: SourceKind) -> SequenceSource {
        let ext = match kind {
            SourceKind::Raw => "fastq",
            SourceKind::Presketched => "sig",
        };
        SequenceSource {
            id: id.to_string(),
            path: PathBuf::from(format!("/data/{}.{}", id, ext)),
            kind,
        }
    }

    fn inputs(reference: SourceKind, samples: &[&str]) -> ResolvedInputs {
        ResolvedInputs {
            reference: source("refs", reference),
            samples: samples.iter().map(|s| source(s, SourceKind::Raw)).collect(),
        }
    }

    fn build(inputs: &ResolvedInputs, config: &PipelineToml) -> Result<RunGraph> {
        let layout = ArtifactLayout::new("/out");
        DagBuilder::new(inputs, &layout, config).build()
    }

    fn count(graph: &RunGraph, stage: Stage) -> usize {
        graph.nodes_for_stage(stage).len()
    }

    /// Nodes nothing depends on.
    fn leaves(graph: &RunGraph) -> Vec<&TaskNode> {
        graph
            .nodes()
            .iter()
            .filter(|n| graph.dependents(n.index).is_empty())
            .collect()
    }

    #[test]
    fn test_single_sample_has_no_combined_node() {
        let graph = build(&inputs(SourceKind::Raw, &["s1"]), &PipelineToml::default()).unwrap();

        assert_eq!(count(&graph, Stage::SketchReference), 1);
        assert_eq!(count(&graph, Stage::SketchSample), 1);
        assert_eq!(count(&graph, Stage::SearchContainment), 1);
        assert_eq!(count(&graph, Stage::RenderSample), 1);
        assert!(graph.combined_node().is_none());

        let leaves = leaves(&graph);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].stage, Stage::RenderSample);
    }

    #[test]
    fn test_multiple_samples_fan_in_to_one_combined_node() {
        let graph = build(
            &inputs(SourceKind::Raw, &["a", "b", "c"]),
            &PipelineToml::default(),
        )
        .unwrap();

        assert_eq!(count(&graph, Stage::RenderSample), 3);
        assert_eq!(count(&graph, Stage::RenderCombined), 1);

        let combined = graph.combined_node().unwrap();
        let deps = graph.dependencies(combined.index);
        assert_eq!(deps.len(), 3);
        assert!(
            deps.iter()
                .all(|&d| graph.node(d).unwrap().stage == Stage::RenderSample)
        );
        let leaves = leaves(&graph);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].index, combined.index);
    }

    #[test]
    fn test_reference_sketch_is_shared_by_every_search() {
        let graph = build(
            &inputs(SourceKind::Raw, &["a", "b", "c", "d"]),
            &PipelineToml::default(),
        )
        .unwrap();

        let reference = graph.nodes_for_stage(Stage::SketchReference);
        assert_eq!(reference.len(), 1);
        let reference = reference[0].index;

        let searches = graph.nodes_for_stage(Stage::SearchContainment);
        assert_eq!(searches.len(), 4);
        for search in searches {
            assert!(graph.dependencies(search.index).contains(&reference));
        }
        assert_eq!(graph.dependents(reference).len(), 4);
    }

    #[test]
    fn test_presketched_reference_has_no_sketch_node() {
        let resolved = inputs(SourceKind::Presketched, &["a", "b"]);
        let graph = build(&resolved, &PipelineToml::default()).unwrap();

        assert_eq!(count(&graph, Stage::SketchReference), 0);
        assert_eq!(graph.reference_sketch().producer, None);
        assert_eq!(graph.reference_sketch().path, resolved.reference.path);

        for search in graph.nodes_for_stage(Stage::SearchContainment) {
            assert_eq!(search.inputs[1].path, resolved.reference.path);
        }
    }

    #[test]
    fn test_presketched_sample_has_no_sketch_node() {
        let mut resolved = inputs(SourceKind::Raw, &["a"]);
        resolved.samples.push(source("b", SourceKind::Presketched));
        let graph = build(&resolved, &PipelineToml::default()).unwrap();

        assert_eq!(count(&graph, Stage::SketchSample), 1);
        let search_b = graph.node_by_id("search_containment:b").unwrap();
        assert_eq!(search_b.inputs[0].path, PathBuf::from("/data/b.sig"));
        assert_eq!(graph.dependencies(search_b.index).len(), 1);
    }

    #[test]
    fn test_filter_omitted_when_min_depth_is_noop() {
        let graph = build(&inputs(SourceKind::Raw, &["a", "b"]), &PipelineToml::default()).unwrap();
        assert_eq!(count(&graph, Stage::FilterAbundance), 0);

        let mut config = PipelineToml::default();
        config.params.min_depth = 3;
        let graph = build(&inputs(SourceKind::Raw, &["a", "b"]), &config).unwrap();
        assert_eq!(count(&graph, Stage::FilterAbundance), 2);

        let filter = graph.node_by_id("filter_abundance:a").unwrap();
        let search = graph.node_by_id("search_containment:a").unwrap();
        assert!(graph.dependencies(search.index).contains(&filter.index));
    }

    #[test]
    fn test_branch_order_is_fixed() {
        let mut config = PipelineToml::default();
        config.params.min_depth = 2;
        let graph = build(&inputs(SourceKind::Raw, &["a"]), &config).unwrap();

        let stages: Vec<Stage> = graph.branch("a").iter().map(|n| n.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::SketchSample,
                Stage::FilterAbundance,
                Stage::SearchContainment,
                Stage::RenderSample,
            ]
        );
    }

    #[test]
    fn test_zero_samples_is_rejected() {
        let result = build(&inputs(SourceKind::Raw, &[]), &PipelineToml::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_named_like_combined_report_is_rejected() {
        let result = build(
            &inputs(SourceKind::Raw, &["a", COMBINED_NAME]),
            &PipelineToml::default(),
        );
        assert!(result.unwrap_err().to_string().contains("collides"));

        // A single sample never produces a combined report.
        assert!(build(&inputs(SourceKind::Raw, &[COMBINED_NAME]), &PipelineToml::default()).is_ok());
    }

    #[test]
    fn test_only_search_nodes_carry_retry_budget() {
        let graph = build(&inputs(SourceKind::Raw, &["a", "b"]), &PipelineToml::default()).unwrap();
        for node in graph.nodes() {
            if node.stage == Stage::SearchContainment {
                assert!(node.retryable);
                assert_eq!(node.max_attempts, 4);
            } else {
                assert!(!node.retryable);
                assert_eq!(node.max_attempts, 1);
            }
        }
    }

    #[test]
    fn test_plot_outputs_follow_plot_flag() {
        let mut config = PipelineToml::default();
        config.params.plot = false;
        let graph = build(&inputs(SourceKind::Raw, &["a", "b"]), &config).unwrap();
        for node in graph.nodes() {
            assert!(node.output(ArtifactKind::Plot).is_none());
        }

        let graph = build(&inputs(SourceKind::Raw, &["a", "b"]), &PipelineToml::default()).unwrap();
        let combined = graph.combined_node().unwrap();
        assert_eq!(
            combined.output(ArtifactKind::Plot).unwrap().path,
            PathBuf::from("/out/containment.png")
        );
    }

    #[test]
    fn test_dependencies_satisfied() {
        let graph = build(&inputs(SourceKind::Raw, &["a"]), &PipelineToml::default()).unwrap();
        let index = |id: &str| graph.node_by_id(id).unwrap().index;
        let search = index("search_containment:a");
        let mut completed = HashSet::new();
        assert!(!graph.dependencies_satisfied(search, &completed));

        completed.insert(index("sketch_reference:refs"));
        assert!(!graph.dependencies_satisfied(search, &completed));

        completed.insert(index("sketch_sample:a"));
        assert!(graph.dependencies_satisfied(search, &completed));
    }
}
