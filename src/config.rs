//! Layered configuration for containment runs.
//!
//! Settings are read from `containment.toml`, then overridden by environment
//! variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [params]
//! references = "refs/plasmids.fasta"
//! reads = "reads/"
//! outdir = "output"
//! kmer = 31
//! scaled = 100
//! min_depth = 1
//! plot = true
//! threshold = 0.0
//!
//! [inputs]
//! sequence_extensions = ["fa", "fasta", "fna", "fq", "fastq"]
//! compression_suffixes = ["gz", "bz2", "xz", "zst"]
//! sketch_extensions = ["sig", "sig.gz", "zip"]
//!
//! [execution]
//! max_parallel = 4
//! fail_fast = false
//! launcher = ["systemd-run", "--user", "--scope", "-p", "MemoryMax={memory_mb}M", "--"]
//!
//! [retry]
//! max_attempts = 4
//! memory_factor = 2
//! backoff_ms = 1000
//! oom_exit_codes = [137, 138, 139, 140]
//!
//! [resources.search_containment]
//! cpus = 2
//! memory_mb = 4096
//! time_secs = 7200
//!
//! [tools.search_containment]
//! program = "sourmash"
//! args = ["scripts", "multisearch", "{reference}", "{query}", "-o", "{output}"]
//! ```

use crate::dag::Stage;
use crate::errors::{InputError, PipelineError};
use crate::layout::ArtifactLayout;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "containment.toml";

/// Environment variable overriding the sketch/filter/search program.
pub const ENV_SOURMASH: &str = "CONTAINMENT_SOURMASH";
/// Environment variable overriding the renderer program.
pub const ENV_RENDERER: &str = "CONTAINMENT_RENDERER";
/// Environment variable overriding the number of concurrently running nodes.
pub const ENV_MAX_PARALLEL: &str = "CONTAINMENT_MAX_PARALLEL";

/// Sketching and reporting parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsSection {
    /// Reference sequences or a pre-built reference sketch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<PathBuf>,
    /// Sample file or directory of sample files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reads: Option<PathBuf>,
    /// Directory receiving published outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdir: Option<PathBuf>,
    /// K-mer length used for sketching
    #[serde(default = "default_kmer")]
    pub kmer: u32,
    /// Sketch resolution (keep 1 in `scaled` hashes)
    #[serde(default = "default_scaled")]
    pub scaled: u32,
    /// Minimum k-mer abundance kept in sample sketches (1 disables filtering)
    #[serde(default = "default_min_depth")]
    pub min_depth: u32,
    /// Whether plots are rendered
    #[serde(default = "default_plot")]
    pub plot: bool,
    /// Minimum containment reported by the search
    #[serde(default)]
    pub threshold: f64,
}

fn default_kmer() -> u32 {
    31
}

fn default_scaled() -> u32 {
    100
}

fn default_min_depth() -> u32 {
    1
}

fn default_plot() -> bool {
    true
}

impl Default for ParamsSection {
    fn default() -> Self {
        Self {
            references: None,
            reads: None,
            outdir: None,
            kmer: default_kmer(),
            scaled: default_scaled(),
            min_depth: default_min_depth(),
            plot: default_plot(),
            threshold: 0.0,
        }
    }
}

impl ParamsSection {
    /// Whether the abundance filter stage is a no-op for these parameters.
    pub fn filter_is_noop(&self) -> bool {
        self.min_depth <= 1
    }
}

/// File-name rules used by the input resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputsSection {
    /// Recognized sequence file extensions (matched case-insensitively)
    #[serde(default = "default_sequence_extensions")]
    pub sequence_extensions: Vec<String>,
    /// Compression suffixes accepted after a sequence extension
    #[serde(default = "default_compression_suffixes")]
    pub compression_suffixes: Vec<String>,
    /// Extensions marking a pre-built sketch artifact
    #[serde(default = "default_sketch_extensions")]
    pub sketch_extensions: Vec<String>,
}

fn default_sequence_extensions() -> Vec<String> {
    ["fa", "fasta", "fna", "fas", "fq", "fastq"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_compression_suffixes() -> Vec<String> {
    ["gz", "bgz", "bz2", "xz", "zst"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sketch_extensions() -> Vec<String> {
    ["sig", "sig.gz", "zip"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for InputsSection {
    fn default() -> Self {
        Self {
            sequence_extensions: default_sequence_extensions(),
            compression_suffixes: default_compression_suffixes(),
            sketch_extensions: default_sketch_extensions(),
        }
    }
}

/// Scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Maximum nodes running at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Cancel in-flight nodes on the first terminal failure
    #[serde(default)]
    pub fail_fast: bool,
    /// Optional argv prefix wrapped around every tool invocation.
    /// `{memory_mb}`, `{cpus}` and `{time_secs}` are substituted per attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub launcher: Vec<String>,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            fail_fast: false,
            launcher: Vec::new(),
        }
    }
}

/// Retry policy for nodes of retryable stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Memory multiplier applied on every out-of-memory retry
    #[serde(default = "default_memory_factor")]
    pub memory_factor: u32,
    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Exit codes treated as out-of-memory kills
    #[serde(default = "default_oom_exit_codes")]
    pub oom_exit_codes: Vec<i32>,
    /// Terminating signals treated as out-of-memory kills
    #[serde(default = "default_oom_signals")]
    pub oom_signals: Vec<i32>,
    /// Also retry wall-time overruns
    #[serde(default)]
    pub retry_on_timeout: bool,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_memory_factor() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_oom_exit_codes() -> Vec<i32> {
    vec![137, 138, 139, 140]
}

fn default_oom_signals() -> Vec<i32> {
    // SIGKILL, as delivered by the kernel OOM killer
    vec![9]
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            memory_factor: default_memory_factor(),
            backoff_ms: default_backoff_ms(),
            oom_exit_codes: default_oom_exit_codes(),
            oom_signals: default_oom_signals(),
            retry_on_timeout: false,
        }
    }
}

/// Resources granted to one attempt of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpus: u32,
    pub memory_mb: u64,
    pub time_secs: u64,
}

impl ResourceProfile {
    pub const fn new(cpus: u32, memory_mb: u64, time_secs: u64) -> Self {
        Self {
            cpus,
            memory_mb,
            time_secs,
        }
    }

    /// Wall-time budget as a `Duration`.
    pub fn time_limit(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.time_secs)
    }
}

/// Per-stage resource profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesSection {
    #[serde(default = "default_sketch_resources")]
    pub sketch_reference: ResourceProfile,
    #[serde(default = "default_sketch_resources")]
    pub sketch_sample: ResourceProfile,
    #[serde(default = "default_filter_resources")]
    pub filter_abundance: ResourceProfile,
    #[serde(default = "default_search_resources")]
    pub search_containment: ResourceProfile,
    #[serde(default = "default_render_resources")]
    pub render_sample: ResourceProfile,
    #[serde(default = "default_render_resources")]
    pub render_combined: ResourceProfile,
}

fn default_sketch_resources() -> ResourceProfile {
    ResourceProfile::new(1, 2048, 3600)
}

fn default_filter_resources() -> ResourceProfile {
    ResourceProfile::new(1, 1024, 1800)
}

fn default_search_resources() -> ResourceProfile {
    ResourceProfile::new(2, 4096, 7200)
}

fn default_render_resources() -> ResourceProfile {
    ResourceProfile::new(1, 1024, 1800)
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            sketch_reference: default_sketch_resources(),
            sketch_sample: default_sketch_resources(),
            filter_abundance: default_filter_resources(),
            search_containment: default_search_resources(),
            render_sample: default_render_resources(),
            render_combined: default_render_resources(),
        }
    }
}

impl ResourcesSection {
    pub fn for_stage(&self, stage: Stage) -> ResourceProfile {
        match stage {
            Stage::SketchReference => self.sketch_reference,
            Stage::SketchSample => self.sketch_sample,
            Stage::FilterAbundance => self.filter_abundance,
            Stage::SearchContainment => self.search_containment,
            Stage::RenderSample => self.render_sample,
            Stage::RenderCombined => self.render_combined,
        }
    }
}

/// An external program and its argument template.
///
/// Arguments may contain `{placeholder}` tokens; an argument consisting of a
/// single list placeholder (such as `{inputs}`) expands to zero or more
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Command templates per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_sketch_reference_tool")]
    pub sketch_reference: ToolCommand,
    #[serde(default = "default_sketch_sample_tool")]
    pub sketch_sample: ToolCommand,
    #[serde(default = "default_filter_tool")]
    pub filter_abundance: ToolCommand,
    #[serde(default = "default_search_tool")]
    pub search_containment: ToolCommand,
    #[serde(default = "default_render_sample_tool")]
    pub render_sample: ToolCommand,
    #[serde(default = "default_render_combined_tool")]
    pub render_combined: ToolCommand,
}

fn default_sketch_reference_tool() -> ToolCommand {
    ToolCommand::new(
        "sourmash",
        &[
            "sketch",
            "dna",
            "-p",
            "k={kmer},scaled={scaled},{abundance}",
            "--singleton",
            "{input}",
            "-o",
            "{output}",
        ],
    )
}

fn default_sketch_sample_tool() -> ToolCommand {
    ToolCommand::new(
        "sourmash",
        &[
            "sketch",
            "dna",
            "-p",
            "k={kmer},scaled={scaled},{abundance}",
            "--name",
            "{name}",
            "{input}",
            "-o",
            "{output}",
        ],
    )
}

fn default_filter_tool() -> ToolCommand {
    ToolCommand::new(
        "sourmash",
        &["sig", "filter", "-m", "{min_depth}", "{input}", "-o", "{output}"],
    )
}

fn default_search_tool() -> ToolCommand {
    ToolCommand::new(
        "sourmash",
        &[
            "scripts",
            "multisearch",
            "{reference}",
            "{query}",
            "-k",
            "{kmer}",
            "-s",
            "{scaled}",
            "-t",
            "{threshold}",
            "-c",
            "{cpus}",
            "-o",
            "{output}",
        ],
    )
}

const RENDER_COMMON: &[&str] = &[
    "--output-csv",
    "{output_csv}",
    "--output-plot",
    "{output_plot}",
    "--kmer",
    "{kmer}",
    "--scaled",
    "{scaled}",
    "--min-depth",
    "{min_depth}",
];

fn default_render_sample_tool() -> ToolCommand {
    let mut args = vec!["{inputs}"];
    args.extend_from_slice(RENDER_COMMON);
    args.extend_from_slice(&["--title-prefix", "{name}", "{plot_flag}"]);
    ToolCommand::new("plot_containment.py", &args)
}

fn default_render_combined_tool() -> ToolCommand {
    let mut args = vec!["{inputs}", "--combined"];
    args.extend_from_slice(RENDER_COMMON);
    args.push("{plot_flag}");
    ToolCommand::new("plot_containment.py", &args)
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            sketch_reference: default_sketch_reference_tool(),
            sketch_sample: default_sketch_sample_tool(),
            filter_abundance: default_filter_tool(),
            search_containment: default_search_tool(),
            render_sample: default_render_sample_tool(),
            render_combined: default_render_combined_tool(),
        }
    }
}

impl ToolsSection {
    pub fn for_stage(&self, stage: Stage) -> &ToolCommand {
        match stage {
            Stage::SketchReference => &self.sketch_reference,
            Stage::SketchSample => &self.sketch_sample,
            Stage::FilterAbundance => &self.filter_abundance,
            Stage::SearchContainment => &self.search_containment,
            Stage::RenderSample => &self.render_sample,
            Stage::RenderCombined => &self.render_combined,
        }
    }

    fn for_stage_mut(&mut self, stage: Stage) -> &mut ToolCommand {
        match stage {
            Stage::SketchReference => &mut self.sketch_reference,
            Stage::SketchSample => &mut self.sketch_sample,
            Stage::FilterAbundance => &mut self.filter_abundance,
            Stage::SearchContainment => &mut self.search_containment,
            Stage::RenderSample => &mut self.render_sample,
            Stage::RenderCombined => &mut self.render_combined,
        }
    }
}

/// The complete containment.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineToml {
    #[serde(default)]
    pub params: ParamsSection,
    #[serde(default)]
    pub inputs: InputsSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub resources: ResourcesSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

impl PipelineToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse containment.toml")
    }

    /// Load the explicit config file if given, otherwise `containment.toml` in
    /// `dir` when present, otherwise defaults. Returns the file actually read.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            Ok((Self::load(&candidate)?, Some(candidate)))
        } else {
            Ok((Self::default(), None))
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize containment.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = lookup(ENV_SOURMASH).filter(|p| !p.is_empty()) {
            for stage in [
                Stage::SketchReference,
                Stage::SketchSample,
                Stage::FilterAbundance,
                Stage::SearchContainment,
            ] {
                self.tools.for_stage_mut(stage).program = program.clone();
            }
        }
        if let Some(program) = lookup(ENV_RENDERER).filter(|p| !p.is_empty()) {
            for stage in [Stage::RenderSample, Stage::RenderCombined] {
                self.tools.for_stage_mut(stage).program = program.clone();
            }
        }
        if let Some(max) = lookup(ENV_MAX_PARALLEL).and_then(|v| v.parse::<usize>().ok()) {
            self.execution.max_parallel = max;
        }
    }

    /// Hard errors that make a run impossible.
    pub fn check(&self) -> Result<(), PipelineError> {
        let p = &self.params;
        if p.kmer == 0 {
            return Err(PipelineError::Config("kmer must be greater than 0".into()));
        }
        if p.scaled == 0 {
            return Err(PipelineError::Config("scaled must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&p.threshold) {
            return Err(PipelineError::Config(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                p.threshold
            )));
        }
        if self.execution.max_parallel == 0 {
            return Err(PipelineError::Config(
                "max_parallel must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.check() {
            warnings.push(e.to_string());
        }

        if self.retry.memory_factor < 2 {
            warnings.push(format!(
                "retry.memory_factor = {} does not increase memory between attempts",
                self.retry.memory_factor
            ));
        }
        if self.retry.oom_exit_codes.is_empty() && self.retry.oom_signals.is_empty() {
            warnings.push(
                "retry.oom_exit_codes and retry.oom_signals are empty: nothing will be retried"
                    .to_string(),
            );
        }
        if self.inputs.sequence_extensions.is_empty() {
            warnings.push("inputs.sequence_extensions is empty: no sample file will match".into());
        }
        if self.inputs.sketch_extensions.is_empty() {
            warnings.push("inputs.sketch_extensions is empty: pre-built sketches are not recognized".into());
        }

        for stage in Stage::ALL {
            let tool = self.tools.for_stage(stage);
            if tool.program.trim().is_empty() {
                warnings.push(format!("tools.{}.program is empty", stage));
            }
            for name in crate::tools::unknown_placeholders(stage, tool) {
                warnings.push(format!(
                    "tools.{} uses unknown placeholder '{{{}}}'",
                    stage, name
                ));
            }
        }

        warnings
    }
}

/// Values supplied on the command line; `None` keeps the file/env value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub references: Option<PathBuf>,
    pub reads: Option<PathBuf>,
    pub outdir: Option<PathBuf>,
    pub kmer: Option<u32>,
    pub scaled: Option<u32>,
    pub min_depth: Option<u32>,
    pub threshold: Option<f64>,
    pub no_plot: bool,
    pub max_parallel: Option<usize>,
    pub fail_fast: bool,
    pub verbose: bool,
}

/// Resolved configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Reference collection path
    pub references: PathBuf,
    /// Sample file or directory
    pub reads: PathBuf,
    /// Published output directory
    pub outdir: PathBuf,
    /// Everything else, after env and CLI overrides
    pub toml: PipelineToml,
    pub verbose: bool,
}

impl PipelineConfig {
    /// Merge file, environment and CLI layers into a run configuration.
    pub fn resolve(mut toml: PipelineToml, cli: CliOverrides) -> Result<Self, PipelineError> {
        toml.apply_env(|key| std::env::var(key).ok());
        Self::resolve_layers(toml, cli)
    }

    /// Merge an already env-adjusted file layer with CLI values.
    pub fn resolve_layers(mut toml: PipelineToml, cli: CliOverrides) -> Result<Self, PipelineError> {
        let params = &mut toml.params;
        if let Some(kmer) = cli.kmer {
            params.kmer = kmer;
        }
        if let Some(scaled) = cli.scaled {
            params.scaled = scaled;
        }
        if let Some(min_depth) = cli.min_depth {
            params.min_depth = min_depth;
        }
        if let Some(threshold) = cli.threshold {
            params.threshold = threshold;
        }
        if cli.no_plot {
            params.plot = false;
        }
        if let Some(max) = cli.max_parallel {
            toml.execution.max_parallel = max;
        }
        if cli.fail_fast {
            toml.execution.fail_fast = true;
        }

        let references = cli
            .references
            .or_else(|| toml.params.references.clone())
            .ok_or(InputError::Missing("references"))?;
        let reads = cli
            .reads
            .or_else(|| toml.params.reads.clone())
            .ok_or(InputError::Missing("reads"))?;
        let outdir = cli
            .outdir
            .or_else(|| toml.params.outdir.clone())
            .unwrap_or_else(|| PathBuf::from("output"));

        toml.check()?;

        Ok(Self {
            references,
            reads,
            outdir,
            toml,
            verbose: cli.verbose,
        })
    }

    pub fn params(&self) -> &ParamsSection {
        &self.toml.params
    }

    /// Artifact paths for this run's output directory.
    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(&self.outdir)
    }

    /// Scratch directory for intermediate artifacts.
    pub fn work_dir(&self) -> PathBuf {
        self.layout().work_dir().to_path_buf()
    }

    /// Where the run summary is written.
    pub fn summary_file(&self) -> PathBuf {
        self.layout().summary_file()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.outdir).with_context(|| {
            format!("Failed to create output directory {}", self.outdir.display())
        })?;
        std::fs::create_dir_all(self.work_dir()).context("Failed to create work directory")?;
        Ok(())
    }
}
