//! Typed error hierarchy for the containment pipeline.
//!
//! One enum per subsystem:
//! - `InputError`: input resolution failures (missing paths, empty directories)
//! - `TaskError`: a single task node's failure, classified for the retry policy
//! - `AggregationError`: fan-in failures
//! - `RecordError`: containment record parsing and writing
//! - `PipelineError`: what a whole run reports to the caller

use crate::dag::{RetryPolicy, Stage};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the input resolver.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Required input `{0}` was not provided")]
    Missing(&'static str),

    #[error("{role} path does not exist: {path}")]
    NotFound { role: &'static str, path: PathBuf },

    #[error("{role} path must be a file: {path}")]
    NotAFile { role: &'static str, path: PathBuf },

    #[error("No files matching [{extensions}] found in directory {dir}")]
    EmptyDirectory { dir: PathBuf, extensions: String },

    #[error("Failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Sample name '{name}' is produced by both {first} and {second}")]
    DuplicateSample {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Cannot derive a name from input path {0}")]
    UnnamedInput(PathBuf),
}

/// Errors from reading, validating or writing containment records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to read containment records from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to write containment records to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("{path} row {row}: containment '{value}' is not a score in [0, 1]")]
    InvalidScore {
        path: PathBuf,
        row: usize,
        value: String,
    },
}

/// Errors from merging per-sample results.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Aggregation invoked with no sample results")]
    NoInputs,

    #[error("Refusing to aggregate: sample branch(es) {} did not succeed", .0.join(", "))]
    FailedBranches(Vec<String>),

    #[error(transparent)]
    Records(#[from] RecordError),
}

/// How an external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSignal {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Errors from a single task node.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{stage} failed with {exit}: {stderr}")]
    ToolInvocation {
        stage: Stage,
        exit: ExitSignal,
        stderr: String,
    },

    #[error("{stage} ran out of memory ({exit}, {memory_mb} MB allocated): {stderr}")]
    ResourceExhaustion {
        stage: Stage,
        exit: ExitSignal,
        memory_mb: u64,
        stderr: String,
    },

    #[error("{stage} exceeded its wall-time limit of {}s", .limit.as_secs())]
    Timeout { stage: Stage, limit: Duration },

    #[error("Failed to spawn `{program}` for {stage}: {source}")]
    Spawn {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for {stage}: {source}")]
    Wait {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} was cancelled")]
    Cancelled { stage: Stage },

    #[error("{stage} task panicked: {message}")]
    Panicked { stage: Stage, message: String },

    #[error("Artifact {path} could not be prepared: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Records(#[from] RecordError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl TaskError {
    /// Whether the failure is of the out-of-memory class.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhaustion { .. })
    }

    /// Whether the failure was a wall-time overrun.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the retry policy may re-run the node after this failure.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        self.is_resource_exhaustion() || (self.is_timeout() && policy.retry_on_timeout)
    }

    /// Whether the failure came from an external cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A terminal node failure, with the owning branch identified.
#[derive(Debug)]
pub struct StageFailure {
    /// Node identifier (e.g. `search_containment:barcode01`)
    pub node: String,
    /// Stage the node belongs to
    pub stage: Stage,
    /// Sample branch, if the node is per-sample
    pub sample: Option<String>,
    /// Attempts made before giving up
    pub attempts: u32,
    /// The error of the last attempt
    pub error: TaskError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stage)?;
        if let Some(sample) = &self.sample {
            write!(f, " [sample {}]", sample)?;
        }
        if self.attempts > 1 {
            write!(f, " after {} attempts", self.attempts)?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Errors surfaced by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pipeline failed: {}", format_failures(.0))]
    RunFailed(Vec<StageFailure>),

    #[error("Pipeline was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_failures(failures: &[StageFailure]) -> String {
    match failures {
        [single] => single.to_string(),
        many => {
            let lines: Vec<String> = many.iter().map(|f| format!("\n  - {}", f)).collect();
            format!("{} stage(s) failed:{}", many.len(), lines.concat())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_error_empty_directory_names_dir_and_extensions() {
        let err = InputError::EmptyDirectory {
            dir: PathBuf::from("/data/reads"),
            extensions: "fastq, fq".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/reads"));
        assert!(msg.contains("fastq, fq"));
    }

    #[test]
    fn task_error_classification() {
        let oom = TaskError::ResourceExhaustion {
            stage: Stage::SearchContainment,
            exit: ExitSignal {
                code: Some(137),
                signal: None,
            },
            memory_mb: 4096,
            stderr: String::new(),
        };
        assert!(oom.is_resource_exhaustion());
        assert!(!oom.is_timeout());

        let timeout = TaskError::Timeout {
            stage: Stage::SketchSample,
            limit: Duration::from_secs(60),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_resource_exhaustion());
        assert!(timeout.to_string().contains("60s"));

        let mut policy = RetryPolicy::default();
        assert!(oom.is_retryable(&policy));
        assert!(!timeout.is_retryable(&policy));
        policy.retry_on_timeout = true;
        assert!(timeout.is_retryable(&policy));
    }

    #[test]
    fn exit_signal_display() {
        let code = ExitSignal {
            code: Some(1),
            signal: None,
        };
        assert_eq!(code.to_string(), "exit code 1");
        let signal = ExitSignal {
            code: None,
            signal: Some(9),
        };
        assert_eq!(signal.to_string(), "signal 9");
    }

    #[test]
    fn stage_failure_identifies_stage_sample_and_diagnostic() {
        let failure = StageFailure {
            node: "search_containment:barcode01".to_string(),
            stage: Stage::SearchContainment,
            sample: Some("barcode01".to_string()),
            attempts: 4,
            error: TaskError::ResourceExhaustion {
                stage: Stage::SearchContainment,
                exit: ExitSignal {
                    code: Some(137),
                    signal: None,
                },
                memory_mb: 32768,
                stderr: "Killed".to_string(),
            },
        };
        let msg = failure.to_string();
        assert!(msg.contains("search_containment"));
        assert!(msg.contains("barcode01"));
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("Killed"));
    }

    #[test]
    fn run_failed_lists_every_branch() {
        let failures = vec![
            StageFailure {
                node: "sketch_sample:a".to_string(),
                stage: Stage::SketchSample,
                sample: Some("a".to_string()),
                attempts: 1,
                error: TaskError::Cancelled {
                    stage: Stage::SketchSample,
                },
            },
            StageFailure {
                node: "sketch_sample:b".to_string(),
                stage: Stage::SketchSample,
                sample: Some("b".to_string()),
                attempts: 1,
                error: TaskError::Cancelled {
                    stage: Stage::SketchSample,
                },
            },
        ];
        let msg = PipelineError::RunFailed(failures).to_string();
        assert!(msg.contains("2 stage(s) failed"));
        assert!(msg.contains("[sample a]"));
        assert!(msg.contains("[sample b]"));
    }

    #[test]
    fn aggregation_error_lists_failed_branches() {
        let err = AggregationError::FailedBranches(vec!["a".to_string(), "b".to_string()]);
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&InputError::Missing("reads"));
        assert_std_error(&AggregationError::NoInputs);
        assert_std_error(&TaskError::Cancelled {
            stage: Stage::RenderSample,
        });
        assert_std_error(&PipelineError::Cancelled);
    }
}
