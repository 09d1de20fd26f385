//! Task graph construction and execution.
//!
//! ## Architecture
//!
//! 1. **Node** - Stages, artifact handles and the immutable task node
//! 2. **Builder** - Builds the run graph from resolved inputs
//! 3. **Scheduler** - Computes execution waves and tracks node status
//! 4. **Retry** - Per-node retry state machine with escalating memory
//! 5. **Executor** - Runs nodes in parallel under a concurrency limit
//!
//! ## Example
//!
//! ```no_run
//! use containment::config::PipelineToml;
//! use containment::dag::{DagBuilder, DagScheduler};
//! use containment::input::InputResolver;
//! use containment::layout::ArtifactLayout;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = PipelineToml::default();
//! let inputs = InputResolver::new(&config.inputs)
//!     .resolve(Path::new("refs.fasta"), Path::new("reads/"))?;
//! let layout = ArtifactLayout::new("output");
//! let graph = DagBuilder::new(&inputs, &layout, &config).build()?;
//!
//! let scheduler = DagScheduler::new(Arc::new(graph));
//! for (i, wave) in scheduler.compute_waves().iter().enumerate() {
//!     println!("wave {}: {:?}", i, wave);
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod node;
mod retry;
mod scheduler;
pub(crate) mod state;

pub use builder::{DagBuilder, RunGraph};
pub use executor::{DagExecutor, ExecutionResult, NodeEvent, NodeRunner};
pub use node::{ArtifactKind, ArtifactRef, NodeIndex, Stage, TaskNode};
pub use retry::{AttemptState, RetryMachine, RetryPolicy, Transition};
pub use scheduler::{DagConfig, DagScheduler, NodeStatus};
pub use state::{ExecutionTimer, NodeResult, RunState, RunSummary};
