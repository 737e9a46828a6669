//! Pipeline execution engine for jobgraph
//!
//! This module handles:
//! - Job graph validation and topological ordering
//! - Planning a trigger against branch filters
//! - Running steps, caching around them, and gating dependents
//!
//! # Example
//!
//! ```ignore
//! use jobgraph::workflow::{JobExecutor, JobGraph, Scheduler, ShellRunner, Trigger};
//!
//! let graph = Arc::new(JobGraph::new(&pipeline)?);
//! let executor = JobExecutor::new(Arc::new(ShellRunner::new()), cache, settings);
//! let scheduler = Scheduler::new(executor, 4);
//!
//! let result = scheduler.execute(graph, &Trigger::new("develop", "abc123")).await;
//! std::process::exit(result.exit_code());
//! ```

mod events;
mod executor;
mod graph;
mod scheduler;
mod state;
mod step;

pub use events::{JobLog, RunEvent};
pub use executor::{ExecutorSettings, JobExecutor};
pub use graph::{GraphError, JobGraph};
pub use scheduler::{Plan, Scheduler, plan};
pub use state::{JobRun, JobStatus, PipelineResult, SkipReason, StepResult, Trigger};
pub use step::{CommandRunner, ShellRunner, StepRunner};
