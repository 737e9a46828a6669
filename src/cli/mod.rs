//! CLI module for jobgraph
//!
//! This module provides:
//! - Command implementations (run, plan, validate, cache)
//! - Output handlers (console, JSON lines, quiet)
//!
//! # Example
//!
//! ```ignore
//! use jobgraph::cli::{commands, output};
//!
//! let handler = output::create_handler(output::OutputMode::Console, false);
//! let exit_code = commands::run_pipeline(&project, options, cancel, &*handler).await?;
//! ```

pub mod commands;
pub mod output;

pub use commands::{
    EXIT_CONFIG, Project, RunOptions, cache_clear, cache_list, plan_pipeline, run_pipeline,
    validate_pipeline,
};
pub use output::{OutputMode, create_handler};
