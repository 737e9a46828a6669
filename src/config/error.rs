//! Error types for jobgraph

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Why a step did not succeed
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The command ran and exited nonzero
    #[error("command exited with code {}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    CommandFailure { exit_code: Option<i32> },

    /// The command could not be launched or waited on
    #[error("execution environment error: {message}")]
    ExecutionEnvironment { message: String },

    /// The command exceeded its deadline and was killed
    #[error("timeout after {after:?}")]
    Timeout { after: Duration },

    /// The run was cancelled while the step was pending or running
    #[error("cancelled")]
    Cancelled,
}

impl StepErrorKind {
    /// True when the command itself ran to completion
    pub fn is_command_failure(&self) -> bool {
        matches!(self, StepErrorKind::CommandFailure { .. })
    }
}

/// Errors while loading settings or pipeline files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid pipeline:\n  {}", .errors.join("\n  "))]
    InvalidPipeline { errors: Vec<String> },

    #[error("pipeline file not found: {path}")]
    NotFound { path: String },
}
