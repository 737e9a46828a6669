//! Step execution: one shell command with captured output

use super::state::StepResult;
use crate::config::{StepConfig, StepErrorKind};
use crate::process::{OutputCapture, combine_streams, exit_status_code, terminate_process_group};
use crate::signals::CancellationToken;
use crate::template::{CommandContext, CommandTemplate};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;

/// Time a terminated step gets between SIGTERM and SIGKILL
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// A command ready to hand to the execution environment
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub script: String,
    pub working_dir: PathBuf,
    /// Added on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

/// What the execution environment reports for a command that ran
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub output: String,
    pub duration: Duration,
}

/// Failures of the execution environment itself
///
/// Variants raised after the command started carry the output captured so far.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{message}")]
    Io { message: String, output: String },

    #[error("command timed out after {after:?}")]
    Timeout { after: Duration, output: String },

    #[error("command cancelled")]
    Cancelled { output: String },
}

impl RunnerError {
    /// Output captured before the failure
    pub fn into_output(self) -> String {
        match self {
            RunnerError::Spawn(_) => String::new(),
            RunnerError::Io { output, .. }
            | RunnerError::Timeout { output, .. }
            | RunnerError::Cancelled { output } => output,
        }
    }
}

/// Execution environment for step commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A nonzero exit is `Ok`, not an error.
    async fn run(&self, command: &StepCommand) -> Result<CommandOutput, RunnerError>;
}

/// Runs commands through `sh -c` on the host
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different shell binary (must accept `-c <script>`)
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &StepCommand) -> Result<CommandOutput, RunnerError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command.script)
            .current_dir(&command.working_dir)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination reaches everything the script starts
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(RunnerError::Spawn)?;
        let capture = OutputCapture::start(&mut child);

        let deadline = async {
            match command.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                let status = match status {
                    Ok(status) => status,
                    Err(e) => {
                        terminate_process_group(&mut child, TERMINATION_GRACE).await;
                        return Err(RunnerError::Io {
                            message: format!("failed to wait for process: {}", e),
                            output: capture.drain(TERMINATION_GRACE).await,
                        });
                    }
                };
                let (stdout, stderr) = capture.finish().await.map_err(|e| RunnerError::Io {
                    message: e.to_string(),
                    output: String::new(),
                })?;
                Ok(CommandOutput {
                    exit_code: exit_status_code(&status),
                    success: status.success(),
                    output: combine_streams(&stdout, &stderr),
                    duration: start.elapsed(),
                })
            }
            _ = deadline => {
                terminate_process_group(&mut child, TERMINATION_GRACE).await;
                Err(RunnerError::Timeout {
                    after: command.timeout.unwrap_or_default(),
                    output: capture.drain(TERMINATION_GRACE).await,
                })
            }
            _ = command.cancel.cancelled() => {
                terminate_process_group(&mut child, TERMINATION_GRACE).await;
                Err(RunnerError::Cancelled {
                    output: capture.drain(TERMINATION_GRACE).await,
                })
            }
        }
    }
}

/// Per-step inputs from the job executor
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job: String,
    pub branch: String,
    pub commit: String,
    pub working_dir: PathBuf,
    /// Job env plus trigger variables
    pub env: BTreeMap<String, String>,
    pub default_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Turns a step definition into a `StepResult`
///
/// Never fails: environment errors, timeouts and cancellation become the
/// result's error kind.
#[derive(Clone)]
pub struct StepRunner {
    runner: Arc<dyn CommandRunner>,
    templates: Arc<CommandTemplate>,
}

impl StepRunner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            templates: Arc::new(CommandTemplate::new()),
        }
    }

    pub async fn run(&self, step: &StepConfig, ctx: &StepContext) -> StepResult {
        let started_at = Utc::now();
        let start = Instant::now();

        if ctx.cancel.is_cancelled() {
            return StepResult::failure(&step.name, StepErrorKind::Cancelled, String::new(), Duration::ZERO)
                .with_best_effort(step.best_effort)
                .with_started_at(started_at);
        }

        let template_ctx = CommandContext {
            branch: ctx.branch.clone(),
            commit: ctx.commit.clone(),
            job: ctx.job.clone(),
            step: step.name.clone(),
        };
        let script = match self.templates.render(&step.run, &template_ctx) {
            Ok(script) => script,
            Err(e) => {
                return StepResult::failure(
                    &step.name,
                    StepErrorKind::ExecutionEnvironment {
                        message: e.to_string(),
                    },
                    String::new(),
                    start.elapsed(),
                )
                .with_best_effort(step.best_effort)
                .with_started_at(started_at);
            }
        };

        let mut env = ctx.env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("JOBGRAPH_STEP".into(), step.name.clone());

        let timeout = step
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(ctx.default_timeout);

        let command = StepCommand {
            script,
            working_dir: ctx.working_dir.clone(),
            env,
            timeout: Some(timeout),
            cancel: ctx.cancel.clone(),
        };

        tracing::debug!(job = %ctx.job, step = %step.name, "Running step");

        let result = match self.runner.run(&command).await {
            Ok(out) if out.success => StepResult::success(&step.name, out.output, out.duration),
            Ok(out) => StepResult::failure(
                &step.name,
                StepErrorKind::CommandFailure {
                    exit_code: out.exit_code,
                },
                out.output,
                out.duration,
            ),
            Err(e) => {
                let kind = match &e {
                    RunnerError::Timeout { after, .. } => StepErrorKind::Timeout { after: *after },
                    RunnerError::Cancelled { .. } => StepErrorKind::Cancelled,
                    other => StepErrorKind::ExecutionEnvironment {
                        message: other.to_string(),
                    },
                };
                StepResult::failure(&step.name, kind, e.into_output(), start.elapsed())
            }
        };

        result
            .with_best_effort(step.best_effort)
            .with_started_at(started_at)
    }
}
