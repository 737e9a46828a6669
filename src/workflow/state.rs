//! Job run state and results

use crate::config::StepErrorKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The event that starts a pipeline evaluation
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Trigger {
    pub branch: String,
    pub commit: String,
}

impl Trigger {
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit: commit.into(),
        }
    }
}

/// Lifecycle of a job run
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Skipped)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a job was skipped
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The branch filter excludes the trigger branch
    BranchFilter { branch: String },
    /// A dependency failed or was skipped
    Dependency { job: String, status: JobStatus },
    /// The pipeline was cancelled before the job started
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BranchFilter { branch } => {
                write!(f, "branch '{}' excluded by filter", branch)
            }
            SkipReason::Dependency { job, status } => {
                write!(f, "dependency '{}' {}", job, status)
            }
            SkipReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Attempted a transition the state machine does not allow
#[derive(Debug, Error, PartialEq, Eq)]
#[error("job '{job}' cannot go from {from} to {to}")]
pub struct InvalidTransition {
    pub job: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Result of running one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name
    pub step: String,

    /// Process exit code, if the process ran and exited
    pub exit_code: Option<i32>,

    /// Captured stdout followed by stderr
    pub output: String,

    /// Execution duration in milliseconds
    pub duration_ms: u64,

    /// Failure, if the step did not succeed
    pub error: Option<StepErrorKind>,

    /// Failure does not abort the job
    pub best_effort: bool,

    pub started_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(step: impl Into<String>, output: String, duration: Duration) -> Self {
        Self {
            step: step.into(),
            exit_code: Some(0),
            output,
            duration_ms: duration.as_millis() as u64,
            error: None,
            best_effort: false,
            started_at: Utc::now(),
        }
    }

    pub fn failure(
        step: impl Into<String>,
        error: StepErrorKind,
        output: String,
        duration: Duration,
    ) -> Self {
        let exit_code = match &error {
            StepErrorKind::CommandFailure { exit_code } => *exit_code,
            _ => None,
        };
        Self {
            step: step.into(),
            exit_code,
            output,
            duration_ms: duration.as_millis() as u64,
            error: Some(error),
            best_effort: false,
            started_at: Utc::now(),
        }
    }

    pub fn with_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// A failure that ends the job
    pub fn is_fatal(&self) -> bool {
        !self.succeeded() && !self.best_effort
    }
}

/// One job's execution for one trigger
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job: String,
    pub status: JobStatus,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepResult>,
    /// Failure does not affect the pipeline exit code
    pub best_effort: bool,
}

impl JobRun {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            status: JobStatus::Pending,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            steps: Vec::new(),
            best_effort: false,
        }
    }

    pub fn with_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                job: self.job.clone(),
                from: self.status,
                to,
            });
        }
        tracing::debug!(job = %self.job, from = %self.status, to = %to, "Job transition");
        self.status = to;
        Ok(())
    }

    /// Pending -> Running
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Succeeded | Failed
    pub fn finish(&mut self, succeeded: bool) -> Result<(), InvalidTransition> {
        let to = if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.transition(to)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Pending -> Skipped
    pub fn skip(&mut self, reason: SkipReason) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Skipped)?;
        self.skip_reason = Some(reason);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Wall-clock duration of a started run
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    /// Counts against the pipeline result
    pub fn is_blocking_failure(&self) -> bool {
        self.status == JobStatus::Failed && !self.best_effort
    }
}

/// Outcome of a whole pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub trigger: Trigger,
    /// Runs in topological order
    pub runs: Vec<JobRun>,
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Every non-skipped, non-best-effort run succeeded
    pub fn success(&self) -> bool {
        !self.runs.iter().any(JobRun::is_blocking_failure)
    }

    /// Process exit code: 0 on success, 1 on job failure
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    pub fn run(&self, job: &str) -> Option<&JobRun> {
        self.runs.iter().find(|r| r.job == job)
    }

    pub fn status(&self, job: &str) -> Option<JobStatus> {
        self.run(job).map(|r| r.status)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }
}
