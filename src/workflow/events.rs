//! Run events for log sinks

use super::state::{JobStatus, SkipReason, StepResult};
use serde::Serialize;
use tokio::sync::broadcast;

/// Events emitted while a pipeline runs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    JobStarted {
        job: String,
    },
    StepFinished {
        job: String,
        result: StepResult,
    },
    JobFinished {
        job: String,
        status: JobStatus,
        skip_reason: Option<SkipReason>,
        duration_ms: Option<u64>,
    },
}

impl RunEvent {
    pub fn job(&self) -> &str {
        match self {
            RunEvent::JobStarted { job }
            | RunEvent::StepFinished { job, .. }
            | RunEvent::JobFinished { job, .. } => job,
        }
    }
}

/// Stream of one job's step results
///
/// Ends when the job finishes or the event channel closes.
pub struct JobLog {
    job: String,
    receiver: broadcast::Receiver<RunEvent>,
    done: bool,
}

impl JobLog {
    pub fn for_job(job: impl Into<String>, receiver: broadcast::Receiver<RunEvent>) -> Self {
        Self {
            job: job.into(),
            receiver,
            done: false,
        }
    }

    /// Next step result for this job
    pub async fn next(&mut self) -> Option<StepResult> {
        while !self.done {
            match self.receiver.recv().await {
                Ok(RunEvent::StepFinished { job, result }) if job == self.job => {
                    return Some(result);
                }
                Ok(RunEvent::JobFinished { job, .. }) if job == self.job => {
                    self.done = true;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(job = %self.job, missed, "Job log lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                }
            }
        }
        None
    }
}
