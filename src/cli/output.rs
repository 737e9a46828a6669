//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON lines, and quiet output modes.

use crate::workflow::{RunEvent, StepResult};
use serde::Serialize;
use std::io::{self, Write};

/// Lines of a failed step's output shown on the console
const FAILURE_TAIL_LINES: usize = 20;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Events rendered by output handlers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    PipelineStart {
        name: String,
        jobs: usize,
        branch: String,
        commit: String,
    },
    PlanEntry {
        job: String,
        admitted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    JobStart {
        job: String,
    },
    StepComplete {
        job: String,
        step: String,
        success: bool,
        best_effort: bool,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
        output: String,
    },
    JobComplete {
        job: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        duration_ms: Option<u64>,
    },
    PipelineComplete {
        success: bool,
        duration_ms: u64,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    PipelineError {
        error: String,
    },
    Info {
        message: String,
    },
    Debug {
        message: String,
    },
}

impl From<RunEvent> for OutputEvent {
    fn from(event: RunEvent) -> Self {
        match event {
            RunEvent::JobStarted { job } => OutputEvent::JobStart { job },
            RunEvent::StepFinished { job, result } => step_complete(job, result),
            RunEvent::JobFinished {
                job,
                status,
                skip_reason,
                duration_ms,
            } => OutputEvent::JobComplete {
                job,
                status: status.to_string(),
                reason: skip_reason.map(|r| r.to_string()),
                duration_ms,
            },
        }
    }
}

fn step_complete(job: String, result: StepResult) -> OutputEvent {
    OutputEvent::StepComplete {
        job,
        success: result.succeeded(),
        best_effort: result.best_effort,
        exit_code: result.exit_code,
        error: result.error.as_ref().map(|e| e.to_string()),
        duration_ms: result.duration_ms,
        step: result.step,
        output: result.output,
    }
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write final result
    fn result(&self, success: bool, output: Option<&str>);
}

/// Console output handler
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }

    fn tail(output: &str, lines: usize) -> Vec<&str> {
        let all: Vec<&str> = output.lines().collect();
        all[all.len().saturating_sub(lines)..].to_vec()
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::PipelineStart {
                name,
                jobs,
                branch,
                commit,
            } => {
                eprintln!(
                    "Running pipeline '{}' ({} jobs) on {} @ {}",
                    name, jobs, branch, commit
                );
            }
            OutputEvent::PlanEntry {
                job,
                admitted,
                reason,
            } => {
                if admitted {
                    eprintln!("  run   {}", job);
                } else {
                    eprintln!("  skip  {} ({})", job, reason.unwrap_or_default());
                }
            }
            OutputEvent::JobStart { job } => {
                eprintln!("▶ {}", job);
            }
            OutputEvent::StepComplete {
                job,
                step,
                success,
                best_effort,
                error,
                duration_ms,
                output,
                ..
            } => {
                let duration = Self::format_duration(duration_ms);
                if success {
                    eprintln!("  ✓ {}/{} ({})", job, step, duration);
                } else {
                    let marker = if best_effort { "~" } else { "✗" };
                    eprintln!(
                        "  {} {}/{}: {} ({})",
                        marker,
                        job,
                        step,
                        error.unwrap_or_default(),
                        duration
                    );
                    if !best_effort || self.debug {
                        for line in Self::tail(&output, FAILURE_TAIL_LINES) {
                            eprintln!("      {}", line);
                        }
                    }
                }
                let _ = io::stderr().flush();
            }
            OutputEvent::JobComplete {
                job,
                status,
                reason,
                duration_ms,
            } => match (reason, duration_ms) {
                (Some(reason), _) => eprintln!("- {} {}: {}", job, status, reason),
                (None, Some(ms)) => {
                    eprintln!("■ {} {} ({})", job, status, Self::format_duration(ms))
                }
                (None, None) => eprintln!("■ {} {}", job, status),
            },
            OutputEvent::PipelineComplete {
                success,
                duration_ms,
                succeeded,
                failed,
                skipped,
            } => {
                eprintln!();
                let mark = if success { "✓" } else { "✗" };
                eprintln!(
                    "{} Pipeline {} in {}: {} succeeded, {} failed, {} skipped",
                    mark,
                    if success { "passed" } else { "failed" },
                    Self::format_duration(duration_ms),
                    succeeded,
                    failed,
                    skipped
                );
            }
            OutputEvent::PipelineError { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
            OutputEvent::Debug { message } => {
                if self.debug {
                    eprintln!("[debug] {}", message);
                }
            }
        }
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// JSON lines output handler
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn result(&self, success: bool, output: Option<&str>) {
        #[derive(Serialize)]
        struct FinalResult<'a> {
            success: bool,
            output: Option<&'a str>,
        }

        self.print_json(&FinalResult { success, output });
    }
}

/// Quiet handler: only errors and the final result
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, event: OutputEvent) {
        if let OutputEvent::PipelineError { error } = event {
            eprintln!("Error: {}", error);
        }
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        // One event per line
        OutputMode::Json => Box::new(JsonHandler::new(false)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}
