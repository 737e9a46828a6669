//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use crate::cache::{CacheStore, SqliteCache};
use crate::config::{JobgraphConfig, PipelineConfig, default_pipeline_path, load_pipeline};
use crate::process::collect_output;
use crate::signals::CancellationToken;
use crate::template::CommandTemplate;
use crate::workflow::{
    ExecutorSettings, JobExecutor, JobGraph, JobStatus, Scheduler, ShellRunner, Trigger, plan,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Exit code for job failures
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for configuration and graph errors
pub const EXIT_CONFIG: i32 = 2;

/// Where the pipeline lives and how it is configured
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub pipeline_file: PathBuf,
    pub settings: JobgraphConfig,
}

impl Project {
    pub fn new(dir: PathBuf, pipeline_file: Option<PathBuf>, settings: JobgraphConfig) -> Self {
        let pipeline_file = match pipeline_file {
            Some(file) if file.is_relative() => dir.join(file),
            Some(file) => file,
            None => default_pipeline_path(&dir),
        };
        Self {
            dir,
            pipeline_file,
            settings,
        }
    }

    /// Load the pipeline, build its graph and check its command templates,
    /// reporting errors to `handler`
    fn load(&self, handler: &dyn OutputHandler) -> Option<(PipelineConfig, JobGraph)> {
        let pipeline = match load_pipeline(&self.pipeline_file) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                handler.emit(OutputEvent::PipelineError {
                    error: e.to_string(),
                });
                return None;
            }
        };

        let graph = match JobGraph::new(&pipeline) {
            Ok(graph) => graph,
            Err(e) => {
                handler.emit(OutputEvent::PipelineError {
                    error: e.to_string(),
                });
                return None;
            }
        };

        let errors = template_errors(&pipeline);
        if !errors.is_empty() {
            handler.emit(OutputEvent::PipelineError {
                error: format!(
                    "pipeline '{}' has {} template error(s)",
                    pipeline.name,
                    errors.len()
                ),
            });
            for err in &errors {
                handler.emit(OutputEvent::Info {
                    message: format!("  - {}", err),
                });
            }
            return None;
        }

        Some((pipeline, graph))
    }

    fn open_cache(&self) -> anyhow::Result<CacheStore> {
        let dir = self.settings.defaults.cache_dir(&self.dir);
        let backend = SqliteCache::open_dir(&dir)?;
        Ok(CacheStore::new(Arc::new(backend)))
    }
}

/// Flags for `run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub workers: Option<usize>,
    /// Keep the cache in memory for this run only
    pub no_cache_persist: bool,
    pub verbose_cache: bool,
    /// Step output directory (defaults to a timestamped temp dir)
    pub output_dir: Option<PathBuf>,
}

/// Run the pipeline for a trigger
pub async fn run_pipeline(
    project: &Project,
    options: RunOptions,
    cancel: CancellationToken,
    handler: &dyn OutputHandler,
) -> anyhow::Result<i32> {
    let Some((pipeline, graph)) = project.load(handler) else {
        return Ok(EXIT_CONFIG);
    };
    let trigger = resolve_trigger(&project.dir, options.branch, options.commit).await;
    let defaults = &project.settings.defaults;

    let cache = if options.no_cache_persist {
        CacheStore::in_memory()
    } else {
        match project.open_cache() {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(error = %e, "Persistent cache unavailable, using in-memory cache");
                CacheStore::in_memory()
            }
        }
    }
    .with_verbose(options.verbose_cache || defaults.verbose_cache);

    let output_dir = options
        .output_dir
        .unwrap_or_else(|| default_output_dir(&pipeline.name));

    let settings = ExecutorSettings {
        root: project.dir.clone(),
        step_timeout: defaults.step_timeout(),
        arch: defaults.arch(),
        output_dir: Some(output_dir.clone()),
    };
    let executor = JobExecutor::new(Arc::new(ShellRunner::new()), cache, settings)
        .with_cancellation(cancel);
    let scheduler = Scheduler::new(executor, options.workers.unwrap_or(defaults.workers));

    handler.emit(OutputEvent::PipelineStart {
        name: pipeline.name.clone(),
        jobs: graph.len(),
        branch: trigger.branch.clone(),
        commit: trigger.commit.clone(),
    });

    let mut events = scheduler.subscribe();
    let run = scheduler.execute(Arc::new(graph), &trigger);
    tokio::pin!(run);

    let mut open = true;
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            event = events.recv(), if open => match event {
                Ok(event) => handler.emit(event.into()),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Output fell behind, events dropped");
                }
                Err(RecvError::Closed) => open = false,
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        handler.emit(event.into());
    }

    handler.emit(OutputEvent::PipelineComplete {
        success: result.success(),
        duration_ms: result.duration_ms,
        succeeded: result.count(JobStatus::Succeeded),
        failed: result.count(JobStatus::Failed),
        skipped: result.count(JobStatus::Skipped),
    });
    handler.emit(OutputEvent::Info {
        message: format!("Step output saved to {}", output_dir.display()),
    });
    handler.result(result.success(), None);

    Ok(result.exit_code())
}

/// Show which jobs a trigger would run
pub async fn plan_pipeline(
    project: &Project,
    branch: Option<String>,
    commit: Option<String>,
    handler: &dyn OutputHandler,
) -> i32 {
    let Some((pipeline, graph)) = project.load(handler) else {
        return EXIT_CONFIG;
    };
    let trigger = resolve_trigger(&project.dir, branch, commit).await;
    let plan = plan(&graph, &trigger);

    handler.emit(OutputEvent::Info {
        message: format!(
            "Plan for '{}' on {} @ {}:",
            pipeline.name, trigger.branch, trigger.commit
        ),
    });
    for run in plan.ordered() {
        handler.emit(OutputEvent::PlanEntry {
            job: run.job.clone(),
            admitted: run.status == JobStatus::Pending,
            reason: run.skip_reason.as_ref().map(|r| r.to_string()),
        });
    }
    handler.result(true, None);
    0
}

/// Syntax errors in step commands, one line per step
fn template_errors(pipeline: &PipelineConfig) -> Vec<String> {
    let templates = CommandTemplate::new();
    pipeline
        .jobs
        .iter()
        .flat_map(|job| job.steps.iter().map(move |step| (job, step)))
        .filter_map(|(job, step)| {
            templates
                .validate(&step.run)
                .err()
                .map(|e| format!("job '{}' step '{}': {}", job.name, step.name, e))
        })
        .collect()
}

/// Validate the pipeline file, its graph, and its command templates
pub fn validate_pipeline(project: &Project, handler: &dyn OutputHandler) -> i32 {
    let Some((pipeline, graph)) = project.load(handler) else {
        return EXIT_CONFIG;
    };

    let steps: usize = pipeline.jobs.iter().map(|j| j.steps.len()).sum();
    handler.emit(OutputEvent::Info {
        message: format!(
            "✓ Pipeline '{}' is valid ({} jobs, {} steps)",
            pipeline.name,
            graph.len(),
            steps
        ),
    });
    0
}

/// List persistent cache entries
pub fn cache_list(project: &Project, handler: &dyn OutputHandler) -> anyhow::Result<i32> {
    let entries = project.open_cache()?.list()?;
    if entries.is_empty() {
        handler.emit(OutputEvent::Info {
            message: "(cache is empty)".into(),
        });
        return Ok(0);
    }

    for entry in &entries {
        handler.emit(OutputEvent::Info {
            message: format!(
                "{}  {} files, {} bytes, {}",
                entry.key,
                entry.files,
                entry.bytes,
                entry.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
        });
    }
    Ok(0)
}

/// Remove every persistent cache entry
pub fn cache_clear(project: &Project, handler: &dyn OutputHandler) -> anyhow::Result<i32> {
    let removed = project.open_cache()?.clear()?;
    handler.emit(OutputEvent::Info {
        message: format!("Removed {} cache entries", removed),
    });
    Ok(0)
}

/// Fill in branch and commit from git when not given
pub async fn resolve_trigger(dir: &Path, branch: Option<String>, commit: Option<String>) -> Trigger {
    let branch = match branch {
        Some(branch) => branch,
        None => git_rev_parse(dir, &["--abbrev-ref", "HEAD"]).await,
    };
    let commit = match commit {
        Some(commit) => commit,
        None => git_rev_parse(dir, &["HEAD"]).await,
    };
    Trigger::new(branch, commit)
}

async fn git_rev_parse(dir: &Path, args: &[&str]) -> String {
    let spawned = tokio::process::Command::new("git")
        .arg("rev-parse")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(error = %e, "git unavailable");
            return "unknown".into();
        }
    };

    match collect_output(&mut child).await {
        Ok(out) if out.success => {
            let value = out.stdout.trim();
            if value.is_empty() {
                "unknown".into()
            } else {
                value.to_string()
            }
        }
        Ok(out) => {
            tracing::debug!(
                exit_code = ?out.exit_code,
                elapsed_ms = out.elapsed.as_millis() as u64,
                stderr = %out.combined(),
                "git rev-parse failed"
            );
            "unknown".into()
        }
        Err(e) => {
            tracing::debug!(error = %e, "git output unreadable");
            "unknown".into()
        }
    }
}

/// `<tmp>/jobgraph/runs/<pipeline>-<timestamp>`
fn default_output_dir(pipeline: &str) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let name: String = pipeline
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    std::env::temp_dir()
        .join("jobgraph")
        .join("runs")
        .join(format!("{}-{}", name, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockHandler {
        events: Mutex<Vec<OutputEvent>>,
    }

    impl MockHandler {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<OutputEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl OutputHandler for MockHandler {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }
        fn result(&self, _success: bool, _output: Option<&str>) {}
    }

    const PIPELINE: &str = r#"
name = "ci"

[[jobs]]
name = "test"

[[jobs.steps]]
name = "checkout"
run = "echo checkout"

[[jobs.steps]]
name = "lint"
run = "exit 1"
best_effort = true

[[jobs.steps]]
name = "test"
run = "echo tested {{ branch }}"

[[jobs]]
name = "deploy-dev"
requires = ["test"]
branches = { only = ["develop"] }

[[jobs.steps]]
name = "deploy"
run = "echo dev"

[[jobs]]
name = "deploy-master"
requires = ["test"]
branches = { only = ["master"] }

[[jobs.steps]]
name = "deploy"
run = "echo master"
"#;

    fn project(dir: &TempDir, pipeline: &str) -> Project {
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, pipeline).unwrap();
        let mut settings = JobgraphConfig::default();
        settings.defaults.cache_dir = Some(dir.path().join("cache").display().to_string());
        Project::new(dir.path().to_path_buf(), Some(path), settings)
    }

    fn options(dir: &TempDir, branch: &str) -> RunOptions {
        RunOptions {
            branch: Some(branch.into()),
            commit: Some("abc123".into()),
            output_dir: Some(dir.path().join("out")),
            ..Default::default()
        }
    }

    fn completed_jobs(handler: &MockHandler) -> Vec<(String, String)> {
        handler
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::JobComplete { job, status, .. } => Some((job, status)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_develop() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, PIPELINE);
        let handler = MockHandler::new();

        let code = run_pipeline(
            &project,
            options(&dir, "develop"),
            CancellationToken::new(),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let jobs = completed_jobs(&handler);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.contains(&("deploy-dev".into(), "succeeded".into())));
        assert!(jobs.contains(&("deploy-master".into(), "skipped".into())));

        let out = dir.path().join("out");
        assert_eq!(
            std::fs::read_to_string(out.join("test").join("test.txt")).unwrap(),
            "tested develop"
        );
        assert!(out.join("test").join("lint.failed.txt").exists());
    }

    #[tokio::test]
    async fn test_run_failure_exit_code() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, &PIPELINE.replace("echo checkout", "exit 7"));
        let handler = MockHandler::new();

        let code = run_pipeline(
            &project,
            options(&dir, "develop"),
            CancellationToken::new(),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_FAILURE);

        let jobs = completed_jobs(&handler);
        assert!(jobs.contains(&("test".into(), "failed".into())));
        assert!(jobs.contains(&("deploy-dev".into(), "skipped".into())));
    }

    #[tokio::test]
    async fn test_run_cycle_is_config_error() {
        let dir = TempDir::new().unwrap();
        let pipeline = r#"
[[jobs]]
name = "a"
requires = ["b"]
steps = [{ name = "s", run = "true" }]

[[jobs]]
name = "b"
requires = ["a"]
steps = [{ name = "s", run = "true" }]
"#;
        let project = project(&dir, pipeline);
        let handler = MockHandler::new();

        let code = run_pipeline(
            &project,
            options(&dir, "main"),
            CancellationToken::new(),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_CONFIG);
        assert!(completed_jobs(&handler).is_empty());
        assert!(matches!(
            handler.events()[0],
            OutputEvent::PipelineError { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_rejects_template_errors_before_running() {
        let dir = TempDir::new().unwrap();
        // Broken template in a job the develop trigger would only reach last
        let project = project(&dir, &PIPELINE.replace("echo dev", "echo {{ branch"));
        let handler = MockHandler::new();

        let code = run_pipeline(
            &project,
            options(&dir, "develop"),
            CancellationToken::new(),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_CONFIG);
        assert_eq!(code, validate_pipeline(&project, &MockHandler::new()));
        assert!(completed_jobs(&handler).is_empty());
        assert!(!dir.path().join("out").exists());
        assert!(handler.events().iter().any(|e| matches!(
            e,
            OutputEvent::Info { message } if message.contains("deploy-dev")
        )));
    }

    #[tokio::test]
    async fn test_plan_rejects_template_errors() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, &PIPELINE.replace("echo master", "echo {% if %}"));
        let handler = MockHandler::new();

        let code = plan_pipeline(&project, Some("develop".into()), Some("c1".into()), &handler).await;
        assert_eq!(code, EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_run_missing_pipeline() {
        let dir = TempDir::new().unwrap();
        let project = Project::new(dir.path().to_path_buf(), None, JobgraphConfig::default());
        let handler = MockHandler::new();

        let code = run_pipeline(
            &project,
            options(&dir, "main"),
            CancellationToken::new(),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_plan_feature_branch() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, PIPELINE);
        let handler = MockHandler::new();

        let code = plan_pipeline(&project, Some("feature-x".into()), Some("c1".into()), &handler).await;
        assert_eq!(code, 0);

        let admitted: Vec<String> = handler
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::PlanEntry {
                    job, admitted: true, ..
                } => Some(job),
                _ => None,
            })
            .collect();
        assert_eq!(admitted, vec!["test"]);
        // Planning runs nothing
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_validate_reports_template_errors() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, &PIPELINE.replace("echo dev", "echo {{ branch"));
        let handler = MockHandler::new();

        assert_eq!(validate_pipeline(&project, &handler), EXIT_CONFIG);
        let messages: Vec<String> = handler
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Info { message } => Some(message),
                _ => None,
            })
            .collect();
        assert!(messages.iter().any(|m| m.contains("deploy-dev")));
    }

    #[test]
    fn test_validate_ok() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, PIPELINE);
        let handler = MockHandler::new();
        assert_eq!(validate_pipeline(&project, &handler), 0);
    }

    #[tokio::test]
    async fn test_cache_list_and_clear() {
        let dir = TempDir::new().unwrap();
        let pipeline = r#"
[[jobs]]
name = "deps"

[[jobs.steps]]
name = "install"
run = "mkdir -p vendor && echo lib > vendor/lib.txt"
save_cache = { prefix = "deps", files = ["deps.lock"], paths = ["vendor"] }
"#;
        std::fs::write(dir.path().join("deps.lock"), "v1").unwrap();
        let project = project(&dir, pipeline);

        let handler = MockHandler::new();
        let code = run_pipeline(
            &project,
            options(&dir, "main"),
            CancellationToken::new(),
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let handler = MockHandler::new();
        cache_list(&project, &handler).unwrap();
        match &handler.events()[..] {
            [OutputEvent::Info { message }] => assert!(message.starts_with("deps-")),
            other => panic!("unexpected events {:?}", other),
        }

        let handler = MockHandler::new();
        cache_clear(&project, &handler).unwrap();
        let handler = MockHandler::new();
        cache_list(&project, &handler).unwrap();
        match &handler.events()[..] {
            [OutputEvent::Info { message }] => assert_eq!(message, "(cache is empty)"),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_trigger_outside_git() {
        let dir = TempDir::new().unwrap();
        let trigger = resolve_trigger(dir.path(), None, Some("c1".into())).await;
        assert_eq!(trigger.branch, "unknown");
        assert_eq!(trigger.commit, "c1");
    }

    #[test]
    fn test_project_default_pipeline_path() {
        let project = Project::new(PathBuf::from("/repo"), None, JobgraphConfig::default());
        assert_eq!(
            project.pipeline_file,
            PathBuf::from("/repo/.jobgraph/pipeline.toml")
        );
    }
}
