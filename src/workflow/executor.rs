//! Job execution: ordered steps with cache restore/save

use super::events::RunEvent;
use super::state::{JobRun, StepResult, Trigger};
use super::step::{CommandRunner, StepContext, StepRunner};
use crate::cache::{CacheError, CacheStore, collect_blobs, fingerprint, restore_blobs};
use crate::config::{JobConfig, StepConfig};
use crate::signals::CancellationToken;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Settings shared by every job in a run
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Pipeline root; job working directories are relative to it
    pub root: PathBuf,
    pub step_timeout: Duration,
    /// Architecture tag for cache fingerprints
    pub arch: String,
    /// Where step outputs are saved, if anywhere
    pub output_dir: Option<PathBuf>,
}

impl ExecutorSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            step_timeout: Duration::from_secs(600),
            arch: std::env::consts::ARCH.to_string(),
            output_dir: None,
        }
    }
}

/// Runs one job's steps in order
pub struct JobExecutor {
    steps: StepRunner,
    cache: CacheStore,
    settings: ExecutorSettings,
    events: broadcast::Sender<RunEvent>,
    cancel: CancellationToken,
}

impl JobExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, cache: CacheStore, settings: ExecutorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            steps: StepRunner::new(runner),
            cache,
            settings,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &broadcast::Sender<RunEvent> {
        &self.events
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn working_dir(&self, job: &JobConfig) -> PathBuf {
        match &job.working_directory {
            Some(dir) => self.settings.root.join(dir),
            None => self.settings.root.clone(),
        }
    }

    fn job_env(job: &JobConfig, trigger: &Trigger) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("CI".to_string(), "true".to_string()),
            ("JOBGRAPH_BRANCH".to_string(), trigger.branch.clone()),
            ("JOBGRAPH_COMMIT".to_string(), trigger.commit.clone()),
            ("JOBGRAPH_JOB".to_string(), job.name.clone()),
        ]);
        env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Run `job` for `trigger` and return its terminal run
    pub async fn execute(&self, job: &JobConfig, trigger: &Trigger) -> JobRun {
        let mut run = JobRun::new(&job.name).with_best_effort(job.best_effort);
        if let Err(e) = run.start() {
            tracing::error!(error = %e, "Fresh job run refused to start");
            return run;
        }
        self.emit(RunEvent::JobStarted {
            job: job.name.clone(),
        });
        tracing::info!(job = %job.name, steps = job.steps.len(), "Job started");

        let working_dir = self.working_dir(job);
        let ctx = StepContext {
            job: job.name.clone(),
            branch: trigger.branch.clone(),
            commit: trigger.commit.clone(),
            working_dir: working_dir.clone(),
            env: Self::job_env(job, trigger),
            default_timeout: self.settings.step_timeout,
            cancel: self.cancel.clone(),
        };

        let mut succeeded = true;
        for step in &job.steps {
            self.restore_cache(job, step, &working_dir).await;

            let result = self.steps.run(step, &ctx).await;
            self.record(job, &result);

            let ok = result.succeeded();
            let fatal = result.is_fatal();
            run.steps.push(result);

            if fatal {
                succeeded = false;
                break;
            }
            if ok {
                self.save_cache(job, step, &working_dir).await;
            }
        }

        if let Err(e) = run.finish(succeeded) {
            tracing::error!(error = %e, "Job run could not finish");
        }

        tracing::info!(
            job = %job.name,
            status = %run.status,
            steps_run = run.steps.len(),
            "Job finished"
        );
        run
    }

    fn record(&self, job: &JobConfig, result: &StepResult) {
        match &result.error {
            None => tracing::info!(
                job = %job.name,
                step = %result.step,
                duration_ms = result.duration_ms,
                "Step succeeded"
            ),
            Some(error) if result.best_effort => tracing::warn!(
                job = %job.name,
                step = %result.step,
                error = %error,
                "Best-effort step failed"
            ),
            Some(error) => tracing::warn!(
                job = %job.name,
                step = %result.step,
                error = %error,
                "Step failed"
            ),
        }

        if let Some(ref dir) = self.settings.output_dir {
            if let Err(e) = save_step_output(dir, &job.name, result) {
                tracing::warn!(step = %result.step, error = %e, "Failed to save step output");
            }
        }

        self.emit(RunEvent::StepFinished {
            job: job.name.clone(),
            result: result.clone(),
        });
    }

    async fn restore_cache(&self, job: &JobConfig, step: &StepConfig, working_dir: &Path) {
        let Some(ref key_config) = step.restore_cache else {
            return;
        };
        let root = working_dir.to_path_buf();
        let key_config = key_config.clone();
        let arch = self.settings.arch.clone();
        let key = match blocking(move || fingerprint(&root, &key_config, &arch)).await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(job = %job.name, step = %step.name, error = %e, "Cache fingerprint failed");
                return;
            }
        };

        let Some(entry) = self.cache.get(&key).await else {
            tracing::info!(job = %job.name, step = %step.name, key = %key, "No cache found");
            return;
        };
        let root = working_dir.to_path_buf();
        match blocking(move || restore_blobs(&root, &entry)).await.and_then(|r| r) {
            Ok(files) => {
                tracing::info!(job = %job.name, step = %step.name, key = %key, files, "Restored cache")
            }
            Err(e) => {
                tracing::warn!(job = %job.name, step = %step.name, key = %key, error = %e, "Cache restore failed")
            }
        }
    }

    async fn save_cache(&self, job: &JobConfig, step: &StepConfig, working_dir: &Path) {
        let Some(ref save) = step.save_cache else {
            return;
        };
        let root = working_dir.to_path_buf();
        let key_config = save.key();
        let paths = save.paths.clone();
        let arch = self.settings.arch.clone();
        let collected = blocking(move || {
            let key = fingerprint(&root, &key_config, &arch);
            collect_blobs(&root, &paths).map(|blobs| (key, blobs))
        })
        .await
        .and_then(|r| r);

        match collected {
            Ok((key, blobs)) => {
                self.cache.put(&key, blobs).await;
            }
            Err(e) => {
                tracing::warn!(job = %job.name, step = %step.name, error = %e, "Cache save failed")
            }
        }
    }
}

/// Run filesystem work for the cache off the async workers
async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Task(e.to_string()))
}

/// Save a step's output under `<dir>/<job>/<step>.txt` (`.failed.txt` on failure)
fn save_step_output(dir: &Path, job: &str, result: &StepResult) -> std::io::Result<()> {
    let job_dir = dir.join(sanitize(job));
    std::fs::create_dir_all(&job_dir)?;

    let filename = if result.succeeded() {
        format!("{}.txt", sanitize(&result.step))
    } else {
        format!("{}.failed.txt", sanitize(&result.step))
    };

    let mut contents = result.output.clone();
    if let Some(ref error) = result.error {
        if !contents.is_empty() {
            contents.push('\n');
        }
        contents.push_str(&format!("[{}]", error));
    }

    let path = job_dir.join(filename);
    std::fs::write(&path, contents)?;
    tracing::debug!(job, step = %result.step, path = %path.display(), "Saved step output");
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
