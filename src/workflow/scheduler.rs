//! Workflow scheduler - plans and runs the job graph

use super::events::{JobLog, RunEvent};
use super::executor::JobExecutor;
use super::graph::JobGraph;
use super::state::{JobRun, JobStatus, PipelineResult, SkipReason, Trigger};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;

/// Jobs for one trigger, each with its starting state
#[derive(Debug, Clone)]
pub struct Plan {
    pub trigger: Trigger,
    /// Runs indexed by job index in the graph
    pub runs: Vec<JobRun>,
    /// Topological order of job indices
    pub order: Vec<usize>,
}

impl Plan {
    /// Runs in topological order
    pub fn ordered(&self) -> impl Iterator<Item = &JobRun> {
        self.order.iter().map(|&i| &self.runs[i])
    }

    /// Names of jobs that will be attempted
    pub fn admitted(&self) -> Vec<&str> {
        self.ordered()
            .filter(|r| r.status == JobStatus::Pending)
            .map(|r| r.job.as_str())
            .collect()
    }

    /// Whether this plan was made for `graph`: one run per job, by index,
    /// in the graph's order
    pub fn matches(&self, graph: &JobGraph) -> bool {
        self.runs.len() == graph.len()
            && self.order == graph.order()
            && self
                .runs
                .iter()
                .enumerate()
                .all(|(i, run)| run.job == graph.job(i).name)
    }
}

/// Decide the starting state of every job for `trigger`
///
/// Branch filters are evaluated once here. Jobs excluded by their filter
/// start Skipped, and so does every job that (transitively) needs one of them
/// through a non-ignorable dependency.
pub fn plan(graph: &JobGraph, trigger: &Trigger) -> Plan {
    let mut runs: Vec<JobRun> = (0..graph.len())
        .map(|i| {
            let job = graph.job(i);
            JobRun::new(&job.name).with_best_effort(job.best_effort)
        })
        .collect();

    for &i in graph.order() {
        let job = graph.job(i);
        let reason = if !job.branches.allows(&trigger.branch) {
            Some(SkipReason::BranchFilter {
                branch: trigger.branch.clone(),
            })
        } else {
            blocking_dependency(graph, &runs, i)
        };

        if let Some(reason) = reason {
            if let Err(e) = runs[i].skip(reason) {
                tracing::error!(error = %e, "Planned job could not be skipped");
            }
        }
    }

    Plan {
        trigger: trigger.clone(),
        runs,
        order: graph.order().to_vec(),
    }
}

/// The first terminal dependency that keeps job `index` from running
fn blocking_dependency(graph: &JobGraph, runs: &[JobRun], index: usize) -> Option<SkipReason> {
    graph.dependencies(index).iter().find_map(|dep| {
        let run = &runs[dep.index];
        let blocks = match run.status {
            JobStatus::Failed => true,
            JobStatus::Skipped => !dep.ignorable,
            _ => false,
        };
        blocks.then(|| SkipReason::Dependency {
            job: run.job.clone(),
            status: run.status,
        })
    })
}

/// Runs planned jobs on a bounded worker pool
pub struct Scheduler {
    executor: Arc<JobExecutor>,
    workers: usize,
}

impl Scheduler {
    pub fn new(executor: JobExecutor, workers: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            workers: workers.max(1),
        }
    }

    /// All run events from this scheduler
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.executor.events().subscribe()
    }

    /// Step results for one job, ending when it finishes
    pub fn subscribe_job(&self, job: &str) -> JobLog {
        JobLog::for_job(job, self.subscribe())
    }

    fn emit_finished(&self, run: &JobRun) {
        let _ = self.executor.events().send(RunEvent::JobFinished {
            job: run.job.clone(),
            status: run.status,
            skip_reason: run.skip_reason.clone(),
            duration_ms: run.duration().map(|d| d.as_millis() as u64),
        });
    }

    fn skip(&self, run: &mut JobRun, reason: SkipReason) {
        tracing::info!(job = %run.job, reason = %reason, "Job skipped");
        if let Err(e) = run.skip(reason) {
            tracing::error!(error = %e, "Job could not be skipped");
        }
        self.emit_finished(run);
    }

    /// Plan and run `graph` for `trigger`
    pub async fn execute(&self, graph: Arc<JobGraph>, trigger: &Trigger) -> PipelineResult {
        let plan = plan(&graph, trigger);
        self.run(graph, plan).await
    }

    /// Run a plan to completion
    ///
    /// A job is admitted only after every dependency is terminal; admission
    /// is driven by task completions, never by polling. A plan made for a
    /// different graph is discarded and the graph is planned again.
    pub async fn run(&self, graph: Arc<JobGraph>, plan: Plan) -> PipelineResult {
        let start = Instant::now();
        let plan = if plan.matches(&graph) {
            plan
        } else {
            tracing::warn!(
                planned = plan.runs.len(),
                jobs = graph.len(),
                "Plan does not match the job graph, replanning"
            );
            self::plan(&graph, &plan.trigger)
        };
        let Plan {
            trigger,
            mut runs,
            order,
        } = plan;
        let trigger = Arc::new(trigger);
        let cancel = self.executor.cancellation().clone();
        let pool = Arc::new(Semaphore::new(self.workers));

        tracing::info!(
            branch = %trigger.branch,
            commit = %trigger.commit,
            jobs = runs.len(),
            workers = self.workers,
            "Pipeline started"
        );

        let mut remaining: Vec<usize> = (0..runs.len())
            .map(|i| graph.dependencies(i).len())
            .collect();
        let mut settled: VecDeque<usize> = VecDeque::new();
        let mut ready: VecDeque<usize> = VecDeque::new();

        for &i in &order {
            if runs[i].status.is_terminal() {
                self.emit_finished(&runs[i]);
                settled.push_back(i);
            } else if remaining[i] == 0 {
                ready.push_back(i);
            }
        }

        let mut tasks: JoinSet<(usize, JobRun)> = JoinSet::new();
        let mut task_jobs: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            while let Some(i) = settled.pop_front() {
                for &d in graph.dependents(i) {
                    remaining[d] -= 1;
                    if remaining[d] == 0 {
                        ready.push_back(d);
                    }
                }
            }

            if let Some(i) = ready.pop_front() {
                if runs[i].status.is_terminal() {
                    // Skipped at plan time, already settled
                    continue;
                }

                let reason = if cancel.is_cancelled() {
                    Some(SkipReason::Cancelled)
                } else {
                    blocking_dependency(&graph, &runs, i)
                };
                if let Some(reason) = reason {
                    self.skip(&mut runs[i], reason);
                    settled.push_back(i);
                    continue;
                }

                let executor = self.executor.clone();
                let graph = graph.clone();
                let trigger = trigger.clone();
                let pool = pool.clone();
                let cancel = cancel.clone();
                let handle = tasks.spawn(async move {
                    let job = graph.job(i);
                    let Ok(_permit) = pool.acquire_owned().await else {
                        let mut run = JobRun::new(&job.name).with_best_effort(job.best_effort);
                        let _ = run.skip(SkipReason::Cancelled);
                        return (i, run);
                    };
                    if cancel.is_cancelled() {
                        let mut run = JobRun::new(&job.name).with_best_effort(job.best_effort);
                        let _ = run.skip(SkipReason::Cancelled);
                        return (i, run);
                    }
                    (i, executor.execute(job, &trigger).await)
                });
                task_jobs.insert(handle.id(), i);
                continue;
            }

            if tasks.is_empty() {
                break;
            }

            match tasks.join_next_with_id().await {
                Some(Ok((id, (i, run)))) => {
                    task_jobs.remove(&id);
                    if run.status == JobStatus::Skipped {
                        tracing::info!(job = %run.job, "Job skipped before start");
                    }
                    runs[i] = run;
                    self.emit_finished(&runs[i]);
                    settled.push_back(i);
                }
                Some(Err(e)) => {
                    let Some(i) = task_jobs.remove(&e.id()) else {
                        tracing::error!(error = %e, "Unknown job task failed");
                        continue;
                    };
                    tracing::error!(job = %runs[i].job, error = %e, "Job task panicked");
                    let mut run = JobRun::new(&runs[i].job).with_best_effort(runs[i].best_effort);
                    let _ = run.start();
                    let _ = run.finish(false);
                    runs[i] = run;
                    self.emit_finished(&runs[i]);
                    settled.push_back(i);
                }
                None => break,
            }
        }

        let ordered: Vec<JobRun> = order.iter().map(|&i| runs[i].clone()).collect();
        let result = PipelineResult {
            trigger: (*trigger).clone(),
            runs: ordered,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        tracing::info!(
            success = result.success(),
            succeeded = result.count(JobStatus::Succeeded),
            failed = result.count(JobStatus::Failed),
            skipped = result.count(JobStatus::Skipped),
            duration_ms = result.duration_ms,
            "Pipeline finished"
        );

        result
    }
}
