//! Job dependency graph

use crate::config::{JobConfig, PipelineConfig};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Errors building the job graph. Fatal: nothing runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate job '{job}'")]
    DuplicateJob { job: String },

    #[error("job '{job}' requires unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("circular dependency among jobs: {}", .jobs.join(", "))]
    Cycle { jobs: Vec<String> },
}

/// Edge to a job that must finish first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub index: usize,
    /// A skipped dependency still lets the dependent run
    pub ignorable: bool,
}

/// Validated, acyclic job graph over job indices
#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: Vec<JobConfig>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<Dependency>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl JobGraph {
    /// Build and validate the graph for a pipeline
    pub fn new(pipeline: &PipelineConfig) -> Result<Self, GraphError> {
        Self::from_jobs(pipeline.jobs.clone())
    }

    pub fn from_jobs(jobs: Vec<JobConfig>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if index.insert(job.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateJob {
                    job: job.name.clone(),
                });
            }
        }

        let mut dependencies = vec![Vec::new(); jobs.len()];
        let mut dependents = vec![Vec::new(); jobs.len()];
        for (i, job) in jobs.iter().enumerate() {
            for (name, ignorable) in job.dependencies() {
                let dep = *index.get(name).ok_or_else(|| GraphError::UnknownDependency {
                    job: job.name.clone(),
                    dependency: name.to_string(),
                })?;
                dependencies[i].push(Dependency {
                    index: dep,
                    ignorable,
                });
                dependents[dep].push(i);
            }
        }

        let order = topological_order(&dependencies, &dependents).map_err(|stuck| {
            GraphError::Cycle {
                jobs: stuck.into_iter().map(|i| jobs[i].name.clone()).collect(),
            }
        })?;

        Ok(Self {
            jobs,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, index: usize) -> &JobConfig {
        &self.jobs[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn dependencies(&self, index: usize) -> &[Dependency] {
        &self.dependencies[index]
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Job indices, every job after all of its dependencies
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

/// Kahn's algorithm; on a cycle returns the jobs that could never be ordered
fn topological_order(
    dependencies: &[Vec<Dependency>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..remaining.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(remaining.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    if order.len() == remaining.len() {
        Ok(order)
    } else {
        Err((0..remaining.len()).filter(|&i| remaining[i] > 0).collect())
    }
}
