//! Pipeline, job and step configuration

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};

/// Which branches a job runs on
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BranchFilter {
    /// Run on every branch
    #[default]
    All,
    /// Run only on the listed branches
    Only(BTreeSet<String>),
    /// Run on every branch except the listed ones
    Ignore(BTreeSet<String>),
}

impl BranchFilter {
    /// Whether a trigger on `branch` admits the job
    pub fn allows(&self, branch: &str) -> bool {
        match self {
            BranchFilter::All => true,
            BranchFilter::Only(branches) => branches.contains(branch),
            BranchFilter::Ignore(branches) => !branches.contains(branch),
        }
    }

    /// Build an `Only` filter from branch names
    pub fn only<I, S>(branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BranchFilter::Only(branches.into_iter().map(Into::into).collect())
    }
}

/// Cache key derived from lock files
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheKeyConfig {
    /// Human-readable key prefix (e.g. "cargo")
    pub prefix: String,

    /// Lock files hashed into the key, relative to the job directory
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// Cache save declaration: a key plus the paths stored under it
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheSaveConfig {
    /// Key prefix, must match the restoring step's prefix to hit
    pub prefix: String,

    /// Lock files hashed into the key
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Files or directories to store
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl CacheSaveConfig {
    /// The key half of this declaration
    pub fn key(&self) -> CacheKeyConfig {
        CacheKeyConfig {
            prefix: self.prefix.clone(),
            files: self.files.clone(),
        }
    }
}

/// Configuration for a job step
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Step name (unique within its job)
    pub name: String,

    /// Shell command to run
    pub run: String,

    /// Record failure but keep the job going
    #[serde(default)]
    pub best_effort: bool,

    /// Timeout in seconds (overrides defaults.step_timeout)
    pub timeout: Option<u64>,

    /// Extra environment for this step
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Restore cached paths before running
    pub restore_cache: Option<CacheKeyConfig>,

    /// Save paths after a successful run
    pub save_cache: Option<CacheSaveConfig>,
}

/// Configuration for a job
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Job name (unique within the pipeline)
    pub name: String,

    /// Jobs that must succeed first
    #[serde(default)]
    pub requires: Vec<String>,

    /// Jobs that must not fail, but may be skipped
    #[serde(default)]
    pub optional_requires: Vec<String>,

    /// Branch filter
    #[serde(default)]
    pub branches: BranchFilter,

    /// A failure of this job does not fail the pipeline
    #[serde(default)]
    pub best_effort: bool,

    /// Job-scoped environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory relative to the pipeline root
    pub working_directory: Option<PathBuf>,

    /// Steps in declared order
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl JobConfig {
    /// All dependency names, required first
    pub fn dependencies(&self) -> impl Iterator<Item = (&str, bool)> {
        self.requires
            .iter()
            .map(|d| (d.as_str(), false))
            .chain(self.optional_requires.iter().map(|d| (d.as_str(), true)))
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Jobs in this pipeline
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

fn default_pipeline_name() -> String {
    "pipeline".into()
}

fn is_relative_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl PipelineConfig {
    /// Look up a job by name
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Validate the pipeline configuration
    ///
    /// Cycles are reported when the job graph is built.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.jobs.is_empty() {
            errors.push("pipeline has no jobs".to_string());
        }

        let mut seen_jobs = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                errors.push("job with empty name".to_string());
            }
            if !seen_jobs.insert(job.name.as_str()) {
                errors.push(format!("duplicate job name: {}", job.name));
            }
        }

        for job in &self.jobs {
            let mut seen_deps = HashSet::new();
            for (dep, _) in job.dependencies() {
                if dep == job.name {
                    errors.push(format!("job '{}' requires itself", job.name));
                } else if !seen_jobs.contains(dep) {
                    errors.push(format!(
                        "job '{}' requires unknown job '{}'",
                        job.name, dep
                    ));
                }
                if !seen_deps.insert(dep) {
                    errors.push(format!(
                        "job '{}' lists dependency '{}' more than once",
                        job.name, dep
                    ));
                }
            }

            if let BranchFilter::Only(branches) = &job.branches {
                if branches.is_empty() {
                    errors.push(format!(
                        "job '{}' has an empty 'only' branch filter",
                        job.name
                    ));
                }
            }

            if let Some(dir) = &job.working_directory {
                if !is_relative_inside(dir) {
                    errors.push(format!(
                        "job '{}' working_directory must stay inside the pipeline root",
                        job.name
                    ));
                }
            }

            if job.steps.is_empty() {
                errors.push(format!("job '{}' has no steps", job.name));
            }

            let mut seen_steps = HashSet::new();
            for step in &job.steps {
                if !seen_steps.insert(step.name.as_str()) {
                    errors.push(format!(
                        "duplicate step name '{}' in job '{}'",
                        step.name, job.name
                    ));
                }
                if step.run.trim().is_empty() {
                    errors.push(format!(
                        "step '{}' in job '{}' has an empty 'run' field",
                        step.name, job.name
                    ));
                }
                if let Some(save) = &step.save_cache {
                    if save.paths.is_empty() {
                        errors.push(format!(
                            "step '{}' in job '{}' saves a cache with no paths",
                            step.name, job.name
                        ));
                    }
                    if save.paths.iter().any(|p| !is_relative_inside(p)) {
                        errors.push(format!(
                            "step '{}' in job '{}' caches a path outside the job directory",
                            step.name, job.name
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_filter_allows() {
        assert!(BranchFilter::All.allows("anything"));

        let only = BranchFilter::only(["develop"]);
        assert!(only.allows("develop"));
        assert!(!only.allows("master"));

        let ignore = BranchFilter::Ignore(["gh-pages".to_string()].into());
        assert!(ignore.allows("master"));
        assert!(!ignore.allows("gh-pages"));
    }

    #[test]
    fn test_step_config_with_cache() {
        let toml = r#"
            name = "deps"
            run = "cargo fetch"

            [restore_cache]
            prefix = "cargo"
            files = ["Cargo.lock"]

            [save_cache]
            prefix = "cargo"
            files = ["Cargo.lock"]
            paths = ["target"]
        "#;
        let step: StepConfig = toml::from_str(toml).unwrap();
        assert_eq!(step.run, "cargo fetch");
        let restore = step.restore_cache.unwrap();
        assert_eq!(restore.files, vec![PathBuf::from("Cargo.lock")]);
        let save = step.save_cache.unwrap();
        assert_eq!(save.key(), restore);
        assert_eq!(save.paths, vec![PathBuf::from("target")]);
    }

    #[test]
    fn test_pipeline_config() {
        let toml = r#"
            name = "ci"

            [[jobs]]
            name = "test"

            [[jobs.steps]]
            name = "build"
            run = "cargo build"

            [[jobs.steps]]
            name = "lint"
            run = "cargo clippy"
            best_effort = true

            [[jobs]]
            name = "deploy-dev"
            requires = ["test"]
            branches = { only = ["develop"] }

            [[jobs.steps]]
            name = "deploy"
            run = "echo deploying {{ commit }}"
        "#;
        let pipeline: PipelineConfig = toml::from_str(toml).unwrap();
        assert_eq!(pipeline.name, "ci");
        assert_eq!(pipeline.jobs.len(), 2);
        assert!(pipeline.jobs[0].steps[1].best_effort);

        let deploy = pipeline.job("deploy-dev").unwrap();
        assert_eq!(deploy.requires, vec!["test"]);
        assert_eq!(deploy.branches, BranchFilter::only(["develop"]));
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_branch_filter_defaults_to_all() {
        let toml = r#"
            name = "x"

            [[steps]]
            name = "s"
            run = "true"
        "#;
        let job: JobConfig = toml::from_str(toml).unwrap();
        assert_eq!(job.branches, BranchFilter::All);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
            name = "s"
            run = "true"
            image = "rust:latest"
        "#;
        assert!(toml::from_str::<StepConfig>(toml).is_err());
    }

    #[test]
    fn test_pipeline_validation() {
        let pipeline = PipelineConfig {
            name: "bad".into(),
            description: String::new(),
            jobs: vec![
                JobConfig {
                    name: "a".into(),
                    requires: vec!["a".into(), "missing".into()],
                    branches: BranchFilter::Only(BTreeSet::new()),
                    steps: vec![
                        StepConfig {
                            name: "s".into(),
                            run: "  ".into(),
                            ..Default::default()
                        },
                        StepConfig {
                            name: "s".into(),
                            run: "true".into(),
                            save_cache: Some(CacheSaveConfig {
                                prefix: "p".into(),
                                files: vec![],
                                paths: vec![PathBuf::from("../escape")],
                            }),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                JobConfig {
                    name: "a".into(),
                    ..Default::default()
                },
            ],
        };

        let errors = pipeline.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate job name")));
        assert!(errors.iter().any(|e| e.contains("requires itself")));
        assert!(errors.iter().any(|e| e.contains("unknown job 'missing'")));
        assert!(errors.iter().any(|e| e.contains("empty 'only'")));
        assert!(errors.iter().any(|e| e.contains("no steps")));
        assert!(errors.iter().any(|e| e.contains("duplicate step name")));
        assert!(errors.iter().any(|e| e.contains("empty 'run'")));
        assert!(errors.iter().any(|e| e.contains("outside the job directory")));
    }
}
