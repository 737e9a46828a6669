//! Configuration loading with multi-layer merge

use super::{ConfigError, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level jobgraph settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobgraphConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,
}

/// Global default settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Worker pool size (concurrent jobs)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default step timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,

    /// Cache directory (supports ~ expansion)
    pub cache_dir: Option<String>,

    /// Architecture tag mixed into cache fingerprints
    pub arch: Option<String>,

    /// Log cache failures as warnings instead of debug
    #[serde(default)]
    pub verbose_cache: bool,
}

fn default_workers() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    600
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            step_timeout: default_step_timeout(),
            cache_dir: None,
            arch: None,
            verbose_cache: false,
        }
    }
}

impl Defaults {
    /// Step timeout as a duration
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout)
    }

    /// Architecture tag, falling back to the host architecture
    pub fn arch(&self) -> String {
        self.arch
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string())
    }

    /// Resolve the cache directory for a project
    pub fn cache_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => {
                let expanded = PathBuf::from(shellexpand::tilde(dir).into_owned());
                if expanded.is_absolute() {
                    expanded
                } else {
                    project_dir.join(expanded)
                }
            }
            None => project_dir.join(".jobgraph").join("cache"),
        }
    }
}

/// One config file as written: only the keys it sets
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(default)]
    pub defaults: DefaultsLayer,
}

/// `[defaults]` keys of a single config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsLayer {
    pub workers: Option<usize>,
    pub step_timeout: Option<u64>,
    pub cache_dir: Option<String>,
    pub arch: Option<String>,
    pub verbose_cache: Option<bool>,
}

impl JobgraphConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/jobgraph/config.toml
    /// 3. .jobgraph/config.toml (project)
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                config.merge(Self::load_file(&user_config_path)?);
            }
        }

        let project_config_path = project_dir.join(".jobgraph/config.toml");
        if project_config_path.exists() {
            config.merge(Self::load_file(&project_config_path)?);
        }

        Ok(config)
    }

    /// Load the keys one config file sets
    pub fn load_file(path: &Path) -> Result<ConfigLayer, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Get the user config path (~/.config/jobgraph/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("jobgraph/config.toml"))
    }

    /// Apply a layer on top of this config; every key the layer sets wins
    pub fn merge(&mut self, layer: ConfigLayer) {
        let layer = layer.defaults;
        if let Some(workers) = layer.workers {
            self.defaults.workers = workers;
        }
        if let Some(step_timeout) = layer.step_timeout {
            self.defaults.step_timeout = step_timeout;
        }
        if layer.cache_dir.is_some() {
            self.defaults.cache_dir = layer.cache_dir;
        }
        if layer.arch.is_some() {
            self.defaults.arch = layer.arch;
        }
        if let Some(verbose_cache) = layer.verbose_cache {
            self.defaults.verbose_cache = verbose_cache;
        }
    }
}

/// Default pipeline file for a project
pub fn default_pipeline_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".jobgraph/pipeline.toml")
}

/// Load and validate a pipeline file
pub fn load_pipeline(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let pipeline: PipelineConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    pipeline
        .validate()
        .map_err(|errors| ConfigError::InvalidPipeline { errors })?;

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = JobgraphConfig::default();
        assert_eq!(config.defaults.workers, 4);
        assert_eq!(config.defaults.step_timeout(), Duration::from_secs(600));
        assert_eq!(config.defaults.arch(), std::env::consts::ARCH);
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [defaults]
            workers = 2
            step_timeout = 60
            arch = "arm64"
        "#
        )
        .unwrap();

        let layer = JobgraphConfig::load_file(&config_path).unwrap();
        assert_eq!(layer.defaults.workers, Some(2));
        assert_eq!(layer.defaults.step_timeout, Some(60));
        assert_eq!(layer.defaults.cache_dir, None);

        let mut config = JobgraphConfig::default();
        config.merge(layer);
        assert_eq!(config.defaults.arch(), "arm64");
    }

    #[test]
    fn test_config_merge() {
        let mut base = JobgraphConfig::default();
        base.defaults.cache_dir = Some("/var/cache/jobgraph".into());

        base.merge(ConfigLayer {
            defaults: DefaultsLayer {
                workers: Some(8),
                verbose_cache: Some(true),
                ..Default::default()
            },
        });

        assert_eq!(base.defaults.workers, 8);
        assert!(base.defaults.verbose_cache);
        // Untouched by the override
        assert_eq!(base.defaults.cache_dir.as_deref(), Some("/var/cache/jobgraph"));
        assert_eq!(base.defaults.step_timeout, 600);
    }

    #[test]
    fn test_project_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".jobgraph")).unwrap();
        std::fs::write(
            dir.path().join(".jobgraph/config.toml"),
            "[defaults]\nstep_timeout = 5\n",
        )
        .unwrap();

        let config = JobgraphConfig::load(dir.path()).unwrap();
        assert_eq!(config.defaults.step_timeout, 5);
    }

    #[test]
    fn test_later_layer_can_restore_default_values() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(&user, "[defaults]\nworkers = 8\nverbose_cache = true\n").unwrap();
        std::fs::write(&project, "[defaults]\nworkers = 4\nverbose_cache = false\n").unwrap();

        let mut config = JobgraphConfig::default();
        config.merge(JobgraphConfig::load_file(&user).unwrap());
        config.merge(JobgraphConfig::load_file(&project).unwrap());

        assert_eq!(config.defaults.workers, 4);
        assert!(!config.defaults.verbose_cache);
    }

    #[test]
    fn test_unknown_config_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[defaults]\nworker = 2\n").unwrap();
        assert!(matches!(
            JobgraphConfig::load_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_cache_dir_resolution() {
        let project = Path::new("/work/project");
        let mut defaults = Defaults::default();
        assert_eq!(
            defaults.cache_dir(project),
            PathBuf::from("/work/project/.jobgraph/cache")
        );

        defaults.cache_dir = Some("cache".into());
        assert_eq!(defaults.cache_dir(project), PathBuf::from("/work/project/cache"));

        defaults.cache_dir = Some("/tmp/jg".into());
        assert_eq!(defaults.cache_dir(project), PathBuf::from("/tmp/jg"));
    }

    #[test]
    fn test_load_pipeline_missing() {
        let dir = TempDir::new().unwrap();
        let err = load_pipeline(&default_pipeline_path(dir.path())).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_pipeline_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
            [[jobs]]
            name = "deploy"
            requires = ["test"]

            [[jobs.steps]]
            name = "push"
            run = "echo push"
        "#,
        )
        .unwrap();

        let err = load_pipeline(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPipeline { .. }));
        assert!(err.to_string().contains("unknown job 'test'"));
    }

    #[test]
    fn test_load_pipeline_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[[jobs]\nname = ").unwrap();

        let err = load_pipeline(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
