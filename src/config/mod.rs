//! Configuration types and loading for jobgraph

mod error;
mod loader;
mod pipeline;

pub use error::{ConfigError, StepErrorKind};
pub use loader::{Defaults, JobgraphConfig, default_pipeline_path, load_pipeline};
pub use pipeline::{
    BranchFilter, CacheKeyConfig, CacheSaveConfig, JobConfig, PipelineConfig, StepConfig,
};
