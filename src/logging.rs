use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging based on output mode and debug flag
///
/// `RUST_LOG` overrides the level chosen by the flags. The returned guard
/// must be held until exit so the log file is flushed.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = if debug {
        "jobgraph=debug"
    } else if quiet {
        "jobgraph=error"
    } else {
        "jobgraph=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        // The file always gets the full info-level record
        let file_filter = EnvFilter::new(if debug { "jobgraph=debug" } else { "jobgraph=info" });

        tracing_subscriber::registry()
            .with(fmt_layer.with_filter(env_filter))
            .with(file_layer.with_filter(file_filter))
            .try_init()?;

        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(fmt_layer.with_filter(env_filter))
            .try_init()?;
        Ok(None)
    }
}

/// Default log file path for a pipeline run
pub fn default_log_path(pipeline: &str) -> anyhow::Result<std::path::PathBuf> {
    let log_dir = dirs::data_local_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
        .join("jobgraph")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(log_dir.join(format!("{}-{}.log", pipeline, timestamp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // The global subscriber can be set once per process, so one test covers it
    #[test]
    fn test_file_layer_records_info() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("run.log");

        let guard = init_logging(false, true, Some(&path)).unwrap();
        tracing::info!(job = "test", "Job finished");
        drop(guard);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Job finished"));
        assert!(contents.contains("job=\"test\""));

        // A second subscriber is refused, not silently layered
        assert!(init_logging(false, false, None).is_err());
    }
}
