mod cache;
mod cli;
mod config;
mod logging;
mod process;
mod signals;
mod template;
mod workflow;

use clap::{Parser, Subcommand};
use cli::{OutputMode, Project, RunOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "jobgraph")]
#[command(about = "Run CI job graphs locally - branch-filtered, cached, concurrent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(long, short = 'C', global = true)]
    dir: Option<PathBuf>,

    /// Pipeline file (defaults to .jobgraph/pipeline.toml)
    #[arg(long, short = 'f', global = true)]
    file: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Also write logs to a file (default location when no path is given)
    #[arg(long, global = true, num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,

    /// Output format
    #[arg(long, global = true, value_enum)]
    output: Option<OutputMode>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a branch and commit
    Run {
        /// Branch name (defaults to the current git branch)
        #[arg(long)]
        branch: Option<String>,

        /// Commit id (defaults to the current git commit)
        #[arg(long)]
        commit: Option<String>,

        /// Concurrent jobs (overrides defaults.workers)
        #[arg(long, short = 'j')]
        workers: Option<usize>,

        /// Keep the cache in memory for this run only
        #[arg(long)]
        no_cache_persist: bool,

        /// Log cache failures as warnings
        #[arg(long)]
        verbose_cache: bool,

        /// Directory for step output files
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Show which jobs would run, without running anything
    Plan {
        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        commit: Option<String>,
    },

    /// Validate the pipeline without running
    Validate,

    /// Inspect the persistent cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cache entries
    List,
    /// Remove all cache entries
    Clear,
}

#[tokio::main]
async fn main() {
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            cli::EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let log_file = match cli.log_file {
        Some(Some(path)) => Some(path),
        Some(None) => Some(logging::default_log_path("jobgraph")?),
        None => None,
    };
    let _guard = logging::init_logging(cli.debug, cli.quiet, log_file.as_deref())?;

    let dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let settings = config::JobgraphConfig::load(&dir)?;
    let project = Project::new(dir, cli.file, settings);

    let mode = match (cli.output, cli.quiet) {
        (Some(mode), _) => mode,
        (None, true) => OutputMode::Quiet,
        (None, false) => OutputMode::Console,
    };
    let handler = cli::create_handler(mode, cli.debug);

    match cli.command {
        Commands::Run {
            branch,
            commit,
            workers,
            no_cache_persist,
            verbose_cache,
            output_dir,
        } => {
            let cancel = signals::CancellationToken::new();
            tokio::spawn(signals::setup_signal_handlers(cancel.clone()));

            let options = RunOptions {
                branch,
                commit,
                workers,
                no_cache_persist,
                verbose_cache,
                output_dir,
            };
            cli::run_pipeline(&project, options, cancel, &*handler).await
        }
        Commands::Plan { branch, commit } => {
            Ok(cli::plan_pipeline(&project, branch, commit, &*handler).await)
        }
        Commands::Validate => Ok(cli::validate_pipeline(&project, &*handler)),
        Commands::Cache { command } => match command {
            CacheCommands::List => cli::cache_list(&project, &*handler),
            CacheCommands::Clear => cli::cache_clear(&project, &*handler),
        },
    }
}
