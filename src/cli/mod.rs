pub mod jobs;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::clock::{Clock, SystemClock};
use crate::models::config::{load_config, resolve_data_dir};
use crate::models::{JobStatus, TrackerConfig};
use crate::storage::{FsBlobStore, JobStore};
use crate::tracker::{HttpStatusClient, JobTracker};

/// jobwatch - track indexing jobs submitted to a remote worker
#[derive(Parser, Debug)]
#[command(
    name = "jobwatch",
    version,
    about = "jobwatch - track indexing jobs submitted to a remote worker"
)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory path (overrides config)
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record a job that was submitted to the worker
    Add {
        /// Content identifier of the submitted file
        job_id: String,

        /// Address of the worker the job was sent to
        #[arg(short = 'w', long)]
        worker: Option<String>,

        /// Original file name
        #[arg(long = "file-name")]
        file_name: Option<String>,

        /// File size in bytes
        #[arg(long = "file-size")]
        file_size: Option<u64>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// List tracked jobs
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Show only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Show a single job
    Show {
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop tracking a job
    Remove {
        job_id: String,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Put a reassignable job back to pending
    Resubmit {
        job_id: String,

        /// Worker address to submit to instead
        #[arg(short = 'w', long)]
        worker: Option<String>,
    },

    /// Poll the worker for pending jobs until interrupted
    Watch {
        /// Poll interval in milliseconds (overrides config)
        #[arg(long = "interval-ms", value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: Option<u64>,

        /// Worker base URL (overrides config)
        #[arg(long = "worker-url")]
        worker_url: Option<String>,
    },
}

/// Build a tracker over the on-disk job table.
pub async fn open_tracker(cli: &Cli, config: &TrackerConfig) -> anyhow::Result<JobTracker> {
    let data_dir = resolve_data_dir(cli.data_dir.as_deref(), config);
    tracing::debug!("Using data directory {}", data_dir.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let blobs = Arc::new(FsBlobStore::new(data_dir).await?);
    let store = Arc::new(JobStore::open(blobs, clock.clone(), config.event_capacity).await?);
    let client = HttpStatusClient::new(&config.worker_url, config.request_timeout())?;

    Ok(JobTracker::new(
        store,
        Arc::new(client),
        clock,
        config.poll_interval(),
        config.event_capacity,
    )
    .with_deadline(config.deadline()))
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let mut config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    if let Commands::Watch {
        interval_ms,
        worker_url,
    } = command
    {
        if let Some(ms) = interval_ms {
            config.poll_interval_ms = *ms;
        }
        if let Some(url) = worker_url {
            config.worker_url = url.clone();
        }
    }
    config.validate()?;
    let tracker = open_tracker(cli, &config).await?;

    match command {
        Commands::Add {
            job_id,
            worker,
            file_name,
            file_size,
            title,
            description,
        } => {
            jobs::cmd_add(
                &tracker,
                jobs::AddArgs {
                    job_id,
                    worker: worker.as_deref(),
                    file_name: file_name.as_deref(),
                    file_size: *file_size,
                    title: title.as_deref(),
                    description: description.as_deref(),
                },
            )
            .await
        }
        Commands::List { json, status } => jobs::cmd_list(&tracker, *json, *status).await,
        Commands::Show { job_id, json } => jobs::cmd_show(&tracker, job_id, *json).await,
        Commands::Remove { job_id, yes } => jobs::cmd_remove(&tracker, job_id, *yes).await,
        Commands::Resubmit { job_id, worker } => {
            jobs::cmd_resubmit(&tracker, job_id, worker.clone()).await
        }
        Commands::Watch { .. } => watch::cmd_watch(Arc::new(tracker), &config).await,
    }
}
