use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use queuectl_core::{JobId, JobSpec, JobState, QueueError};
use queuectl_infra::jobs::{JobStats, JobStore, PoolManager, ShellExecutor, SqliteJobStore};
use queuectl_infra::{PidFile, QueuePaths, StopOutcome};

mod output;
mod shutdown;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A persistent background job queue with retries and a dead letter queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a new job to the queue
    Enqueue {
        /// Job spec as JSON, e.g. '{"id":"job1","command":"echo hi"}'
        spec: String,
    },

    /// Start or stop the worker pool
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show job counts per state and whether workers are running
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List jobs in one state
    List {
        /// pending, processing, completed, failed or dead
        #[arg(long, default_value = "pending")]
        state: String,

        #[arg(long)]
        json: bool,
    },

    /// Inspect and retry dead-lettered jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Read and change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Run workers in the foreground until SIGINT/SIGTERM or `worker stop`
    Start {
        /// Number of concurrent workers
        #[arg(long, short = 'c', default_value_t = 1)]
        count: usize,
    },
    /// Ask the running pool to finish its current jobs and exit
    Stop,
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List all jobs in the dead letter queue
    List {
        #[arg(long)]
        json: bool,
    },
    /// Move a dead job back to pending with a fresh attempt budget
    Retry { job_id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print every configuration value
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Print one configuration value
    Get { key: String },
    /// Change one configuration value
    Set { key: String, value: String },
}

#[derive(Serialize)]
struct StatusReport {
    jobs: JobStats,
    workers: WorkerStatus,
}

#[derive(Serialize)]
struct WorkerStatus {
    running: bool,
    pid: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    queuectl_observability::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let paths = QueuePaths::resolve()?;

    match args.command {
        Commands::Enqueue { spec } => enqueue(&paths, &spec).await,
        Commands::Worker { command } => match command {
            WorkerCommands::Start { count } => start_workers(&paths, count).await,
            WorkerCommands::Stop => stop_workers(&paths),
        },
        Commands::Status { json } => status(&paths, json).await,
        Commands::List { state, json } => {
            let state = JobState::from_str(&state)?;
            list(&paths, state, json).await
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List { json } => list(&paths, JobState::Dead, json).await,
            DlqCommands::Retry { job_id } => dlq_retry(&paths, &job_id).await,
        },
        Commands::Config { command } => configure(&paths, command),
    }
}

async fn open_store(paths: &QueuePaths) -> Result<SqliteJobStore> {
    SqliteJobStore::open(&paths.db_path)
        .await
        .with_context(|| format!("failed to open job store {}", paths.db_path.display()))
}

async fn enqueue(paths: &QueuePaths, raw: &str) -> Result<()> {
    let config = paths.load_config()?;
    let job = JobSpec::from_json(raw)?.into_job(config.max_retries, Utc::now())?;

    let store = open_store(paths).await?;
    store.enqueue(&job).await.context("failed to enqueue job")?;
    store.close().await;

    println!("Enqueued job {}", job.id);
    Ok(())
}

async fn start_workers(paths: &QueuePaths, count: usize) -> Result<()> {
    let config = paths.load_config()?;
    let store = Arc::new(open_store(paths).await?);
    let executor = Arc::new(ShellExecutor::new().with_timeout(config.command_timeout()));
    let manager = PoolManager::new(store.clone(), executor, config);
    let marker = PidFile::new(&paths.pid_path);
    let shutdown = shutdown::install_shutdown_handler()?;

    println!("Starting {count} worker(s); stop with Ctrl-C or `queuectl worker stop`");
    let summary = match manager.run(count, &marker, shutdown.cancelled_owned()).await {
        Ok(summary) => summary,
        Err(QueueError::AlreadyRunning { path, pid }) => {
            let pid = pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
            bail!(
                "workers are already running{pid}; stop them with `queuectl worker stop` \
                 or remove a stale marker at {}",
                path.display()
            );
        }
        Err(e) => return Err(e).context("worker pool failed"),
    };
    store.close().await;

    let stats = &summary.stats;
    println!(
        "Workers stopped: {} processed, {} completed, {} retrying, {} dead",
        stats.jobs_processed, stats.jobs_succeeded, stats.jobs_retried, stats.jobs_dead_lettered
    );
    if summary.killed_in_flight {
        println!("Shutdown grace expired; in-flight commands were killed and recorded as failed");
    }
    if stats.jobs_unrecorded > 0 {
        println!(
            "{} job(s) could not be recorded and remain in processing",
            stats.jobs_unrecorded
        );
    }
    Ok(())
}

fn stop_workers(paths: &QueuePaths) -> Result<()> {
    let marker = PidFile::new(&paths.pid_path);
    match marker.signal_stop()? {
        StopOutcome::Signalled(pid) => {
            println!("Sent stop signal to worker pool (pid {pid}); in-flight jobs will finish first")
        }
        StopOutcome::NotRunning => println!("Workers are not running"),
        StopOutcome::StaleMarkerRemoved(pid) => {
            println!("Workers are not running; removed stale marker for pid {pid}")
        }
    }
    Ok(())
}

async fn status(paths: &QueuePaths, json: bool) -> Result<()> {
    let store = open_store(paths).await?;
    let jobs = store.counts_by_state().await.context("failed to count jobs")?;
    store.close().await;

    let marker = PidFile::new(&paths.pid_path);
    let workers = WorkerStatus {
        running: marker.is_running(),
        pid: marker.read_pid(),
    };

    if json {
        let report = StatusReport { jobs, workers };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print!("{}", output::status_table(&jobs));
    println!();
    match (workers.running, workers.pid) {
        (true, Some(pid)) => println!("Workers are running (pid {pid})"),
        (false, Some(pid)) => println!("Workers are not running (stale marker for pid {pid})"),
        _ => println!("Workers are not running"),
    }
    Ok(())
}

async fn list(paths: &QueuePaths, state: JobState, json: bool) -> Result<()> {
    let store = open_store(paths).await?;
    let jobs = store
        .list_by_state(state)
        .await
        .with_context(|| format!("failed to list {state} jobs"))?;
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else if jobs.is_empty() {
        match state {
            JobState::Dead => println!("Dead letter queue is empty"),
            _ => println!("No jobs in '{state}' state"),
        }
    } else {
        print!("{}", output::jobs_table(&jobs));
    }
    Ok(())
}

async fn dlq_retry(paths: &QueuePaths, raw_id: &str) -> Result<()> {
    let id = JobId::parse(raw_id)?;
    let store = open_store(paths).await?;
    let result = store.retry_dead(&id).await;
    store.close().await;

    let job = result.with_context(|| format!("failed to retry job {id}"))?;
    println!("Job {} moved from the dead letter queue back to pending", job.id);
    Ok(())
}

fn configure(paths: &QueuePaths, command: ConfigCommands) -> Result<()> {
    let mut config = paths.load_config()?;
    match command {
        ConfigCommands::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                for (key, value) in config.entries() {
                    println!("{key} = {value}");
                }
            }
        }
        ConfigCommands::Get { key } => println!("{}", config.get(&key)?),
        ConfigCommands::Set { key, value } => {
            config.set(&key, &value)?;
            paths.save_config(&config)?;
            println!("{key} = {}", config.get(&key)?);
        }
    }
    Ok(())
}
