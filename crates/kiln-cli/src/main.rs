mod logging;
mod pipelines;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use kiln_core::domain::{ExecutionMode, Job, JobStatus};
use kiln_core::exec::{process_worker_requested, run_process_worker};
use kiln_core::pipeline::PipelineRegistry;
use kiln_core::store::{SqliteStateStore, StateStore};
use kiln_core::{Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "kiln", version, about = "Concurrent job execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to the state database
    #[arg(long, default_value = "kiln_state.db", global = true)]
    state_path: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist a new job; a running daemon picks it up at startup
    Submit {
        #[arg(long)]
        job_id: String,

        /// Higher runs earlier
        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// thread, process, or async
        #[arg(long, default_value = "thread")]
        mode: String,

        /// JSON object with at least a "type" field
        #[arg(long)]
        payload: String,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Show a stored job record
    Status { job_id: String },
    /// Show a stored result record
    Result { job_id: String },
    /// List stored jobs, most recently updated first
    List,
    /// Cancel a stored job that has not started running
    Cancel { job_id: String },
    /// Run the engine until interrupted
    Daemon {
        #[arg(long, default_value_t = 100)]
        poll_interval_ms: u64,

        #[arg(long, default_value_t = 4)]
        thread_workers: usize,

        #[arg(long, default_value_t = 2)]
        process_workers: usize,

        /// Per-attempt execution budget in milliseconds
        #[arg(long)]
        job_timeout_ms: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    // Worker children re-run this binary with the marker env var set; they
    // speak the line protocol on stdin/stdout and never parse arguments.
    if process_worker_requested() {
        let registry = Arc::new(PipelineRegistry::new());
        pipelines::register_builtin(&registry)?;
        run_process_worker(&registry)?;
        return Ok(());
    }
    run_cli()
}

#[tokio::main]
async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Commands::Submit {
            job_id,
            priority,
            mode,
            payload,
            max_retries,
        } => {
            let store = open_store(&cli.state_path)?;
            let mode: ExecutionMode = mode.parse()?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;

            if store.load_job(&job_id)?.is_some() {
                bail!("duplicate job_id={job_id}");
            }
            let mut job = Job::new(job_id.as_str(), priority, mode, payload, max_retries)?;
            job.transition_to(JobStatus::Pending)?;
            store.save_job(&job)?;
            println!("submitted {job_id} (PENDING)");
        }
        Commands::Status { job_id } => {
            let store = open_store(&cli.state_path)?;
            match store.load_job(&job_id)? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => bail!("job not found: {job_id}"),
            }
        }
        Commands::Result { job_id } => {
            let store = open_store(&cli.state_path)?;
            match store.load_result(&job_id)? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => bail!("no result for job: {job_id}"),
            }
        }
        Commands::List => {
            let store = open_store(&cli.state_path)?;
            for job in store.list_jobs()? {
                println!(
                    "{:<24} {:<10} priority={:<4} attempts={}/{} mode={}",
                    job.job_id,
                    job.status.to_string(),
                    job.priority,
                    job.attempts,
                    job.max_retries,
                    job.execution_mode,
                );
            }
        }
        Commands::Cancel { job_id } => {
            let store = open_store(&cli.state_path)?;
            let mut job = store
                .load_job(&job_id)?
                .with_context(|| format!("job not found: {job_id}"))?;
            if job.status != JobStatus::Pending {
                bail!("job {job_id} is {}; only PENDING jobs can be cancelled here", job.status);
            }
            job.transition_to(JobStatus::Cancelled)?;
            store.save_job(&job)?;
            println!("cancelled {job_id}");
        }
        Commands::Daemon {
            poll_interval_ms,
            thread_workers,
            process_workers,
            job_timeout_ms,
        } => {
            let config = EngineConfig {
                poll_interval_ms,
                thread_workers,
                thread_queue_capacity: thread_workers,
                process_workers,
                process_queue_capacity: process_workers,
                job_timeout_ms,
                ..EngineConfig::default()
            };
            daemon(&cli.state_path, config).await?;
        }
    }
    Ok(())
}

async fn daemon(state_path: &std::path::Path, config: EngineConfig) -> anyhow::Result<()> {
    let registry = Arc::new(PipelineRegistry::new());
    pipelines::register_builtin(&registry)?;

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(state_path)?);
    let engine = Engine::new(config, registry, store)?;

    // Environment's choice: jobs left PENDING by earlier runs get re-queued.
    engine.resume_pending()?;

    let loop_engine = engine.clone();
    let loop_task = tokio::task::spawn_blocking(move || loop_engine.run_loop());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    tracing::info!("interrupt received; shutting down");
    engine.initiate_shutdown();

    loop_task.await.context("engine loop panicked")?;
    Ok(())
}

fn open_store(path: &std::path::Path) -> anyhow::Result<SqliteStateStore> {
    SqliteStateStore::open(path).with_context(|| format!("cannot open state db at {path:?}"))
}
