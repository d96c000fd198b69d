//! CLI command definitions for plugin-runner.
//!
//! `run` starts the consumer for one queue; the remaining commands are
//! operator tools against the same configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::lock::{default_holder_id, RedisLock};
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::plugins::PluginRegistry;
use crate::pool::{ProcessUnitFactory, WorkerPool};
use crate::shutdown::install_shutdown_handler;
use crate::store::{JobStore, NewJob, PostgresJobStore};
use crate::transform::CodeTransformer;

/// Connections kept by operator commands; `run` sizes its pool from capacity.
const ADMIN_DB_CONNECTIONS: u32 = 2;

/// Sandboxed plugin job runner.
#[derive(Parser)]
#[command(name = "plugin-runner")]
#[command(about = "Run untrusted plugins against a durable job queue under a time budget")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; environment variables override it.
    #[arg(short, long, global = true, env = "PLUGIN_RUNNER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume the configured queue until SIGTERM/SIGINT or lock loss.
    Run(RunArgs),

    /// Enqueue a job.
    Enqueue(EnqueueArgs),

    /// Print the instrumented form of a plugin.
    Transform(TransformArgs),

    /// Apply pending database migrations.
    Migrate,

    /// List permanently failed jobs, newest first.
    Failed(FailedArgs),

    /// Print per-status job counts for the queue.
    Stats,
}

/// Arguments for `plugin-runner run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Write Prometheus text-format metrics to this file while running.
    #[arg(long, env = "PLUGIN_RUNNER_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Seconds between metrics file rewrites.
    #[arg(long, default_value = "15")]
    pub metrics_interval_secs: u64,
}

/// Arguments for `plugin-runner enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task kind selecting the plugin.
    #[arg(short, long)]
    pub task_kind: String,

    /// JSON payload handed to the plugin.
    #[arg(short, long, default_value = "null")]
    pub payload: String,

    /// Delay before the job becomes due.
    #[arg(long, default_value = "0")]
    pub delay_ms: u64,

    /// Attempt ceiling; defaults to the configured `max_attempts`.
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

/// Arguments for `plugin-runner transform`.
#[derive(Parser, Debug)]
pub struct TransformArgs {
    /// Plugin source file.
    pub file: PathBuf,

    /// Execution budget embedded in the prelude.
    #[arg(short, long, default_value = "5000")]
    pub budget_ms: u64,

    /// Print only the instrumented source, without the prelude.
    #[arg(long)]
    pub body_only: bool,
}

/// Arguments for `plugin-runner failed`.
#[derive(Parser, Debug)]
pub struct FailedArgs {
    /// Maximum number of jobs to list.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => run_consumer(load_config(config_path)?, args).await,
        Commands::Enqueue(args) => run_enqueue_command(load_config(config_path)?, args).await,
        Commands::Transform(args) => run_transform_command(args),
        Commands::Migrate => run_migrate_command(load_config(config_path)?).await,
        Commands::Failed(args) => run_failed_command(load_config(config_path)?, args).await,
        Commands::Stats => run_stats_command(load_config(config_path)?).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RunnerConfig> {
    RunnerConfig::load(path).context("failed to load configuration")
}

async fn connect_store(config: &RunnerConfig, connections: u32) -> anyhow::Result<PostgresJobStore> {
    PostgresJobStore::connect(&config.database_url, connections)
        .await
        .context("failed to connect to the job store")
}

async fn run_consumer(config: RunnerConfig, args: RunArgs) -> anyhow::Result<()> {
    metrics::init_metrics().context("failed to initialize metrics")?;
    let metrics_stop = CancellationToken::new();
    let metrics_writer = args.metrics_file.map(|path| {
        info!(path = %path.display(), "Writing metrics file");
        let interval = Duration::from_secs(args.metrics_interval_secs.max(1));
        metrics::spawn_metrics_writer(path, interval, metrics_stop.clone())
    });

    let plugins = Arc::new(PluginRegistry::from_config(&config)?);
    if plugins.is_empty() {
        warn!("No plugins configured; every claimed job will fail");
    }

    let connections = u32::try_from(config.pool.capacity)
        .unwrap_or(u32::MAX)
        .saturating_add(2);
    let store = connect_store(&config, connections).await?;
    let applied = store.run_migrations().await?;
    if applied > 0 {
        info!(applied, "Applied migrations");
    }

    let holder_id = config.node_id.clone().unwrap_or_else(default_holder_id);
    let lock = RedisLock::connect(&config.redis_url, holder_id)
        .await
        .context("failed to connect to the lock store")?;

    let factory = Arc::new(ProcessUnitFactory::new(config.runtime.clone()));
    let pool = Arc::new(WorkerPool::new(config.pool_config(), factory)?);

    let signals = install_shutdown_handler().context("failed to install signal handlers")?;
    let force = signals.force.clone();
    let abort_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        force.cancelled().await;
        abort_pool.abort_in_flight();
    });

    info!(
        queue = %config.queue,
        capacity = config.pool.capacity,
        plugins = ?plugins.task_kinds(),
        runtime = %config.runtime.program,
        "Starting consumer"
    );

    let orchestrator = Orchestrator::new(
        config.orchestrator_config(),
        Arc::new(store),
        Arc::new(lock),
        Arc::clone(&pool),
        plugins,
    );
    let report = orchestrator.run(signals.graceful.clone()).await?;

    if !pool.shutdown(config.kill_grace()).await {
        warn!("Worker pool did not stop within the kill grace");
    }

    let stats = pool.stats();
    info!(
        reason = %report.reason,
        dispatched = report.dispatched,
        succeeded = report.succeeded,
        retried = report.retried,
        failed = report.failed,
        abandoned = report.abandoned,
        timed_out = stats.timed_out,
        crashed = stats.crashed,
        recycled = stats.recycled,
        "Consumer finished"
    );

    metrics_stop.cancel();
    if let Some(writer) = metrics_writer {
        if let Err(e) = writer.await {
            warn!(error = %e, "Metrics writer task failed");
        }
    }
    Ok(())
}

async fn run_enqueue_command(config: RunnerConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    if !crate::config::is_valid_task_kind(&args.task_kind)? {
        anyhow::bail!("invalid task kind '{}'", args.task_kind);
    }
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let mut job = NewJob::new(&args.task_kind, payload)
        .with_queue(&config.queue)
        .with_max_attempts(args.max_attempts.unwrap_or(config.max_attempts));
    if args.delay_ms > 0 {
        job = job.with_delay(Duration::from_millis(args.delay_ms));
    }

    let store = connect_store(&config, ADMIN_DB_CONNECTIONS).await?;
    let id = store.enqueue(job).await?;
    println!("{id}");
    Ok(())
}

fn run_transform_command(args: TransformArgs) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let transformer = CodeTransformer::new(Duration::from_millis(args.budget_ms));
    let output = if args.body_only {
        transformer.instrument(&source)
    } else {
        transformer.transform(&source)
    }
    .with_context(|| format!("failed to instrument {}", args.file.display()))?;
    print!("{output}");
    Ok(())
}

async fn run_migrate_command(config: RunnerConfig) -> anyhow::Result<()> {
    let store = connect_store(&config, ADMIN_DB_CONNECTIONS).await?;
    let applied = store.run_migrations().await?;
    println!("Applied {applied} migration(s)");
    Ok(())
}

async fn run_failed_command(config: RunnerConfig, args: FailedArgs) -> anyhow::Result<()> {
    let store = connect_store(&config, ADMIN_DB_CONNECTIONS).await?;
    let jobs = store.failed_jobs(&config.queue, args.limit).await?;
    for job in &jobs {
        println!("{}", serde_json::to_string(job)?);
    }
    if jobs.is_empty() {
        eprintln!("No failed jobs in queue '{}'", config.queue);
    }
    Ok(())
}

async fn run_stats_command(config: RunnerConfig) -> anyhow::Result<()> {
    let store = connect_store(&config, ADMIN_DB_CONNECTIONS).await?;
    let stats = store.stats(&config.queue).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
