//! CLI command definitions for swarm-dispatch.
//!
//! Each long-running command (`serve`, `worker`) runs until Ctrl-C and then
//! shuts down gracefully; `dispatch` runs a single code unit end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::dispatcher::{
    CodeUnitDispatcher, DispatcherConfig, DispatcherService, DispatcherServiceConfig,
};
use crate::llm::{GenerationService, LiteLlmClient, ProviderGenerationService};
use crate::messages::{AgentType, CodeUnitAssignment};
use crate::metrics::{export_metrics, init_metrics};
use crate::policy::{SpawnGovernor, SwarmPolicy};
use crate::queue::{predefined_configs, MessageQueue, QueueConfigRegistry, RedisStore};
use crate::worker::{instrumented, WorkerPool, WorkerPoolConfig};

/// Extra time a single `dispatch` run gets beyond its monitoring window to
/// publish its notification.
const NOTIFY_GRACE: Duration = Duration::from_secs(30);

/// Swarm dispatcher and function worker runtime.
#[derive(Parser)]
#[command(name = "swarm-dispatch")]
#[command(about = "Fan code units out to function workers over durable priority queues")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Queue store backend.
    #[arg(long, value_enum, default_value = "redis", global = true)]
    pub store: StoreKind,

    /// Print Prometheus metrics when the command finishes.
    #[arg(long, global = true)]
    pub metrics: bool,
}

/// Backing store for the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    /// Shared Redis server from `REDIS_URL`.
    Redis,
    /// In-process store; only useful for single-process `dispatch` runs.
    Memory,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Dispatch one code-unit assignment and wait for its functions.
    Dispatch(DispatchArgs),

    /// Enqueue a code-unit assignment for a running `serve` process.
    Submit(SubmitArgs),

    /// Consume code-unit assignments and dispatch them until Ctrl-C.
    Serve(ServeArgs),

    /// Run function workers until Ctrl-C.
    Worker(WorkerArgs),

    /// Inspect and manage queues.
    Queue(QueueArgs),
}

/// Arguments for `swarm-dispatch dispatch`.
#[derive(Parser, Debug)]
pub struct DispatchArgs {
    /// JSON file holding a CodeUnitAssignment.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Function workers to run in this process while dispatching.
    #[arg(long, default_value = "0")]
    pub local_workers: usize,

    /// Override the monitoring timeout in seconds.
    #[arg(long)]
    pub monitor_timeout_secs: Option<u64>,
}

/// Arguments for `swarm-dispatch submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// JSON file holding a CodeUnitAssignment.
    #[arg(short, long)]
    pub file: PathBuf,
}

/// Arguments for `swarm-dispatch serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Dispatches to run concurrently (default from SWARM_MAX_DISPATCHES).
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Leave `builder.errors` to another consumer.
    #[arg(long)]
    pub no_build_errors: bool,
}

/// Arguments for `swarm-dispatch worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (default from SWARM_WORKERS).
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,
}

/// Arguments for `swarm-dispatch queue`.
#[derive(Parser, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

/// Queue subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum QueueSubcommand {
    /// Persist the predefined queue configurations.
    Init,
    /// Print statistics for one queue, or every predefined queue.
    Stats { name: Option<String> },
    /// Remove all pending messages from a queue.
    Clear { name: String },
    /// Delete a queue with its configuration and statistics.
    Delete { name: String },
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid environment configuration")?;
    if cli.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let queue = build_queue(cli.store, &config).await?;
    let result = match cli.command {
        Commands::Dispatch(args) => run_dispatch_command(args, &config, queue).await,
        Commands::Submit(args) => run_submit_command(args, queue).await,
        Commands::Serve(args) => run_serve_command(args, &config, queue).await,
        Commands::Worker(args) => run_worker_command(args, &config, queue).await,
        Commands::Queue(args) => run_queue_command(args, queue).await,
    };

    if cli.metrics {
        print!("{}", export_metrics());
    }
    result
}

async fn build_queue(store: StoreKind, config: &AppConfig) -> anyhow::Result<Arc<MessageQueue>> {
    let queue = match store {
        StoreKind::Redis => {
            let redis = RedisStore::connect(&config.redis_url)
                .await
                .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
            MessageQueue::new(Arc::new(redis), QueueConfigRegistry::with_predefined())
        }
        StoreKind::Memory => MessageQueue::in_memory(),
    };
    Ok(Arc::new(queue.with_poll_interval(config.poll_interval)))
}

fn load_policy(config: &AppConfig) -> anyhow::Result<Arc<SwarmPolicy>> {
    let policy = config.load_policy().context("Failed to load swarm policy")?;
    Ok(Arc::new(policy))
}

fn build_generator(config: &AppConfig) -> anyhow::Result<Arc<dyn GenerationService>> {
    let api_base = config
        .llm_api_base
        .clone()
        .context("LITELLM_API_BASE must be set to run function workers")?;
    let client = LiteLlmClient::new(api_base, config.llm_api_key.clone(), config.model.clone())?;
    Ok(Arc::new(ProviderGenerationService::new(Arc::new(client))))
}

fn read_assignment(path: &Path) -> anyhow::Result<CodeUnitAssignment> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut assignment: CodeUnitAssignment = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {} as a code-unit assignment", path.display()))?;
    assignment.recount();
    Ok(assignment)
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        token.cancel();
    });
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_dispatch_command(
    args: DispatchArgs,
    config: &AppConfig,
    queue: Arc<MessageQueue>,
) -> anyhow::Result<()> {
    let mut assignment = read_assignment(&args.file)?;
    if assignment.project_id.is_empty() {
        assignment.project_id = config.project_id.clone();
    }

    let policy = load_policy(config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut pool = if args.local_workers > 0 {
        let limits = policy.agent_limits(AgentType::FunctionWorker).clone();
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(args.local_workers),
            Arc::clone(&queue),
            build_generator(config)?,
            limits,
        );
        pool.start()?;
        Some(pool)
    } else {
        None
    };

    let monitor_timeout = args
        .monitor_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(config.monitor_timeout);
    let dispatcher = CodeUnitDispatcher::new("cli-dispatcher", Arc::clone(&queue), SpawnGovernor::new(policy))
        .with_config(DispatcherConfig::default().with_monitor_timeout(monitor_timeout))
        .with_cancellation(cancel.clone());

    let timeout = dispatcher.monitor_window() + NOTIFY_GRACE;
    let outcome = instrumented(&dispatcher, assignment, timeout).await;

    if let Some(pool) = pool.as_mut() {
        if let Err(e) = pool.shutdown().await {
            warn!(error = %e, "Worker pool did not shut down cleanly");
        }
    }

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        anyhow::bail!(
            "Dispatch failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_submit_command(args: SubmitArgs, queue: Arc<MessageQueue>) -> anyhow::Result<()> {
    let assignment = read_assignment(&args.file)?;
    let receipt = queue
        .send_priority(
            crate::queue::names::CODE_UNIT_ASSIGNMENTS,
            &assignment,
            assignment.priority.queue_priority(),
            None,
        )
        .await?;
    info!(
        code_unit_assignment_id = %assignment.assignment_id,
        message_id = %receipt.id,
        truncated = receipt.truncated,
        "Code-unit assignment submitted"
    );
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

async fn run_serve_command(
    args: ServeArgs,
    config: &AppConfig,
    queue: Arc<MessageQueue>,
) -> anyhow::Result<()> {
    let policy = load_policy(config)?;
    let service_config = DispatcherServiceConfig::default()
        .with_max_concurrent(args.max_concurrent.unwrap_or(config.max_concurrent_dispatches))
        .with_dispatcher(DispatcherConfig::default().with_monitor_timeout(config.monitor_timeout));
    let service_config = if args.no_build_errors {
        service_config.with_build_error_queue(None)
    } else {
        service_config
    };
    let service = DispatcherService::new(queue, SpawnGovernor::new(policy), service_config);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let stats = service.run(cancel).await;
    info!(
        received = stats.received,
        succeeded = stats.succeeded,
        failed = stats.failed,
        rejected = stats.rejected,
        build_errors_forwarded = stats.build_errors_forwarded,
        "Dispatcher service stopped"
    );
    Ok(())
}

async fn run_worker_command(
    args: WorkerArgs,
    config: &AppConfig,
    queue: Arc<MessageQueue>,
) -> anyhow::Result<()> {
    let policy = load_policy(config)?;
    let limits = policy.agent_limits(AgentType::FunctionWorker).clone();
    let workers = args.workers.unwrap_or(config.workers).max(1);

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(workers),
        queue,
        build_generator(config)?,
        limits,
    );
    pool.start()?;

    let cancel = pool.cancellation_token();
    cancel_on_ctrl_c(cancel.clone());
    cancel.cancelled().await;

    let stats = pool.stats();
    pool.shutdown().await?;
    info!(
        completed = stats.assignments_completed,
        failed = stats.assignments_failed,
        success_rate = stats.success_rate(),
        "Worker pool stopped"
    );
    Ok(())
}

async fn run_queue_command(args: QueueArgs, queue: Arc<MessageQueue>) -> anyhow::Result<()> {
    match args.command {
        QueueSubcommand::Init => {
            let mut names: Vec<String> = predefined_configs().into_keys().collect();
            names.sort();
            for name in names {
                queue.create_queue(&name, None).await?;
                println!("initialized {}", name);
            }
        }
        QueueSubcommand::Stats { name } => {
            let names = match name {
                Some(name) => vec![name],
                None => queue.known_queues(),
            };
            let mut all = Vec::with_capacity(names.len());
            for name in &names {
                all.push(queue.stats(name).await?);
            }
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        QueueSubcommand::Clear { name } => {
            queue.clear_queue(&name).await?;
            println!("cleared {}", name);
        }
        QueueSubcommand::Delete { name } => {
            queue.delete_queue(&name).await?;
            println!("deleted {}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_dispatch() {
        let cli = Cli::try_parse_from([
            "swarm-dispatch",
            "--store",
            "memory",
            "dispatch",
            "--file",
            "unit.json",
            "--local-workers",
            "2",
        ])
        .expect("should parse");
        assert_eq!(cli.store, StoreKind::Memory);
        assert!(!cli.metrics);
        match cli.command {
            Commands::Dispatch(args) => {
                assert_eq!(args.file, PathBuf::from("unit.json"));
                assert_eq!(args.local_workers, 2);
                assert!(args.monitor_timeout_secs.is_none());
            }
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn test_cli_parses_queue_stats() {
        let cli = Cli::try_parse_from(["swarm-dispatch", "queue", "stats", "swarm.completions", "--metrics"])
            .expect("should parse");
        assert_eq!(cli.store, StoreKind::Redis);
        assert!(cli.metrics);
        match cli.command {
            Commands::Queue(QueueArgs {
                command: QueueSubcommand::Stats { name },
            }) => assert_eq!(name.as_deref(), Some("swarm.completions")),
            _ => panic!("expected queue stats"),
        }
    }

    #[test]
    fn test_read_assignment_recounts() {
        let dir = tempfile::tempdir().expect("tempdir should work");
        let path = dir.path().join("unit.json");
        std::fs::write(
            &path,
            r#"{"codeUnitName":"Calculator","functions":[
                {"functionSpecificationId":"s1","functionName":"Add","codeUnitName":"Calculator"},
                {"functionSpecificationId":"s2","functionName":"Pow","codeUnitName":"Calculator","complexity":8}
            ]}"#,
        )
        .expect("write should work");

        let assignment = read_assignment(&path).expect("should parse");
        assert_eq!(assignment.function_count(), 2);
        assert_eq!(assignment.complex_function_count, 1);
        assert_eq!(assignment.simple_function_count, 1);
    }
}
