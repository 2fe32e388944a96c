use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::info;

use drover_core::agent::{AgentConfig, Runner, WorkerGroup};
use drover_core::domain::Labels;
use drover_core::impls::{
    InMemoryStatusStore, ProcessEngine, ProcessEngineConfig, ProcessEngineProvider,
    SequentialExecutor,
};
use drover_core::observability::{LogConfig, LogFormat, init_logging};
use drover_core::queue::{InMemoryQueue, QueueConfig};
use drover_core::rpc::{Backoff, ClientConfig, RpcClient, ServerConfig, ServerState, serve};

#[derive(Debug, Parser)]
#[command(name = "drover", version, about = "Distributes pipeline tasks to a fleet of agents")]
struct Cli {
    #[arg(long, value_enum, env = "DROVER_LOG_FORMAT", default_value_t = LogFormatArg::Text, global = true)]
    log_format: LogFormatArg,

    /// Log filter directive, e.g. `info` or `drover_core=debug`.
    #[arg(long, env = "DROVER_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the agent loop.
    Agent(AgentArgs),
    /// Start the broker server.
    Server(ServerArgs),
}

#[derive(Debug, Args)]
struct AgentArgs {
    /// Broker WebSocket URL.
    #[arg(long, env = "DROVER_ENDPOINT", default_value = "ws://localhost:8000/ws/broker")]
    endpoint: String,

    /// Label a task must carry, as `key=value`. Repeatable.
    #[arg(
        long = "label",
        env = "DROVER_LABELS",
        value_delimiter = ',',
        value_parser = parse_label,
        default_value = "platform=linux/amd64"
    )]
    labels: Vec<(String, String)>,

    /// Retries per call after a transport failure.
    #[arg(long, env = "DROVER_RETRY_LIMIT", default_value_t = u32::MAX)]
    retry_limit: u32,

    /// Delay between reconnect attempts.
    #[arg(long, env = "DROVER_BACKOFF_SECS", default_value_t = 15)]
    backoff_secs: u64,

    /// Switch to exponential backoff capped at this many seconds.
    #[arg(long, env = "DROVER_BACKOFF_MAX_SECS")]
    backoff_max_secs: Option<u64>,

    #[arg(long, env = "DROVER_MAX_LOG_BYTES", default_value_t = 5_000_000)]
    max_log_bytes: usize,

    #[arg(long, env = "DROVER_MAX_UPLOAD_BYTES", default_value_t = 5_000_000)]
    max_upload_bytes: usize,

    #[arg(long, env = "DROVER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Deadline for tasks without their own timeout.
    #[arg(long, env = "DROVER_DEFAULT_TIMEOUT_MINS", default_value_t = 60)]
    default_timeout_mins: u64,

    #[arg(long, env = "DROVER_HEARTBEAT_SECS", default_value_t = 60)]
    heartbeat_secs: u64,

    /// Do not copy step output to stderr.
    #[arg(long)]
    no_mirror_logs: bool,

    /// Shell used to run step commands.
    #[arg(long, env = "DROVER_SHELL", default_value = "sh")]
    shell: String,

    /// Working directory for step commands.
    #[arg(long, env = "DROVER_WORKDIR")]
    workdir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ServerArgs {
    #[arg(long, env = "DROVER_LISTEN", default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    #[arg(long, env = "DROVER_LEASE_TTL_SECS", default_value_t = 300)]
    lease_ttl_secs: u64,

    /// How long `next` waits for a matching task.
    #[arg(long, env = "DROVER_POLL_TIMEOUT_SECS", default_value_t = 30)]
    poll_timeout_secs: u64,

    #[arg(long, env = "DROVER_REAP_INTERVAL_SECS", default_value_t = 30)]
    reap_interval_secs: u64,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

impl AgentArgs {
    fn client_config(&self) -> ClientConfig {
        let base = Duration::from_secs(self.backoff_secs);
        let backoff = match self.backoff_max_secs {
            Some(max) => Backoff::exponential(base, Duration::from_secs(max)),
            None => Backoff::Fixed(base),
        };
        ClientConfig {
            endpoint: self.endpoint.clone(),
            retry_limit: self.retry_limit,
            backoff,
        }
    }

    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            labels: self.labels.iter().cloned().collect::<Labels>(),
            workers: self.workers,
            max_log_bytes: self.max_log_bytes,
            max_upload_bytes: self.max_upload_bytes,
            default_timeout: Duration::from_secs(self.default_timeout_mins.saturating_mul(60)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            mirror_logs: !self.no_mirror_logs,
        }
    }
}

impl ServerArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            queue: QueueConfig {
                lease_ttl: Duration::from_secs(self.lease_ttl_secs),
                poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            },
            reap_interval: Duration::from_secs(self.reap_interval_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig {
        format: cli.log_format.into(),
        level: cli.log_level.clone(),
        ..LogConfig::default()
    })?;

    match cli.command {
        Command::Agent(args) => run_agent(args).await,
        Command::Server(args) => run_server(args).await,
    }
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let cfg = args.agent_config();
    if cfg.workers == 0 {
        bail!("--workers must be at least 1");
    }
    if cfg.heartbeat_interval.is_zero() {
        bail!("--heartbeat-secs must be at least 1");
    }

    let client = Arc::new(RpcClient::new(args.client_config()));
    let engines = Arc::new(ProcessEngineProvider::new(ProcessEngine::new(
        ProcessEngineConfig {
            shell: args.shell.clone(),
            workdir: args.workdir.clone(),
        },
    )));
    let workers = cfg.workers;
    info!(endpoint = %args.endpoint, workers, labels = ?cfg.labels, "agent starting");

    let runner = Arc::new(Runner::new(
        client.clone(),
        engines,
        Arc::new(SequentialExecutor::default()),
        cfg,
    ));
    let group = WorkerGroup::spawn(workers, runner);

    let stop = group.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing in-flight tasks");
            stop.request();
        }
    });

    group.join().await;
    client.close().await;
    info!("agent stopped");
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let cfg = args.server_config();
    let queue = Arc::new(InMemoryQueue::new(cfg.queue.clone()));
    let store = Arc::new(InMemoryStatusStore::new());

    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;

    serve(
        listener,
        ServerState::new(queue, store),
        cfg.reap_interval,
        async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received; shutting down");
        },
    )
    .await
    .context("serving broker")?;
    Ok(())
}
