//! deployd - Entry Point
//!
//! One binary, two roles: the unprivileged orchestrator that queues and
//! dispatches deployments, and the execution agent that builds and
//! publishes releases.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing::{error, info};

use deployd::agent::AgentOptions;
use deployd::app::options::{AppOptions, LifecycleOptions, ServerOptions};
use deployd::app::run::{run, run_agent};
use deployd::logs::{init_logging, LogLevel, LogOptions};
use deployd::utils::version_info;
use deployd::workers::{dispatcher, prober};

#[derive(Debug, Parser)]
#[command(name = "deployd")]
#[command(about = "Self-hosted deployment orchestrator and execution agent")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// trace, debug, info, warn or error
    #[arg(long, env = "DEPLOYD_LOG_LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[arg(long, env = "DEPLOYD_LOG_JSON", global = true)]
    log_json: bool,

    /// Also write daily-rolling log files here
    #[arg(long, env = "DEPLOYD_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue, dispatch and observe deployments
    Orchestrator(OrchestratorArgs),

    /// Execute deployments on this host
    Agent(AgentArgs),

    /// Print build metadata
    Version,
}

#[derive(Debug, Args)]
struct OrchestratorArgs {
    /// Postgres URL; tasks are kept in memory when absent
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, env = "DEPLOYD_AGENT_URL", default_value = "http://127.0.0.1:7070")]
    agent_url: String,

    /// 64 hex chars
    #[arg(long, env = "DEPLOYD_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    #[arg(long, env = "DEPLOYD_WORKER_POOL_SIZE", default_value = "4")]
    worker_pool_size: usize,

    #[arg(long, env = "DEPLOYD_POLL_INTERVAL_SECS", default_value = "5")]
    poll_interval_secs: u64,

    #[arg(long, env = "DEPLOYD_MAX_DEPLOYMENT_SECS", default_value = "1800")]
    max_deployment_secs: u64,

    #[arg(long, env = "DEPLOYD_RELAY_BUFFER", default_value = "100")]
    relay_buffer: usize,

    #[arg(long, env = "DEPLOYD_LISTEN", default_value = "127.0.0.1:8080")]
    listen: ServerOptions,

    /// 0 disables the health prober
    #[arg(long, env = "DEPLOYD_PROBE_INTERVAL_SECS", default_value = "60")]
    probe_interval_secs: u64,
}

#[derive(Debug, Args)]
struct AgentArgs {
    #[arg(long, env = "DEPLOYD_AGENT_LISTEN", default_value = "127.0.0.1:7070")]
    listen: ServerOptions,

    #[arg(long, env = "DEPLOYD_WEB_ROOT", default_value = "/srv/deployd")]
    web_root: PathBuf,

    #[arg(long, env = "DEPLOYD_RELEASE_RETENTION", default_value = "5")]
    release_retention: usize,

    /// Clone and build as the system user `<prefix><app_id>`, created on demand
    #[arg(long, env = "DEPLOYD_BUILD_USER_PREFIX")]
    build_user_prefix: Option<String>,

    /// Restart `<prefix><target>` through systemctl
    #[arg(long, env = "DEPLOYD_SERVICE_PREFIX")]
    service_prefix: Option<String>,
}

impl OrchestratorArgs {
    fn into_options(self) -> AppOptions {
        AppOptions {
            database_url: self.database_url.map(SecretString::from),
            agent_url: self.agent_url,
            secret_key: SecretString::from(self.secret_key),
            relay_buffer: self.relay_buffer,
            enable_prober: self.probe_interval_secs > 0,
            server: self.listen,
            dispatcher: dispatcher::Options {
                interval: Duration::from_secs(self.poll_interval_secs.max(1)),
                pool_size: self.worker_pool_size,
                max_duration: Duration::from_secs(self.max_deployment_secs),
            },
            prober: prober::Options {
                interval: Duration::from_secs(self.probe_interval_secs.max(1)),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl AgentArgs {
    fn into_options(self) -> AgentOptions {
        AgentOptions {
            web_root: self.web_root,
            retention: self.release_retention,
            build_user_prefix: self.build_user_prefix,
            service_prefix: self.service_prefix,
            server: self.listen,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("{}", serde_json::to_string_pretty(&version_info())?);
        return Ok(());
    }

    let _log_guard = match init_logging(LogOptions {
        log_level: cli.log.log_level,
        stdout: true,
        log_dir: cli.log.log_dir,
        json_format: cli.log.log_json,
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let version = version_info();
    let result = match cli.command {
        Command::Orchestrator(args) => {
            let options = args.into_options();
            info!("Running deployd {} orchestrator with options: {:?}", version.version, options);
            run(options, await_shutdown_signal()).await
        }
        Command::Agent(args) => {
            let options = args.into_options();
            info!("Running deployd {} agent with options: {:?}", version.version, options);
            run_agent(options, LifecycleOptions::default(), await_shutdown_signal()).await
        }
        Command::Version => Ok(()),
    };

    if let Err(e) = &result {
        error!("deployd exited with error: {e}");
    }
    result.context("deployd failed")
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
