//! slotgridd: the slotgrid daemon.
//!
//! Runs the scheduler actor with its reaper until Ctrl-C, and checks
//! agent configuration files.
//!
//! # Usage
//!
//! ```text
//! slotgridd master --config /etc/slotgrid/master.toml
//! slotgridd check-agent --config /etc/slotgrid/agent.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use slotgrid_core::{AgentOptions, ConfigError, MasterConfig};
use slotgrid_scheduler::{SchedulerService, ServiceChannels, ServiceConfig};

const DEFAULT_FILTER: &str = "info,slotgridd=debug,slotgrid=debug";

#[derive(Parser)]
#[command(name = "slotgridd", about = "slotgrid scheduler daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler.
    Master {
        /// Master configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate an agent configuration file and print it.
    CheckAgent {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Master { config } => {
            let config = load_master_config(config.as_deref())?;
            run_master(config).await
        }
        Command::CheckAgent { config } => {
            let opts = load_agent_options(&config)?;
            println!("{}", opts.printable()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Fold every validation error into one report.
fn check(what: &str, errs: Vec<ConfigError>) -> anyhow::Result<()> {
    if errs.is_empty() {
        return Ok(());
    }
    let list: Vec<String> = errs.iter().map(|e| format!("  - {e}")).collect();
    bail!("invalid {what} configuration:\n{}", list.join("\n"))
}

fn load_master_config(path: Option<&Path>) -> anyhow::Result<MasterConfig> {
    let config = match path {
        Some(path) => MasterConfig::from_file(path)
            .with_context(|| format!("loading master config from {}", path.display()))?,
        None => MasterConfig::default(),
    };
    check("master", config.validate())?;
    Ok(config)
}

fn load_agent_options(path: &Path) -> anyhow::Result<AgentOptions> {
    let opts = AgentOptions::from_file(path)
        .with_context(|| format!("loading agent options from {}", path.display()))?;
    check("agent", opts.validate())?;
    Ok(opts)
}

async fn run_master(config: MasterConfig) -> anyhow::Result<()> {
    info!(
        host = %config.master.host,
        port = config.master.port,
        heartbeat_timeout = ?config.heartbeat_timeout(),
        kill_timeout = ?config.kill_timeout(),
        "slotgrid master starting"
    );

    let (handle, channels, mut scheduler) = SchedulerService::spawn(ServiceConfig::from(&config));
    let relay = tokio::spawn(relay_outbound(channels));

    let mut updates = handle.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            info!(
                task_id = %update.task_id,
                state = %update.state,
                reason = ?update.reason,
                "task update"
            );
        }
    });

    // The actor only stops on its own when its bookkeeping is corrupt.
    let joined = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to install Ctrl-C handler")?;
            info!("shutdown signal received");
            handle.shutdown();
            scheduler.await
        }
        joined = &mut scheduler => joined,
    };
    let outcome = joined.context("scheduler task panicked")?;
    let _ = relay.await;
    watcher.abort();

    outcome.context("scheduler stopped with an error")?;
    info!("slotgrid master stopped");
    Ok(())
}

/// Hand commands and log lines to their consumers. There is no agent
/// transport in this binary, so both are written to the log.
async fn relay_outbound(mut channels: ServiceChannels) {
    loop {
        tokio::select! {
            command = channels.commands.recv() => match command {
                Some(command) => match serde_json::to_string(&command) {
                    Ok(json) => {
                        info!(agent_id = %command.agent_id(), command = %json, "agent command")
                    }
                    Err(e) => warn!(error = %e, "unable to encode agent command"),
                },
                None => break,
            },
            record = channels.logs.recv() => match record {
                Some(record) => debug!(task_id = %record.task_id, "{}", record.line),
                None => break,
            },
        }
    }
}
