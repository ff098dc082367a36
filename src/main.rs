#![forbid(unsafe_code)]

//! `agent-foreman` — coding-agent orchestration binary.
//!
//! Loads configuration, connects the tracking-service client, and runs
//! or inspects an epic's execution plan.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_foreman::agent::client::AgentClient;
use agent_foreman::config::GlobalConfig;
use agent_foreman::plan::{build_phases, dependency_warnings, ItemDisposition, PlanRunner, RunOptions};
use agent_foreman::retry::{with_retry, RetryPolicy};
use agent_foreman::session::SessionManager;
use agent_foreman::tracker::http::HttpTracker;
use agent_foreman::tracker::TrackerClient;
use agent_foreman::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-foreman", about = "Coding-agent orchestration engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the agent working directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run an epic's execution plan to completion.
    Run {
        /// Epic identifier.
        #[arg(long)]
        epic: String,
        /// Keep going even when a phase finishes with zero successes.
        #[arg(long)]
        keep_going: bool,
    },
    /// Print an epic's phase schedule without running anything.
    Plan {
        /// Epic identifier.
        #[arg(long)]
        epic: String,
    },
    /// List teams visible with the configured credentials.
    Teams,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-foreman bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
    let mut config = GlobalConfig::from_toml_str(&config_text)?;

    if let Some(workspace) = args.workspace {
        let canonical = workspace
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.agent.working_dir = Some(canonical);
    }

    config.load_credentials();
    if config.tracker.api_token.is_none() {
        warn!("no tracker API token in the environment; requests go out unauthenticated");
    }
    info!("configuration loaded");

    let tracker: Arc<dyn TrackerClient> = Arc::new(HttpTracker::new(&config.tracker)?);

    match args.command {
        CliCommand::Teams => {
            let teams = with_retry(|| tracker.list_teams(), &RetryPolicy::read_heavy()).await?;
            for team in teams {
                println!("{}\t{}", team.id, team.name);
            }
            Ok(())
        }

        CliCommand::Plan { epic } => {
            let plan = with_retry(
                || tracker.get_execution_plan(&epic),
                &RetryPolicy::read_heavy(),
            )
            .await?;
            for warning in dependency_warnings(&plan.items) {
                warn!(%warning, "dependency order check");
            }
            let phases = build_phases(&plan.items);
            println!("{} phases, {} items", phases.len(), plan.total_items);
            for (position, phase) in phases.iter().enumerate() {
                let mode = if phase.can_run_in_parallel {
                    "parallel"
                } else {
                    "sequential"
                };
                println!(
                    "phase {} (order {}, {mode}):",
                    position + 1,
                    phase.execution_order
                );
                for item in &phase.items {
                    println!("  [{}] {}", item.id, item.title);
                }
            }
            Ok(())
        }

        CliCommand::Run { epic, keep_going } => {
            let client = Arc::new(AgentClient::new(config.agent.clone()));
            let sessions = Arc::new(SessionManager::new(client, config.agent.prompt_options()));

            let options = RunOptions {
                halt_on_failed_phase: config.run.halt_on_failed_phase && !keep_going,
                item_timeout: config.run.item_timeout_ms.map(Duration::from_millis),
                ..RunOptions::default()
            };
            let runner = PlanRunner::new(tracker, Arc::clone(&sessions), options);

            let report = tokio::select! {
                report = runner.run(&epic) => report?,
                () = shutdown_signal() => {
                    warn!("shutdown signal received, tearing down sessions");
                    sessions.destroy_all();
                    return Err(AppError::Session("run interrupted by shutdown signal".into()));
                }
            };

            sessions.destroy_all();

            info!(
                succeeded = report.succeeded_count(),
                failed = report.failed_count(),
                halted = report.halted,
                "run finished"
            );
            for item in &report.items {
                match &item.disposition {
                    ItemDisposition::Succeeded => println!("ok      [{}] {}", item.item_id, item.title),
                    ItemDisposition::Failed { error } => {
                        println!("failed  [{}] {}: {error}", item.item_id, item.title);
                    }
                    ItemDisposition::Skipped => {
                        println!("skipped [{}] {}", item.item_id, item.title);
                    }
                }
            }

            if report.halted {
                error!("run halted before completing every phase");
            }
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
