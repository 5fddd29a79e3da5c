//! # Taskbus
//!
//! Runs the priority task scheduler and the message bus in one process.
//!
//! Usage:
//!   taskbus                          # Run with ~/.taskbus/config.toml (or defaults)
//!   taskbus --config ./taskbus.toml  # Custom config file
//!   taskbus check-config             # Validate config and exit

mod monitor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use taskbus_bus::{MessageBus, PublishOptions};
use taskbus_core::config::LoggingConfig;
use taskbus_core::{FileStore, RecordStore, TaskbusConfig};
use taskbus_scheduler::{JobOptions, Priority, Scheduler, TaskOutcome, Work};

use crate::monitor::HealthMonitor;

#[derive(Parser)]
#[command(
    name = "taskbus",
    version,
    about = "⏱️ Taskbus: priority task scheduler and wildcard message bus"
)]
struct Cli {
    /// Config file (default: ~/.taskbus/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Start the scheduler and bus (default)
    Run,
    /// Load and validate the config, then exit
    CheckConfig,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = ["taskbus", "taskbus_core", "taskbus_scheduler", "taskbus_bus"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

/// Bus channel a scheduler outcome is announced on.
fn outcome_channel(outcome: &TaskOutcome) -> &'static str {
    match outcome {
        TaskOutcome::Completed(_) => "task:completed",
        TaskOutcome::Retrying(_) => "task:retry",
        TaskOutcome::Failed(_) => "task:failed",
    }
}

/// Announce every scheduler outcome on the bus.
fn wire_outcomes(scheduler: &Scheduler, bus: &MessageBus) {
    let bus = bus.clone();
    scheduler.set_on_outcome(move |outcome| {
        let channel = outcome_channel(outcome);
        match serde_json::to_value(outcome.snapshot()) {
            Ok(data) => {
                bus.publish(channel, data, PublishOptions::default());
            }
            Err(e) => tracing::warn!("⚠️ Could not encode outcome for {}: {e}", channel),
        }
    });
}

fn heartbeat(bus: &MessageBus) -> Work {
    let bus = bus.clone();
    Work::new(move || {
        let bus = bus.clone();
        async move {
            let published = bus.publish(
                "system:heartbeat",
                json!({ "at": Utc::now().to_rfc3339() }),
                PublishOptions::default(),
            );
            Ok(json!({ "published": published }))
        }
    })
}

async fn run(config: TaskbusConfig) -> Result<()> {
    let data_dir = config.store.data_path();
    let store: Arc<dyn RecordStore> = Arc::new(FileStore::new(&data_dir)?);
    store.set_value("runtime.last_start", json!(Utc::now().to_rfc3339()))?;

    let bus = MessageBus::new(config.bus.clone());
    bus.initialize();

    let scheduler = Scheduler::new(config.scheduler.clone()).with_store(store);
    wire_outcomes(&scheduler, &bus);
    let monitor = HealthMonitor::install(&bus, &config.monitor);

    scheduler
        .schedule_recurring_job(
            "system:heartbeat",
            heartbeat(&bus),
            "every 1 minutes",
            JobOptions::new().priority(Priority::LOW),
        )
        .await?;
    scheduler.initialize();

    tracing::info!("🚀 Taskbus running (data: {}). Press Ctrl-C to stop.", data_dir.display());
    tokio::signal::ctrl_c().await?;

    tracing::info!("👋 Shutting down");
    scheduler.shutdown();
    monitor.uninstall();
    bus.shutdown();
    Ok(())
}

fn check_config(config: &TaskbusConfig) {
    println!("✅ Config OK");
    println!(
        "   Scheduler: {} concurrent, {} retries, {}ms retry delay",
        config.scheduler.max_concurrent_tasks,
        config.scheduler.max_retries,
        config.scheduler.retry_delay_ms
    );
    println!(
        "   Bus:       {} channel rules, history {}",
        config.bus.enabled_channels.len(),
        if config.bus.message_history.enabled { "on" } else { "off" }
    );
    println!("   Data dir:  {}", config.store.data_path().display());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TaskbusConfig::load_from(&expand_path(path))?,
        None => TaskbusConfig::load()?,
    };
    init_logging(&config.logging, cli.verbose);

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            check_config(&config);
            Ok(())
        }
        Command::Run => run(config).await,
    }
}
