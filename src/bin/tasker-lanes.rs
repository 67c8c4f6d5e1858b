//! # tasker-lanes
//!
//! ```bash
//! # Supervise one worker per configured channel
//! tasker-lanes --config lanes.toml supervise
//!
//! # Run a single channel's worker (what `supervise` spawns)
//! tasker-lanes worker --channel fluxo_exames
//!
//! # Publish a task
//! tasker-lanes publish --type hemograma --data '{"paciente": {"id": 1, "nome": "A"}}'
//!
//! # Show the routing table
//! tasker-lanes routes
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tasker_lanes::config::{ConfigLoader, IsolationMode, LanesConfig};
use tasker_lanes::logging;
use tasker_lanes::messaging::{BrokerProvider, TaskProducer, TaskRequest};
use tasker_lanes::routing::ChannelRegistry;
use tasker_lanes::supervisor::{InProcessLauncher, ProcessLauncher, ShutdownReport, WorkerSupervisor};
use tasker_lanes::worker::{run_channel_worker, ShutdownSignal};

#[derive(Parser, Debug)]
#[command(name = "tasker-lanes")]
#[command(about = "Channel-isolated task dispatch over RabbitMQ")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "TASKER_LANES_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one worker per configured channel and keep them alive
    Supervise,

    /// Run the consumer loop for a single channel
    Worker {
        /// Channel (virtual host) to consume from
        #[arg(long)]
        channel: String,
    },

    /// Publish one task
    Publish {
        /// Task type, e.g. hemograma
        #[arg(long = "type", value_name = "TYPE")]
        task_type: String,
        /// Task data as a JSON document, sent as `dados`
        #[arg(long)]
        data: Option<String>,
        /// Task priority
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Publish into this channel instead of the routed one
        #[arg(long)]
        channel: Option<String>,
    },

    /// Print the task type to channel routing table
    Routes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .with_optional_file(cli.config.clone())
        .load()
        .context("loading configuration")?;

    match cli.command {
        Commands::Supervise => supervise(config, cli.config).await,
        Commands::Worker { channel } => worker(config, &channel).await,
        Commands::Publish {
            task_type,
            data,
            priority,
            channel,
        } => publish(config, task_type, data, priority, channel).await,
        Commands::Routes => {
            print_routes(&ChannelRegistry::from_config(&config));
            Ok(())
        }
    }
}

async fn supervise(config: LanesConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let registry = ChannelRegistry::from_config(&config);
    let shutdown = ShutdownSignal::new();
    shutdown.trigger_on_os_signal();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        isolation = ?config.supervisor.isolation,
        provider = %config.broker.provider,
        "Starting lane supervisor"
    );

    let report = match config.supervisor.isolation {
        IsolationMode::Process => {
            let launcher = ProcessLauncher::current_exe(config_path)?;
            WorkerSupervisor::new(launcher, &registry, &config.supervisor)
                .run(&shutdown)
                .await?
        }
        IsolationMode::InProcess => {
            let broker = BrokerProvider::from_config(&config);
            let settings = config.supervisor.clone();
            let launcher = InProcessLauncher::new(Arc::new(config), broker);
            WorkerSupervisor::new(launcher, &registry, &settings)
                .run(&shutdown)
                .await?
        }
    };

    log_report(&report);
    Ok(())
}

async fn worker(config: LanesConfig, channel: &str) -> anyhow::Result<()> {
    let shutdown = ShutdownSignal::new();
    shutdown.trigger_on_os_signal();

    let broker = BrokerProvider::from_config(&config);
    let summary = run_channel_worker(&config, broker, channel, shutdown)
        .await
        .with_context(|| format!("running worker for channel '{channel}'"))?;

    info!(channel = %channel, summary = ?summary, "Worker exiting");
    Ok(())
}

async fn publish(
    config: LanesConfig,
    task_type: String,
    data: Option<String>,
    priority: i32,
    channel: Option<String>,
) -> anyhow::Result<()> {
    let mut request = TaskRequest::new(task_type).with_priority(priority);
    if let Some(raw) = data {
        let data: serde_json::Value =
            serde_json::from_str(&raw).context("--data is not valid JSON")?;
        request = request.with_data(data);
    }

    let producer = TaskProducer::from_config(&config, BrokerProvider::from_config(&config));
    let published = match channel {
        Some(channel) => producer.try_publish_to(&channel, request).await,
        None => producer.try_publish(request).await,
    };
    producer.shutdown().await;

    match published {
        Ok(receipt) => {
            println!("{}", receipt.message_id);
            info!(
                task_id = %receipt.task_id,
                channel = %receipt.channel,
                "Published"
            );
            Ok(())
        }
        Err(e) => bail!("task not published: {e}"),
    }
}

fn print_routes(registry: &ChannelRegistry) {
    for (task_type, channel) in registry.routes() {
        if registry.is_valid_channel(channel) {
            println!("{task_type:<20} {channel}");
        } else {
            println!("{task_type:<20} {channel} (not a configured channel)");
        }
    }
    for channel in registry.channel_names() {
        if registry.task_types_for(channel).is_empty() {
            println!("{:<20} {channel}", "-");
        }
    }
}

fn log_report(report: &ShutdownReport) {
    if report.terminated.is_empty() {
        info!(stopped = report.graceful.len(), "All workers stopped");
    } else {
        warn!(
            stopped = report.graceful.len(),
            terminated = ?report.terminated,
            "Some workers had to be terminated"
        );
    }
}
