//! # Channel Workers
//!
//! Everything that runs inside one channel's worker: the consumer loop, the
//! channel-bound handler it dispatches to, the redelivery policy and the
//! cooperative shutdown signal.

pub mod consumer;
pub mod handler;
pub mod lane_handler;
pub mod orchestrator;
pub mod redelivery;
pub mod shutdown;

use tracing::info;

pub use consumer::{ConsumerLoop, ConsumerSettings, ConsumerState, ConsumerStats, ConsumerSummary};
pub use handler::{HandlerError, HandlerRegistry, OutcomeStatus, TaskHandler, TaskOutcome};
pub use lane_handler::LaneHandler;
pub use orchestrator::{AcknowledgingOrchestrator, AgentOrchestrator, CommandOrchestrator};
pub use redelivery::{Disposition, RedeliveryPolicy, RedeliveryTracker};
pub use shutdown::{wait_for_shutdown_signal, ShutdownSignal};

use crate::config::LanesConfig;
use crate::error::Result;
use crate::messaging::Broker;
use crate::routing::ChannelRegistry;

/// Build the consumer loop for one configured channel
///
/// Fails if the channel is not configured or a routed task type has no
/// [`TaskKind`](crate::routing::TaskKind).
pub fn build_consumer<B: Broker>(
    config: &LanesConfig,
    broker: B,
    channel_name: &str,
    shutdown: ShutdownSignal,
) -> Result<ConsumerLoop<B>> {
    let registry = ChannelRegistry::from_config(config);
    let channel = registry.channel(channel_name)?;
    let orchestrator = orchestrator::from_config(&config.orchestrator)?;
    let handlers = HandlerRegistry::for_lanes(&registry, orchestrator)?;
    let handler = handlers.get(channel.name()).ok_or_else(|| {
        HandlerError::registry(format!("no handler bound to channel '{}'", channel.name()))
    })?;

    let settings = ConsumerSettings::from_config(config, &channel);
    Ok(ConsumerLoop::new(channel, broker, handler, settings, shutdown))
}

/// Run one channel's worker until shutdown is requested
pub async fn run_channel_worker<B: Broker>(
    config: &LanesConfig,
    broker: B,
    channel_name: &str,
    shutdown: ShutdownSignal,
) -> Result<ConsumerSummary> {
    let consumer = build_consumer(config, broker, channel_name, shutdown)?;
    info!(channel = %channel_name, pid = std::process::id(), "Channel worker started");
    Ok(consumer.run().await)
}
