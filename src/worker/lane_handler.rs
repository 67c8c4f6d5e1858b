//! # Lane Handler
//!
//! The [`TaskHandler`] every channel worker runs. It accepts only the task
//! kinds routed to its channel and hands them to the configured
//! [`AgentOrchestrator`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::handler::{HandlerError, HandlerRegistry, TaskHandler, TaskOutcome};
use super::orchestrator::AgentOrchestrator;
use crate::messaging::message::Task;
use crate::routing::{ChannelRegistry, TaskKind};

pub struct LaneHandler {
    channel: String,
    kinds: BTreeSet<TaskKind>,
    orchestrator: Arc<dyn AgentOrchestrator>,
}

impl std::fmt::Debug for LaneHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneHandler")
            .field("channel", &self.channel)
            .field("kinds", &self.kinds)
            .field("orchestrator", &self.orchestrator.name())
            .finish()
    }
}

impl LaneHandler {
    pub fn new(
        channel: impl Into<String>,
        kinds: impl IntoIterator<Item = TaskKind>,
        orchestrator: Arc<dyn AgentOrchestrator>,
    ) -> Self {
        Self {
            channel: channel.into(),
            kinds: kinds.into_iter().collect(),
            orchestrator,
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.kinds.iter().copied()
    }
}

#[async_trait]
impl TaskHandler for LaneHandler {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn accepts(&self, kind: TaskKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn handle(&self, task: &Task) -> Result<TaskOutcome, HandlerError> {
        let kind = match task.kind() {
            Ok(kind) if self.accepts(kind) => kind,
            _ => {
                warn!(
                    channel = %self.channel,
                    task_id = %task.id,
                    task_type = %task.task_type,
                    "Task type not handled on this channel"
                );
                return Err(HandlerError::unsupported(&self.channel, &task.task_type));
            }
        };

        debug!(channel = %self.channel, task_id = %task.id, task_type = %kind, "Dispatching task");
        let mut outcome = self.orchestrator.run(kind, task).await?;

        if !outcome.is_success() {
            let message = outcome
                .error
                .take()
                .unwrap_or_else(|| "agent reported an error status".to_string());
            return Err(HandlerError::failed(task.id, message));
        }

        outcome
            .summary
            .get_or_insert_with(|| format!("Análise de {} completa", analysis_subject(kind)));
        Ok(outcome)
    }
}

/// Human-readable subject used in outcome summaries
fn analysis_subject(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Consulta => "consulta",
        TaskKind::Internacao => "internação",
        TaskKind::Alta => "alta hospitalar",
        TaskKind::Hemograma => "hemograma",
        TaskKind::RaioX => "raio-x",
        TaskKind::Tomografia => "tomografia",
        TaskKind::Protese => "prótese",
        TaskKind::Orgao => "órgão",
        TaskKind::Material => "material OPME",
        TaskKind::CargaPacientes => "carga de pacientes",
        TaskKind::CargaMedicos => "carga de médicos",
        TaskKind::CargaExames => "carga de exames",
    }
}

impl HandlerRegistry {
    /// One [`LaneHandler`] per configured channel
    ///
    /// Every routed task type must be a known [`TaskKind`]; routes pointing
    /// outside the channel set are skipped since the producer rejects them.
    pub fn for_lanes(
        registry: &ChannelRegistry,
        orchestrator: Arc<dyn AgentOrchestrator>,
    ) -> Result<Self, HandlerError> {
        let mut unknown = Vec::new();
        let mut table = HandlerRegistry::new();

        for channel in registry.channel_names() {
            let mut kinds = Vec::new();
            for task_type in registry.task_types_for(channel) {
                match task_type.parse::<TaskKind>() {
                    Ok(kind) => kinds.push(kind),
                    Err(_) => unknown.push(format!("{task_type} -> {channel}")),
                }
            }
            table.register(Arc::new(LaneHandler::new(
                channel,
                kinds,
                Arc::clone(&orchestrator),
            )));
        }

        if !unknown.is_empty() {
            return Err(HandlerError::registry(format!(
                "routed task types have no handler: {}",
                unknown.join(", ")
            )));
        }
        Ok(table)
    }
}
