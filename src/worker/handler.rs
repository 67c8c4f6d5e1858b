//! # Task Handlers
//!
//! A channel worker dispatches every delivery to exactly one [`TaskHandler`],
//! the one bound to its channel. Handlers report a [`TaskOutcome`]; an outcome
//! whose status is [`OutcomeStatus::Error`] counts as a failed delivery just
//! like a returned [`HandlerError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::messaging::message::{wire_timestamp, Task};
use crate::routing::TaskKind;

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("Task decode failed: {message}")]
    Decode { message: String },

    #[error("Channel '{channel}' does not handle task type '{task_type}'")]
    UnsupportedTaskType { channel: String, task_type: String },

    #[error("Task {task_id} failed: {message}")]
    Failed { task_id: Uuid, message: String },

    #[error("Orchestrator error: {message}")]
    Orchestrator { message: String },

    #[error("Task {task_id} timed out after {seconds}s")]
    Timeout { task_id: Uuid, seconds: u64 },

    #[error("Handler table error: {message}")]
    Registry { message: String },
}

impl HandlerError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn unsupported(channel: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::UnsupportedTaskType {
            channel: channel.into(),
            task_type: task_type.into(),
        }
    }

    pub fn failed(task_id: Uuid, message: impl Into<String>) -> Self {
        Self::Failed {
            task_id,
            message: message.into(),
        }
    }

    pub fn orchestrator(message: impl Into<String>) -> Self {
        Self::Orchestrator {
            message: message.into(),
        }
    }

    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Error,
}

/// Result document produced for one task
///
/// Serialized as `{"task_id", "status", "result", "analysis_summary", "error",
/// "timestamp"}` so external agent commands can emit it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: OutcomeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,

    #[serde(default)]
    pub result: Value,

    #[serde(
        rename = "analysis_summary",
        alias = "summary",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "timestamp", default = "Utc::now", with = "wire_timestamp")]
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn completed(task_id: Uuid, result: Value, summary: Option<String>) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            task_id: Some(task_id),
            result,
            summary,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn error(task_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            task_id: Some(task_id),
            result: Value::Null,
            summary: None,
            error: Some(message.into()),
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

/// Channel-bound task processing
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Channel this handler is bound to
    fn channel(&self) -> &str;

    /// Whether tasks of this kind are routed to the handler's channel
    fn accepts(&self, kind: TaskKind) -> bool;

    /// Process one task
    ///
    /// An `Ok` outcome with an error status is still a failure for
    /// acknowledgement purposes.
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, HandlerError>;
}

/// Handlers keyed by the channel they are bound to
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("channels", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its channel, replacing any previous one
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(handler.channel().to_string(), handler)
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(channel).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
