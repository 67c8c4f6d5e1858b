//! # Routing Error Types

use thiserror::Error;

/// Failures resolving a task type to a processing channel
///
/// Routing failures are never recovered by falling back to a default channel:
/// a task that cannot be routed never enters the system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Task type is empty")]
    EmptyTaskType,

    #[error("Task type '{task_type}' is not mapped to any channel")]
    UnmappedTaskType { task_type: String },

    #[error("Channel '{channel}' is not in the list of valid channels")]
    InvalidChannel { channel: String },
}

impl RoutingError {
    /// Create an unmapped task type error
    pub fn unmapped(task_type: impl Into<String>) -> Self {
        Self::UnmappedTaskType {
            task_type: task_type.into(),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel(channel: impl Into<String>) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
        }
    }
}
