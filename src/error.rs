//! Error types for the lane dispatch system.
//!
//! Each layer has its own `thiserror` enum; [`LanesError`] wraps them for
//! callers that cross layers (the producer's typed publish, the binary).

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::routing::RoutingError;
use crate::supervisor::SupervisorError;
use crate::worker::HandlerError;

#[derive(Debug, Error)]
pub enum LanesError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl LanesError {
    /// Whether retrying after a reconnect could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Messaging(e) if e.is_connectivity())
    }
}

pub type Result<T> = std::result::Result<T, LanesError>;
