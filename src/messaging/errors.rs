//! # Messaging Error Types
//!
//! Structured error handling for broker operations using thiserror instead of
//! `Box<dyn Error>` patterns. Errors are classified so callers can tell a
//! connectivity fault (evict the connection and back off) from a payload
//! fault (the connection is still usable).

use thiserror::Error;

/// Broker and wire-format error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Broker connection error on channel '{channel}': {message}")]
    Connection { channel: String, message: String },

    #[error("Queue '{queue_name}' unavailable on channel '{channel}': {message}")]
    QueueUnavailable {
        channel: String,
        queue_name: String,
        message: String,
    },

    #[error("Publish to '{queue_name}' on channel '{channel}' failed: {message}")]
    Publish {
        channel: String,
        queue_name: String,
        message: String,
    },

    #[error("{operation} of delivery {delivery_tag} on channel '{channel}' failed: {message}")]
    Acknowledgement {
        channel: String,
        operation: String,
        delivery_tag: u64,
        message: String,
    },

    #[error("Consume from '{queue_name}' on channel '{channel}' failed: {message}")]
    Consume {
        channel: String,
        queue_name: String,
        message: String,
    },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a queue unavailable error
    pub fn queue_unavailable(
        channel: impl Into<String>,
        queue_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueUnavailable {
            channel: channel.into(),
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(
        channel: impl Into<String>,
        queue_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Publish {
            channel: channel.into(),
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create an ack failure
    pub fn ack(channel: impl Into<String>, delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            channel: channel.into(),
            operation: "ack".to_string(),
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create a nack failure
    pub fn nack(channel: impl Into<String>, delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            channel: channel.into(),
            operation: "nack".to_string(),
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create a consume error
    pub fn consume(
        channel: impl Into<String>,
        queue_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Consume {
            channel: channel.into(),
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the connection it happened on can no longer be trusted
    ///
    /// Connectivity faults are recovered by discarding the connection and
    /// reconnecting after the configured backoff. Payload faults leave the
    /// connection usable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::QueueUnavailable { .. }
                | Self::Publish { .. }
                | Self::Acknowledgement { .. }
                | Self::Consume { .. }
        )
    }

    /// Whether the error is a payload encoding/decoding fault
    pub fn is_serialization(&self) -> bool {
        matches!(
            self,
            Self::MessageSerialization { .. } | Self::MessageDeserialization { .. }
        )
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messaging_error_creation() {
        let conn_err = MessagingError::connection("fluxo_exames", "refused");
        assert!(matches!(conn_err, MessagingError::Connection { .. }));

        let queue_err = MessagingError::queue_unavailable("fluxo_exames", "eventos", "NOT_FOUND");
        assert!(matches!(queue_err, MessagingError::QueueUnavailable { .. }));

        let nack_err = MessagingError::nack("fluxo_exames", 7, "channel closed");
        assert!(matches!(
            nack_err,
            MessagingError::Acknowledgement { delivery_tag: 7, .. }
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(MessagingError::connection("c", "x").is_connectivity());
        assert!(MessagingError::queue_unavailable("c", "q", "x").is_connectivity());
        assert!(MessagingError::ack("c", 1, "x").is_connectivity());
        assert!(!MessagingError::message_deserialization("x").is_connectivity());
        assert!(MessagingError::message_deserialization("x").is_serialization());
        assert!(!MessagingError::configuration("broker", "x").is_connectivity());
    }

    #[test]
    fn test_serde_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let messaging_err: MessagingError = json_err.into();
        assert!(matches!(
            messaging_err,
            MessagingError::MessageDeserialization { .. }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::queue_unavailable("fluxo_opme", "eventos", "NOT_FOUND");
        let display_str = format!("{err}");
        assert!(display_str.contains("eventos"));
        assert!(display_str.contains("fluxo_opme"));
        assert!(display_str.contains("NOT_FOUND"));
    }
}
