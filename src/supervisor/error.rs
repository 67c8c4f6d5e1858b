use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("No channels configured to supervise")]
    NoChannels,

    #[error("Failed to spawn worker for channel '{channel}': {message}")]
    Spawn { channel: String, message: String },

    #[error("Failed to signal worker for channel '{channel}': {message}")]
    Signal { channel: String, message: String },

    #[error("Worker launcher unavailable: {message}")]
    Launcher { message: String },
}

impl SupervisorError {
    pub fn spawn(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn signal(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Signal {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn launcher(message: impl Into<String>) -> Self {
        Self::Launcher {
            message: message.into(),
        }
    }
}
