//! Error types for command execution

use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Command not found
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command that was not found
        command: String,
    },

    /// SSH connection failed
    #[error("SSH connection failed to {host}: {reason}")]
    SshConnectionFailed {
        /// The hostname or IP address that failed to connect
        host: String,
        /// The detailed reason for the connection failure
        reason: String,
    },

    /// SSH authentication failed
    #[error("SSH authentication failed for {host}")]
    SshAuthenticationFailed {
        /// The destination that rejected our credentials
        host: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Add layer context to a spawn error so nested launchers report where they failed
    pub fn with_layer_context(self, layer: impl Into<String>) -> Self {
        match self {
            Error::SpawnFailed { reason } => Error::SpawnFailed {
                reason: format!("in {} layer: {}", layer.into(), reason),
            },
            other => other,
        }
    }

    /// Whether this error means the remote side refused our credentials
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Error::SshAuthenticationFailed { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
