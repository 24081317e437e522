//! Common error types for Parley.

use thiserror::Error;

/// Result type alias using Parley's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type shared by the gateway and the client.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller could not be authenticated
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create an unauthenticated error from any displayable type.
    pub fn unauthenticated(msg: impl std::fmt::Display) -> Self {
        Self::Unauthenticated(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
