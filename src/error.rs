//! Relay error types

use thiserror::Error;

/// Errors that can occur in the relay system
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket or filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The relay answered our registration with an error
    #[error("Registration rejected: {0}")]
    Rejected(String),

    /// Peer went away before the operation completed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server was started twice
    #[error("Server already started")]
    AlreadyStarted,

    /// Server is not accepting connections
    #[error("Server is not listening")]
    NotListening,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
