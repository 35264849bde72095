//! Error types for remote-pubsub

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect to {endpoint} after {attempts} attempts")]
    Connection { endpoint: String, attempts: u32 },

    #[error("Link closed")]
    Closed,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True for errors that mean the link is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}
