//! ChatSync Error Types

use thiserror::Error;

/// Result type alias for ChatSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// ChatSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    // Protocol errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // Leadership errors
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader available")]
    NoLeader,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // Chat errors
    #[error("Chat request rejected: {0}")]
    Rejected(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the client should move on to another server after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionClosed
                | Error::NotLeader(_)
                | Error::NoLeader
                | Error::Network(_)
                | Error::Io(_)
        )
    }

    /// Check if this error must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::MemberNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionTimeout("127.0.0.1:8000".into()).is_retryable());
        assert!(Error::NoLeader.is_retryable());
        assert!(!Error::Rejected("room exists".into()).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::MemberNotFound("server9".into()).is_fatal());
        assert!(!Error::NoLeader.is_fatal());
    }
}
