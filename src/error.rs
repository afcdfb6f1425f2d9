//! Error types for the Windowguard service.

use thiserror::Error;

/// Main error type for Windowguard operations.
#[derive(Error, Debug)]
pub enum WindowGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or script errors reported by the coordination store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The window evaluator replied with something other than 0 or 1
    #[error("Unexpected evaluator reply: {0}")]
    UnexpectedReply(i64),

    /// The store call did not complete before its deadline
    #[error("Store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The caller cancelled the in-flight store call
    #[error("Store call cancelled by caller")]
    Cancelled,

    /// The store has been closed and accepts no more calls
    #[error("Store connection is closed")]
    StoreClosed,

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for WindowGuardError {
    fn from(e: config::ConfigError) -> Self {
        WindowGuardError::Config(e.to_string())
    }
}

/// Result type alias for Windowguard operations.
pub type Result<T> = std::result::Result<T, WindowGuardError>;
