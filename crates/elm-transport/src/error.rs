//! ELM327 Transport Error Types

use thiserror::Error;

/// Errors that can occur while talking to an ELM327 adapter
#[derive(Debug, Error)]
pub enum ElmError {
    /// Reading from or writing to the adapter stream failed
    #[error("Stream error: {0}")]
    Stream(String),

    /// Timeout waiting for the adapter or the ECU
    #[error("Timeout waiting for adapter response after {0}ms")]
    Timeout(u64),

    /// Adapter answered with something unexpected
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A request is still waiting to be picked up by the worker
    #[error("Send request already pending")]
    Busy,

    /// Adapter was identified but cannot be driven
    #[error("Adapter not supported: {0}")]
    UnsupportedAdapter(String),

    /// A mandatory initialization step failed
    #[error("Adapter initialization failed: {0}")]
    InitFailed(String),

    /// Data transfer attempted before `init`
    #[error("Adapter not initialized")]
    NotInitialized,

    /// Caller supplied a malformed BMW-FAST telegram
    #[error("Invalid telegram: {0}")]
    InvalidTelegram(String),

    /// Checksum of a received telegram does not match
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumError { expected: u8, actual: u8 },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transfer interrupted because the worker is shutting down
    #[error("Transfer cancelled")]
    Cancelled,

    /// A blocking task used by the async client failed
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for ElmError {
    fn from(err: std::io::Error) -> Self {
        ElmError::Stream(err.to_string())
    }
}

impl From<config::ConfigError> for ElmError {
    fn from(err: config::ConfigError) -> Self {
        ElmError::Config(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ElmError>;
