//! Error types for devsim

use thiserror::Error;

/// Core devsim errors
///
/// Simulated packet loss and simulated outages are not errors; both are
/// expected outcomes of the simulation.
#[derive(Error, Debug)]
pub enum DeviceError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection refused by broker: return code {0}")]
    ConnectionRefused(u8),

    #[error("Connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("Link down")]
    LinkDown,

    #[error("Retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DeviceError {
    /// Creates a transport error.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

/// Result type for devsim operations
pub type DeviceResult<T> = Result<T, DeviceError>;
