//! # Error Types
//!
//! Custom error types for the telematics agent using `thiserror`.

use thiserror::Error;

/// Main error type for the telematics agent
#[derive(Debug, Error)]
pub enum TelematicsError {
    /// Message codec errors (undecodable or foreign datagrams)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Vehicle bus errors
    #[error("Bus error: {0}")]
    Bus(String),

    /// Setting store errors
    #[error("Settings error: {0}")]
    Settings(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Persisted state errors
    #[error("State error: {0}")]
    State(#[from] serde_json::Error),

    /// Datagram transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the telematics agent
pub type Result<T> = std::result::Result<T, TelematicsError>;
