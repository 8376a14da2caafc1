//! Error types shared by SDA crates

use thiserror::Error;

/// Result type alias for SDA operations
pub type Result<T> = std::result::Result<T, SdaError>;

/// Main error type for shared SDA functionality
#[derive(Error, Debug)]
pub enum SdaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Decode error: {0}")]
    Decode(String),
}
