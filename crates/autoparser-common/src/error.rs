//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for autoparser operations
pub type Result<T> = std::result::Result<T, AutoparserError>;

/// Main error type for autoparser
#[derive(Error, Debug)]
pub enum AutoparserError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),
}
