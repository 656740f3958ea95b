//! Error types shared across EPMS crates

use thiserror::Error;

/// Result type alias for EPMS operations
pub type Result<T> = std::result::Result<T, EpmsError>;

/// Main error type for EPMS
#[derive(Error, Debug)]
pub enum EpmsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup error: {0}")]
    Logging(String),
}

impl EpmsError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EpmsError::Config(msg.into())
    }
}
