//! Error types for `execbridge` core library.

use thiserror::Error;

/// Result type alias using `execbridge` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `execbridge` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced environment variable is not defined
    #[error("Environment variable not defined: {0}")]
    UndefinedEnvVar(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
