//! Error types for `runnel` core library.

use thiserror::Error;

/// Result type alias using `runnel` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `runnel` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
