//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A log filter or other setting could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// The global tracing subscriber was already installed
    #[error("Logging error: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
