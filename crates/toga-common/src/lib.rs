//! # TOGA Common
//!
//! Shared plumbing for the TOGA offline worker crates.
//!
//! ## Features
//!
//! - Worker configuration, loaded once and shared immutably
//! - Logging configuration and setup
//! - A common error type for configuration and setup failures

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{WorkerConfig, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_VERSION};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Errors raised while configuring the worker.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// Failed to read a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Scope or manifest entry is not a valid URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Logging was already initialized, or the filter was rejected.
    #[error("Logging error: {0}")]
    Logging(String),
}

impl CommonError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CommonError::Config(_) => "config",
            CommonError::Io(_) => "io",
            CommonError::Json(_) => "json",
            CommonError::Url(_) => "url",
            CommonError::Logging(_) => "logging",
        }
    }
}

/// Result type alias for setup operations.
pub type Result<T> = std::result::Result<T, CommonError>;
