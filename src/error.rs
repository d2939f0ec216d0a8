//! Application-wide error types using thiserror
//!
//! All errors outside the dispatch hot path are wrapped in AppError to keep
//! error handling consistent across the codebase. Dispatch outcomes have
//! their own enum (`core::dispatch::DispatchError`) because partial fills and
//! rate limits are expected flows, not failures.

use thiserror::Error;

use crate::adapters::errors::ExchangeError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
