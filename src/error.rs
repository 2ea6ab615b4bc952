//! Error types for the TalkTime rate limit service.

use std::time::Duration;

use thiserror::Error;

use crate::mesh::ClusterError;

/// Main error type for TalkTime rate limiting operations.
#[derive(Error, Debug)]
pub enum TalkTimeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A shared store rejected or failed an operation
    #[error("Store error: {0}")]
    Store(String),

    /// A shared store did not answer in time
    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TalkTimeError {
    fn from(err: config::ConfigError) -> Self {
        TalkTimeError::Config(err.to_string())
    }
}

/// Result type alias for TalkTime operations.
pub type Result<T> = std::result::Result<T, TalkTimeError>;
