//! Error types for the routing layer

use thiserror::Error;

/// Routing error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, Error>;
