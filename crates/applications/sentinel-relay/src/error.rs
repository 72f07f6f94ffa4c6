//! Error types for the relay

use std::time::Duration;
use thiserror::Error;

use crate::types::Sentinel;

/// Relay result type
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised while decoding a Sentinel notification payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A token required at a fixed position is absent or empty
    #[error("missing {expected} at token {position} in {input:?}")]
    MissingToken {
        /// Zero-based token index
        position: usize,
        /// What the token should have held
        expected: &'static str,
        /// Whole payload
        input: String,
    },

    /// A port token is not a base-10 integer in 0..=65535
    #[error("invalid port {token:?} in {input:?}")]
    InvalidPort {
        /// Offending token
        token: String,
        /// Whole payload
        input: String,
    },
}

/// Errors that can occur in the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Sentinel could not be reached
    #[error("failed to connect to sentinel {location}: {reason}")]
    Connect {
        /// `host:port` of the sentinel
        location: String,
        /// Underlying failure
        reason: String,
    },

    /// Pub/sub subscription could not be established
    #[error("failed to subscribe to sentinel {location}: {reason}")]
    Subscribe {
        /// `host:port` of the sentinel
        location: String,
        /// Underlying failure
        reason: String,
    },

    /// A SENTINEL query returned nothing usable
    #[error("sentinel query failed: {0}")]
    Query(String),

    /// Malformed notification or query payload
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Redis protocol error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Flipper rejected or failed a switch
    #[error("flipper error: {0}")]
    Flipper(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The master-switch channel has no consumer left
    #[error("master switch channel closed")]
    ChannelClosed,
}

impl RelayError {
    /// Create a connect error for a sentinel
    pub fn connect(sentinel: &Sentinel, reason: impl ToString) -> Self {
        Self::Connect {
            location: sentinel.location(),
            reason: reason.to_string(),
        }
    }

    /// Create a subscribe error for a sentinel
    pub fn subscribe(sentinel: &Sentinel, reason: impl ToString) -> Self {
        Self::Subscribe {
            location: sentinel.location(),
            reason: reason.to_string(),
        }
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a flipper error
    pub fn flipper(msg: impl Into<String>) -> Self {
        Self::Flipper(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
