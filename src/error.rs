use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures of the durable store. None of these reach the event source; they
/// are logged and absorbed by the service.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no database connection became free within {0:?}")]
    PoolExhausted(Duration),
    #[error("flush dropped after {attempts} attempts: {source}")]
    FlushFailed {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },
    #[error(transparent)]
    Query(#[from] diesel::result::Error),
    #[error("could not build connection pool: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("database worker stopped: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Malformed input from the event adapter. Dropped and counted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event has no actor")]
    MissingActor,
    #[error("event timestamp {0} is too far in the future")]
    FutureTimestamp(DateTime<Utc>),
}

/// Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
