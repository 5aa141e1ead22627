//! Bus error types.

use thiserror::Error;
use wgfleet_events::EventError;

/// Errors returned by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publish was handed an envelope with nothing in it.
    #[error("empty message during publish")]
    EmptyMessage,

    /// A topic pattern did not compile as a regular expression.
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The shared key-value / broadcast medium failed.
    #[error("medium error: {0}")]
    Medium(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A broadcast pointer could not be decoded.
    #[error("malformed pointer: {0}")]
    MalformedPointer(String),

    /// A stored envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl From<EventError> for BusError {
    fn from(err: EventError) -> Self {
        BusError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        BusError::Medium(err.to_string())
    }
}
