use thiserror::Error;

/// Envelope and payload codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A payload did not decode into the type its topic promises.
    #[error("invalid {topic} payload: {reason}")]
    InvalidPayload { topic: String, reason: String },

    /// Envelope or pointer JSON could not be produced or parsed.
    #[error("json codec error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
