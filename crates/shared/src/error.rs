//! Error types for Deskline

use thiserror::Error;

/// A frame that is malformed or not valid in the current session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message content is {len} bytes, limit is {max}")]
    ContentTooLarge { len: usize, max: usize },

    #[error("Frame targets a different room than the session")]
    RoomMismatch,

    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
