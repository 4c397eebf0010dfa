//! Client error types

use deskline_shared::ProtocolError;

/// Errors surfaced to the application by the connection manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Socket-level failure; the manager reconnects on its own
    #[error("Transport error: {0}")]
    Transport(String),

    /// No `message_sent` arrived before the send deadline
    #[error("Timed out waiting for acknowledgement")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session closed while the send was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// The send was attempted while the session was not open
    #[error("Connection is not open")]
    NotOpen,

    /// An explicit `error` frame from the server
    #[error("Server error: {message}")]
    Server { message: String },

    /// Terminal: the reconnect budget is spent
    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection manager shut down")]
    Shutdown,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}
