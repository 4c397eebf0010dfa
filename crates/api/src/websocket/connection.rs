//! WebSocket connection management
//!
//! Represents one live session joined to exactly one ticket room.

use deskline_shared::{Role, RoomId, ServerEvent, SessionId, UserId};
use tokio::sync::mpsc;

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: SessionId,

    /// Ticket room this session is joined to
    pub room_id: RoomId,

    /// Authenticated user ID
    pub user_id: UserId,

    /// Role the user was admitted under
    pub role: Role,

    /// Channel to send events to this connection
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    /// Create a new connection
    pub fn new(
        room_id: RoomId,
        user_id: UserId,
        role: Role,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            room_id,
            user_id,
            role,
            sender,
        }
    }

    /// Send an event to this connection
    ///
    /// Returns Ok(()) if sent successfully, Err if connection is closed
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    /// Whether the writer half of this session has gone away
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_after_writer_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(RoomId::new(), UserId::new(), Role::Customer, tx);

        assert!(conn.send(ServerEvent::Heartbeat).is_ok());
        assert!(!conn.is_closed());

        drop(rx);
        assert!(conn.is_closed());
        assert!(conn.send(ServerEvent::Heartbeat).is_err());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = Connection::new(RoomId::new(), UserId::new(), Role::Staff, tx.clone());
        let b = Connection::new(a.room_id, a.user_id, Role::Staff, tx);
        assert_ne!(a.session_id, b.session_id);
    }
}
