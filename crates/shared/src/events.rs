//! Wire protocol for ticket chat
//!
//! Defines all client-to-server and server-to-client frames, plus the
//! out-of-band notification events pushed to users who are not live in a room.
//! Every frame is a JSON object tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::ProtocolError;
use crate::types::{Message, MessageId, Role, RoomId, SessionId, TempId, UserId};

/// Characters of message content carried in a notification preview
pub const PREVIEW_CHARS: usize = 140;

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Frames sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Post a message; `temp_id` is echoed back in `message_sent`
    Message {
        room_id: RoomId,
        temp_id: TempId,
        content: String,
        #[serde(default)]
        internal: bool,
    },

    /// User is typing in the room
    Typing { room_id: RoomId },

    /// User has seen a message
    MessageRead {
        message_id: MessageId,
        #[serde(with = "time::serde::rfc3339")]
        read_at: OffsetDateTime,
    },

    /// Withdraw a previously sent message
    WithdrawMessage { message_id: MessageId, room_id: RoomId },

    /// Client-side liveness beacon
    Heartbeat,

    /// Answer to a server `heartbeat` probe
    HeartbeatAck,

    /// Application-defined signal, forwarded to the room without interpretation
    Custom {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Message { .. } => "message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::MessageRead { .. } => "message_read",
            ClientEvent::WithdrawMessage { .. } => "withdraw_message",
            ClientEvent::Heartbeat => "heartbeat",
            ClientEvent::HeartbeatAck => "heartbeat_ack",
            ClientEvent::Custom { .. } => "custom",
        }
    }

    /// The existing message this frame acts on, if any
    pub fn subject(&self) -> Option<MessageId> {
        match self {
            ClientEvent::MessageRead { message_id, .. }
            | ClientEvent::WithdrawMessage { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Frames sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session admitted to the room
    JoinSuccess {
        session_id: SessionId,
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    },

    /// Another session joined the room
    UserJoined {
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    },

    /// A session left the room (clean close or forced timeout)
    UserLeft { room_id: RoomId, user_id: UserId },

    /// Message accepted from another participant
    NewMessage {
        durable_id: MessageId,
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        internal: bool,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },

    /// Acknowledgement to the sender that its message is durable
    MessageSent { temp_id: TempId, durable_id: MessageId },

    /// Broadcast to the room, and echoed to the withdrawing session as its
    /// confirmation
    MessageWithdrawn { message_id: MessageId, room_id: RoomId },

    MessageReadUpdate {
        message_id: MessageId,
        user_id: UserId,
        #[serde(with = "time::serde::rfc3339")]
        read_at: OffsetDateTime,
    },

    UserTyping { user_id: UserId, room_id: RoomId },

    /// Opaque application signal from another participant
    CustomEvent {
        room_id: RoomId,
        sender_id: UserId,
        event: String,
        payload: Value,
    },

    /// Liveness probe; must be answered with `heartbeat_ack`
    Heartbeat,

    /// A rejected frame; `message_id` names the message a rejected
    /// `withdraw_message` or `message_read` referred to
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::JoinSuccess { .. } => "join_success",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::MessageWithdrawn { .. } => "message_withdrawn",
            ServerEvent::MessageReadUpdate { .. } => "message_read_update",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::CustomEvent { .. } => "custom_event",
            ServerEvent::Heartbeat => "heartbeat",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            message_id: None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<&Message> for ServerEvent {
    fn from(message: &Message) -> Self {
        ServerEvent::NewMessage {
            durable_id: message.id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            internal: message.internal,
            timestamp: message.created_at,
        }
    }
}

// =============================================================================
// Out-of-band Notifications
// =============================================================================

/// Events pushed on a user's long-lived notification channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A message arrived in a room the user is interested in but not live in
    NewMessage {
        room_id: RoomId,
        message_id: MessageId,
        sender_id: UserId,
        preview: String,
        internal: bool,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
}

impl NotificationEvent {
    /// Convert event to SSE data string
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Get the SSE event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            NotificationEvent::NewMessage { .. } => "new_message",
        }
    }

    pub fn is_internal(&self) -> bool {
        match self {
            NotificationEvent::NewMessage { internal, .. } => *internal,
        }
    }
}

impl From<&Message> for NotificationEvent {
    fn from(message: &Message) -> Self {
        NotificationEvent::NewMessage {
            room_id: message.room_id,
            message_id: message.id,
            sender_id: message.sender_id,
            preview: message.content.chars().take(PREVIEW_CHARS).collect(),
            internal: message.internal,
            timestamp: message.created_at,
        }
    }
}
