//! Common types used across Deskline

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ProtocolError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Room ID wrapper (one room per support ticket, so this is the ticket ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RoomId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session ID wrapper - opaque and unique per physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable message ID, assigned by the server when a message is accepted.
///
/// Never changes once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Client-chosen temporary ID for a message that has not been acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub String);

impl TempId {
    /// Generate a fresh random temp ID
    pub fn generate() -> Self {
        Self(format!("tmp-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TempId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TempId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Roles
// =============================================================================

/// Role a participant holds in a ticket room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The customer who opened the ticket (or a colleague from their org)
    Customer,
    /// Support staff member
    Staff,
    /// Platform administrator
    Admin,
    /// Automated support agent
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Staff => "staff",
            Role::Admin => "admin",
            Role::Agent => "agent",
        }
    }

    /// Staff-side roles may see internal notes and moderate messages
    pub fn is_staff_side(&self) -> bool {
        !matches!(self, Role::Customer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" | "user" => Ok(Role::Customer),
            "staff" => Ok(Role::Staff),
            "admin" | "superadmin" => Ok(Role::Admin),
            "agent" | "ai" => Ok(Role::Agent),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

// =============================================================================
// Durable Records
// =============================================================================

/// A durable chat entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub internal: bool,
    pub withdrawn: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One user's acknowledgement of having seen one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("staff".parse::<Role>().unwrap(), Role::Staff);
        assert_eq!("superadmin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("ai".parse::<Role>().unwrap(), Role::Agent);
        assert!(matches!(
            "janitor".parse::<Role>(),
            Err(ProtocolError::UnknownRole(r)) if r == "janitor"
        ));
    }

    #[test]
    fn test_staff_side_roles() {
        assert!(!Role::Customer.is_staff_side());
        assert!(Role::Agent.is_staff_side());
        assert!(Role::Admin.is_staff_side());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&MessageId(42)).unwrap();
        assert_eq!(json, "42");

        let json = serde_json::to_string(&TempId::from("tmp-1")).unwrap();
        assert_eq!(json, r#""tmp-1""#);
    }
}
