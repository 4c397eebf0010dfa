//! Storage collaborator for ticket chat
//!
//! The messaging backbone never touches persistence directly; it goes through
//! [`ChatStore`]. Two implementations are provided:
//!
//! - [`MemoryStore`]: process-local, used when no database is configured and in tests
//! - [`PgStore`]: Postgres via sqlx

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use deskline_shared::{Message, MessageId, Role, RoomId, UserId};
use futures::future::BoxFuture;
use time::OffsetDateTime;

/// A message that has been received but not yet assigned a durable ID
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub internal: bool,
}

/// Persistence operations consumed by the messaging backbone
pub trait ChatStore: Send + Sync {
    /// Whether a user may join a ticket room. Staff-side roles are always admitted.
    fn can_access(&self, room_id: RoomId, user_id: UserId, role: Role)
        -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Durably store a message and assign its ID
    fn save_message(&self, message: NewMessage) -> BoxFuture<'_, Result<Message, StoreError>>;

    fn get_message(&self, message_id: MessageId) -> BoxFuture<'_, Result<Option<Message>, StoreError>>;

    /// Upsert a read receipt. Returns `true` only when the receipt is new.
    fn save_read_receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
        read_at: OffsetDateTime,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Mark a message withdrawn. Returns `true` only when the flag changed.
    fn save_withdrawal(&self, message_id: MessageId) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Connectivity check for health probes
    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}
