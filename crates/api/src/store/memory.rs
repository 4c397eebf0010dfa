//! In-memory chat store
//!
//! Durable IDs are monotonic per process, which is all the reconciliation
//! protocol requires.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use deskline_shared::{Message, MessageId, ReadReceipt, Role, RoomId, UserId};
use futures::future::BoxFuture;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{ChatStore, NewMessage, StoreError};

/// Process-local store backed by hash maps
pub struct MemoryStore {
    next_id: AtomicI64,
    messages: RwLock<HashMap<MessageId, Message>>,
    receipts: RwLock<HashMap<(MessageId, UserId), ReadReceipt>>,
    participants: RwLock<HashMap<RoomId, HashSet<UserId>>>,
    /// Admit every customer regardless of ticket membership
    permissive: bool,
}

impl MemoryStore {
    /// Store where customers must be registered ticket participants
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            messages: RwLock::new(HashMap::new()),
            receipts: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
            permissive: false,
        }
    }

    /// Store that admits every authenticated user (local development)
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::new()
        }
    }

    /// Register a customer as a participant of a ticket
    pub async fn add_participant(&self, room_id: RoomId, user_id: UserId) {
        let mut participants = self.participants.write().await;
        participants.entry(room_id).or_default().insert(user_id);
    }

    /// Read receipts recorded for a message
    pub async fn receipts_for(&self, message_id: MessageId) -> Vec<ReadReceipt> {
        let receipts = self.receipts.read().await;
        receipts
            .values()
            .filter(|r| r.message_id == message_id)
            .copied()
            .collect()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore for MemoryStore {
    fn can_access(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            if role.is_staff_side() || self.permissive {
                return Ok(true);
            }
            let participants = self.participants.read().await;
            Ok(participants
                .get(&room_id)
                .is_some_and(|users| users.contains(&user_id)))
        })
    }

    fn save_message(&self, message: NewMessage) -> BoxFuture<'_, Result<Message, StoreError>> {
        Box::pin(async move {
            let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let stored = Message {
                id,
                room_id: message.room_id,
                sender_id: message.sender_id,
                content: message.content,
                internal: message.internal,
                withdrawn: false,
                created_at: OffsetDateTime::now_utc(),
            };
            let mut messages = self.messages.write().await;
            messages.insert(id, stored.clone());
            Ok(stored)
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<Option<Message>, StoreError>> {
        Box::pin(async move {
            let messages = self.messages.read().await;
            Ok(messages.get(&message_id).cloned())
        })
    }

    fn save_read_receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
        read_at: OffsetDateTime,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            if !self.messages.read().await.contains_key(&message_id) {
                return Err(StoreError::NotFound);
            }
            let mut receipts = self.receipts.write().await;
            if receipts.contains_key(&(message_id, user_id)) {
                return Ok(false);
            }
            receipts.insert(
                (message_id, user_id),
                ReadReceipt {
                    message_id,
                    user_id,
                    read_at,
                },
            );
            Ok(true)
        })
    }

    fn save_withdrawal(&self, message_id: MessageId) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut messages = self.messages.write().await;
            let message = messages.get_mut(&message_id).ok_or(StoreError::NotFound)?;
            if message.withdrawn {
                return Ok(false);
            }
            message.withdrawn = true;
            message.content.clear();
            Ok(true)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }
}
