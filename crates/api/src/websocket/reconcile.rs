//! Server half of message reconciliation
//!
//! Turns client frames into durable state and fans the result out:
//!
//! - `message` is stored, broadcast to the room as `new_message` (sender
//!   excluded), acked to the sender as `message_sent`, then relayed to
//!   interested users who have no live session
//! - `withdraw_message` and `message_read` are idempotent; only the first
//!   application that changes state is broadcast. Every accepted withdrawal,
//!   repeated or not, is confirmed to the acting session
//!
//! Message numbering and the room broadcast happen under the room's
//! sequencer, so every session observes one room's messages in the order
//! the server received them.

use std::sync::Arc;

use deskline_shared::{
    MessageId, NotificationEvent, ProtocolError, RoomId, ServerEvent, TempId,
};
use time::OffsetDateTime;

use super::connection::Connection;
use super::relay::PresenceRelay;
use super::room::{Audience, RoomRegistry};
use crate::store::{ChatStore, NewMessage, StoreError};

/// Errors surfaced to the acting session as an `error` frame
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ProtocolError),

    #[error("Not allowed")]
    Forbidden,

    #[error("Message not found")]
    NotFound,

    #[error("Session is not joined to a room")]
    NotJoined,

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ReconcileError::NotFound,
            other => ReconcileError::Store(other),
        }
    }
}

impl ReconcileError {
    /// Text for the `error` frame; storage details stay in the logs
    pub fn client_message(&self) -> String {
        match self {
            ReconcileError::Store(_) => "Failed to save, please retry".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the error counts against the session's protocol error budget
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ReconcileError::Validation(ProtocolError::Malformed(_) | ProtocolError::RoomMismatch)
        )
    }
}

/// Applies client mutations for all rooms
pub struct Reconciler {
    store: Arc<dyn ChatStore>,
    rooms: Arc<RoomRegistry>,
    relay: Arc<PresenceRelay>,
    max_message_bytes: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ChatStore>,
        rooms: Arc<RoomRegistry>,
        relay: Arc<PresenceRelay>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            store,
            rooms,
            relay,
            max_message_bytes,
        }
    }

    fn check_room(conn: &Connection, room_id: RoomId) -> Result<(), ReconcileError> {
        if conn.room_id != room_id {
            return Err(ProtocolError::RoomMismatch.into());
        }
        Ok(())
    }

    /// Accept a new message from `conn` and return its durable ID.
    ///
    /// The sender gets `message_sent` and never its own `new_message`.
    pub async fn accept_message(
        &self,
        conn: &Connection,
        room_id: RoomId,
        temp_id: TempId,
        content: String,
        internal: bool,
    ) -> Result<MessageId, ReconcileError> {
        Self::check_room(conn, room_id)?;

        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(ProtocolError::EmptyContent.into());
        }
        if content.len() > self.max_message_bytes {
            return Err(ProtocolError::ContentTooLarge {
                len: content.len(),
                max: self.max_message_bytes,
            }
            .into());
        }
        if internal && !conn.role.is_staff_side() {
            return Err(ReconcileError::Forbidden);
        }

        let sequencer = self
            .rooms
            .sequencer(&room_id)
            .await
            .ok_or(ReconcileError::NotJoined)?;
        let guard = sequencer.lock().await;

        let message = self
            .store
            .save_message(NewMessage {
                room_id,
                sender_id: conn.user_id,
                content,
                internal,
            })
            .await?;

        let report = self
            .rooms
            .broadcast_to(
                &room_id,
                ServerEvent::from(&message),
                &[conn.session_id],
                Audience::for_internal(message.internal),
            )
            .await;
        drop(guard);

        tracing::info!(
            room_id = %room_id,
            message_id = %message.id,
            sender_id = %conn.user_id,
            temp_id = %temp_id,
            internal = message.internal,
            recipients = report.delivered,
            "Message accepted"
        );

        // The message is durable whether or not the ack reaches the sender
        if conn
            .send(ServerEvent::MessageSent {
                temp_id,
                durable_id: message.id,
            })
            .is_err()
        {
            tracing::warn!(
                session_id = %conn.session_id,
                message_id = %message.id,
                "Sender went away before message_sent could be delivered"
            );
        }

        let mut skip = self.rooms.live_users(&room_id).await;
        skip.insert(conn.user_id);
        self.relay
            .on_new_message(room_id, NotificationEvent::from(&message), &skip);

        Ok(message.id)
    }

    /// Withdraw a message. Returns `true` when this call changed its state.
    ///
    /// Allowed for the original sender and for staff-side roles.
    pub async fn withdraw(
        &self,
        conn: &Connection,
        message_id: MessageId,
        room_id: RoomId,
    ) -> Result<bool, ReconcileError> {
        Self::check_room(conn, room_id)?;

        let message = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| m.room_id == room_id)
            .ok_or(ReconcileError::NotFound)?;

        if message.sender_id != conn.user_id && !conn.role.is_staff_side() {
            return Err(ReconcileError::Forbidden);
        }

        let changed = self.store.save_withdrawal(message_id).await?;
        let withdrawn = ServerEvent::MessageWithdrawn {
            message_id,
            room_id,
        };
        if !changed {
            tracing::debug!(message_id = %message_id, "Message already withdrawn");
            let _ = conn.send(withdrawn);
            return Ok(false);
        }

        self.rooms
            .broadcast_to(
                &room_id,
                withdrawn.clone(),
                &[conn.session_id],
                Audience::for_internal(message.internal),
            )
            .await;
        // Confirms the actor's optimistic withdrawal
        let _ = conn.send(withdrawn);

        tracing::info!(
            room_id = %room_id,
            message_id = %message_id,
            user_id = %conn.user_id,
            "Message withdrawn"
        );
        Ok(true)
    }

    /// Record a read receipt. Returns `true` when the receipt is new.
    pub async fn mark_read(
        &self,
        conn: &Connection,
        message_id: MessageId,
        read_at: OffsetDateTime,
    ) -> Result<bool, ReconcileError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| m.room_id == conn.room_id)
            .ok_or(ReconcileError::NotFound)?;

        if message.internal && !conn.role.is_staff_side() {
            return Err(ReconcileError::NotFound);
        }

        let recorded = self
            .store
            .save_read_receipt(message_id, conn.user_id, read_at)
            .await?;
        if !recorded {
            return Ok(false);
        }

        self.rooms
            .broadcast_to(
                &conn.room_id,
                ServerEvent::MessageReadUpdate {
                    message_id,
                    user_id: conn.user_id,
                    read_at,
                },
                &[conn.session_id],
                Audience::for_internal(message.internal),
            )
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use deskline_shared::{Role, UserId};
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MemoryStore>,
        rooms: Arc<RoomRegistry>,
        relay: Arc<PresenceRelay>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::permissive());
        let relay = Arc::new(PresenceRelay::default());
        let rooms = Arc::new(RoomRegistry::new(Arc::clone(&relay)));
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::clone(&rooms),
            Arc::clone(&relay),
            64,
        );
        Harness {
            store,
            rooms,
            relay,
            reconciler,
        }
    }

    async fn join(
        h: &Harness,
        room_id: RoomId,
        role: Role,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(room_id, UserId::new(), role, tx));
        h.rooms.join(Arc::clone(&conn)).await;
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_sender_gets_ack_and_peer_gets_message() {
        let h = harness();
        let room = RoomId::new();
        let (a, mut a_rx) = join(&h, room, Role::Customer).await;
        let (_b, mut b_rx) = join(&h, room, Role::Staff).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let id = h
            .reconciler
            .accept_message(&a, room, TempId::from("t1"), "hi".to_string(), false)
            .await
            .unwrap();

        let a_events = drain(&mut a_rx);
        assert_eq!(
            a_events,
            vec![ServerEvent::MessageSent {
                temp_id: TempId::from("t1"),
                durable_id: id,
            }]
        );

        let b_events = drain(&mut b_rx);
        assert_eq!(b_events.len(), 1);
        match &b_events[0] {
            ServerEvent::NewMessage {
                durable_id,
                sender_id,
                content,
                ..
            } => {
                assert_eq!(*durable_id, id);
                assert_eq!(*sender_id, a.user_id);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_messages_are_numbered_in_receive_order() {
        let h = harness();
        let room = RoomId::new();
        let (a, _a_rx) = join(&h, room, Role::Customer).await;
        let (_b, mut b_rx) = join(&h, room, Role::Staff).await;
        drain(&mut b_rx);

        let mut ids = Vec::new();
        for n in 0..5 {
            let id = h
                .reconciler
                .accept_message(&a, room, TempId::generate(), format!("m{n}"), false)
                .await
                .unwrap();
            ids.push(id);
        }

        let received: Vec<MessageId> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::NewMessage { durable_id, .. } => Some(durable_id),
                _ => None,
            })
            .collect();
        assert_eq!(received, ids);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_rejects_invalid_content() {
        let h = harness();
        let room = RoomId::new();
        let (a, _rx) = join(&h, room, Role::Customer).await;

        let empty = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "   ".to_string(), false)
            .await;
        assert!(matches!(
            empty,
            Err(ReconcileError::Validation(ProtocolError::EmptyContent))
        ));

        let large = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "x".repeat(65), false)
            .await;
        assert!(matches!(
            large,
            Err(ReconcileError::Validation(ProtocolError::ContentTooLarge { .. }))
        ));

        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_mismatch_is_protocol_violation() {
        let h = harness();
        let (a, _rx) = join(&h, RoomId::new(), Role::Customer).await;

        let err = h
            .reconciler
            .accept_message(&a, RoomId::new(), TempId::generate(), "hi".to_string(), false)
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_customer_cannot_post_internal_note() {
        let h = harness();
        let room = RoomId::new();
        let (a, _rx) = join(&h, room, Role::Customer).await;

        let result = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "psst".to_string(), true)
            .await;
        assert!(matches!(result, Err(ReconcileError::Forbidden)));
    }

    #[tokio::test]
    async fn test_internal_note_reaches_staff_only() {
        let h = harness();
        let room = RoomId::new();
        let (staff, _staff_rx) = join(&h, room, Role::Staff).await;
        let (_agent, mut agent_rx) = join(&h, room, Role::Agent).await;
        let (_customer, mut customer_rx) = join(&h, room, Role::Customer).await;
        drain(&mut agent_rx);
        drain(&mut customer_rx);

        h.reconciler
            .accept_message(&staff, room, TempId::generate(), "note".to_string(), true)
            .await
            .unwrap();

        assert_eq!(drain(&mut agent_rx).len(), 1);
        assert!(drain(&mut customer_rx).is_empty());
    }

    #[tokio::test]
    async fn test_offline_observer_is_notified() {
        let h = harness();
        let room = RoomId::new();

        // C joined once, left, and now only has a notification channel
        let (c, _c_rx) = join(&h, room, Role::Customer).await;
        h.rooms.leave(&room, &c.session_id).await;
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        h.relay.register_user_channel(c.user_id, notify_tx);

        let (a, _a_rx) = join(&h, room, Role::Staff).await;
        let (notify_a, mut a_notifications) = mpsc::unbounded_channel();
        h.relay.register_user_channel(a.user_id, notify_a);

        let id = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "update".to_string(), false)
            .await
            .unwrap();

        match notify_rx.try_recv().unwrap() {
            NotificationEvent::NewMessage { message_id, .. } => assert_eq!(message_id, id),
        }
        assert!(a_notifications.try_recv().is_err(), "sender is never relayed to");
    }

    #[tokio::test]
    async fn test_withdraw_twice_broadcasts_once() {
        let h = harness();
        let room = RoomId::new();
        let (a, _a_rx) = join(&h, room, Role::Customer).await;
        let (b, mut b_rx) = join(&h, room, Role::Staff).await;
        let (_c, mut c_rx) = join(&h, room, Role::Customer).await;

        let id = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "oops".to_string(), false)
            .await
            .unwrap();
        drain(&mut b_rx);
        drain(&mut c_rx);

        assert!(h.reconciler.withdraw(&b, id, room).await.unwrap());
        assert!(!h.reconciler.withdraw(&b, id, room).await.unwrap());

        let stored = h.store.get_message(id).await.unwrap().unwrap();
        assert!(stored.withdrawn);

        let withdrawn: Vec<_> = drain(&mut c_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageWithdrawn { .. }))
            .collect();
        assert_eq!(withdrawn.len(), 1);

        // The actor gets a confirmation per request, never the broadcast
        let confirmations = drain(&mut b_rx);
        assert_eq!(confirmations.len(), 2);
        assert!(confirmations
            .iter()
            .all(|e| *e == ServerEvent::MessageWithdrawn { message_id: id, room_id: room }));
    }

    #[tokio::test]
    async fn test_customer_cannot_withdraw_others_message() {
        let h = harness();
        let room = RoomId::new();
        let (a, _a_rx) = join(&h, room, Role::Customer).await;
        let (other, mut other_rx) = join(&h, room, Role::Customer).await;

        let id = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "mine".to_string(), false)
            .await
            .unwrap();

        let result = h.reconciler.withdraw(&other, id, room).await;
        assert!(matches!(result, Err(ReconcileError::Forbidden)));
        assert!(drain(&mut other_rx)
            .iter()
            .all(|e| !matches!(e, ServerEvent::MessageWithdrawn { .. })));
        assert!(h.reconciler.withdraw(&a, id, room).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_receipt_is_idempotent() {
        let h = harness();
        let room = RoomId::new();
        let (a, mut a_rx) = join(&h, room, Role::Customer).await;
        let (b, _b_rx) = join(&h, room, Role::Staff).await;

        let id = h
            .reconciler
            .accept_message(&a, room, TempId::generate(), "read me".to_string(), false)
            .await
            .unwrap();
        drain(&mut a_rx);

        let read_at = OffsetDateTime::now_utc();
        assert!(h.reconciler.mark_read(&b, id, read_at).await.unwrap());
        assert!(!h.reconciler.mark_read(&b, id, read_at).await.unwrap());

        let updates: Vec<_> = drain(&mut a_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageReadUpdate { .. }))
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(h.store.receipts_for(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_message_is_not_found() {
        let h = harness();
        let room = RoomId::new();
        let (a, _rx) = join(&h, room, Role::Staff).await;

        let result = h.reconciler.withdraw(&a, MessageId(999), room).await;
        assert!(matches!(result, Err(ReconcileError::NotFound)));

        let result = h
            .reconciler
            .mark_read(&a, MessageId(999), OffsetDateTime::now_utc())
            .await;
        assert!(matches!(result, Err(ReconcileError::NotFound)));
    }
}
