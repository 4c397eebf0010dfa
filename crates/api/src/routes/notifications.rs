//! Per-user notification stream
//!
//! `GET /api/v1/notifications/stream?token=..` opens a server-sent-events
//! stream that the presence relay uses to reach a user who has no live
//! session in a ticket room.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use deskline_shared::{NotificationEvent, UserId};

use crate::error::ApiResult;
use crate::state::AppState;
use crate::websocket::relay::{ChannelRegistration, PresenceRelay};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    token: String,
}

/// SSE body bound to one relay registration; dropping it unregisters
pub struct NotificationStream {
    inner: UnboundedReceiverStream<NotificationEvent>,
    relay: Arc<PresenceRelay>,
    user_id: UserId,
    registration: ChannelRegistration,
}

impl Stream for NotificationStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|event| {
            event.map(|event| {
                Ok(Event::default()
                    .event(event.event_type())
                    .data(event.to_sse_data()))
            })
        })
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        // A newer stream for the same user may already have replaced this one
        self.relay
            .unregister_if_current(&self.user_id, self.registration);
    }
}

/// Open the caller's notification stream
pub async fn notification_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamQuery>,
) -> ApiResult<Sse<NotificationStream>> {
    let principal = state.jwt.authenticate(&params.token)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let relay = Arc::clone(&state.ws_state.relay);
    let registration = relay.register_user_channel(principal.user_id, tx);

    tracing::info!(user_id = %principal.user_id, "Notification stream opened");

    let stream = NotificationStream {
        inner: UnboundedReceiverStream::new(rx),
        relay,
        user_id: principal.user_id,
        registration,
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskline_shared::{MessageId, RoomId};
    use futures::StreamExt;
    use std::collections::HashSet;
    use time::OffsetDateTime;

    fn event(room_id: RoomId) -> NotificationEvent {
        NotificationEvent::NewMessage {
            room_id,
            message_id: MessageId(1),
            sender_id: UserId::new(),
            preview: "hello".to_string(),
            internal: false,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn open(relay: &Arc<PresenceRelay>, user_id: UserId) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = relay.register_user_channel(user_id, tx);
        NotificationStream {
            inner: UnboundedReceiverStream::new(rx),
            relay: Arc::clone(relay),
            user_id,
            registration,
        }
    }

    #[tokio::test]
    async fn test_stream_yields_relayed_events() {
        let relay = Arc::new(PresenceRelay::default());
        let room_id = RoomId::new();
        let user_id = UserId::new();
        relay.mark_interested(room_id, user_id, deskline_shared::Role::Customer);

        let mut stream = open(&relay, user_id);
        assert_eq!(relay.on_new_message(room_id, event(room_id), &HashSet::new()), 1);
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn test_drop_unregisters_only_own_channel() {
        let relay = Arc::new(PresenceRelay::default());
        let user_id = UserId::new();

        let first = open(&relay, user_id);
        drop(first);
        assert!(!relay.has_channel(&user_id));

        let older = open(&relay, user_id);
        let _newer = open(&relay, user_id);
        drop(older);
        assert!(relay.has_channel(&user_id), "newer stream must stay registered");
    }
}
