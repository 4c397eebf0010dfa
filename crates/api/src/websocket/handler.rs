//! WebSocket handler for Axum
//!
//! Authenticates the upgrade request, admits the session to its ticket room,
//! then runs three things for the life of the socket: a writer task draining
//! the session's outbound queue, the heartbeat supervisor, and the reader loop
//! dispatching client frames.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitStream, StreamExt},
    SinkExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use deskline_shared::{ClientEvent, ProtocolError, RoomId, ServerEvent};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

use super::{
    connection::Connection,
    heartbeat::{HeartbeatHandle, HeartbeatOutcome, HeartbeatSupervisor},
    reconcile::ReconcileError,
    state::WebSocketState,
};

/// How long the writer may take to flush and send a close frame
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// JSON framing allowance on top of the content limit
const FRAME_OVERHEAD_BYTES: usize = 4 * 1024;

/// Frames read ahead of dispatch before reading pauses
const INBOUND_BACKLOG: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: String,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    WriterClosed,
    ProtocolErrors,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::WriterClosed => "writer_closed",
            CloseReason::ProtocolErrors => "protocol_errors",
        }
    }
}

/// WebSocket handler - upgrades HTTP connection to WebSocket.
///
/// Authenticates via the `token` query parameter and checks ticket access
/// before upgrading, so a rejected client gets a plain HTTP error.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, ApiError> {
    let principal = app_state.jwt.authenticate(&params.token)?;
    let room_id = RoomId(room_id);

    let allowed = app_state
        .store
        .can_access(room_id, principal.user_id, principal.role)
        .await?;
    if !allowed {
        tracing::warn!(
            user_id = %principal.user_id,
            room_id = %room_id,
            role = %principal.role,
            "WebSocket admission denied"
        );
        return Err(ApiError::Forbidden);
    }

    tracing::info!(
        user_id = %principal.user_id,
        room_id = %room_id,
        "WebSocket connection upgrade requested"
    );

    let ws_state = app_state.ws_state.clone();
    let max_frame = ws_state.settings.max_message_bytes * 2 + FRAME_OVERHEAD_BYTES;
    Ok(ws
        .max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, principal, room_id, ws_state)))
}

/// Handle individual WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    principal: Principal,
    room_id: RoomId,
    ws_state: WebSocketState,
) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending events to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn = Arc::new(Connection::new(
        room_id,
        principal.user_id,
        principal.role,
        tx,
    ));
    let session_id = conn.session_id;

    // Queued ahead of any room traffic
    let _ = conn.send(ServerEvent::JoinSuccess {
        session_id,
        room_id,
        user_id: conn.user_id,
        role: conn.role,
    });
    ws_state.add_connection(Arc::clone(&conn)).await;

    // Spawn task to send messages to client
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        return; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize WebSocket event");
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let (supervisor, heartbeat) = HeartbeatSupervisor::new(ws_state.settings.heartbeat);

    let reason = tokio::select! {
        outcome = supervisor.run(&conn) => match outcome {
            HeartbeatOutcome::TimedOut => CloseReason::HeartbeatTimeout,
            HeartbeatOutcome::ConnectionClosed => CloseReason::WriterClosed,
        },
        reason = receive_loop(&mut receiver, &conn, &ws_state, &heartbeat) => reason,
    };

    // Cleanup on disconnect
    tracing::info!(
        session_id = %session_id,
        user_id = %conn.user_id,
        room_id = %room_id,
        reason = reason.as_str(),
        "WebSocket connection closing"
    );
    ws_state.remove_connection(&session_id).await;
    drop(conn);

    // The writer exits once the last handle to the session is gone
    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

/// Frames read off the socket, in arrival order
enum Inbound {
    Event(ClientEvent),
    Invalid(ProtocolError),
    Closed(CloseReason),
}

/// Read and dispatch client frames until the socket closes or the session
/// misbehaves.
///
/// Reading runs alongside dispatch so a `heartbeat_ack` is recorded even while
/// an earlier frame waits on its room's sequencer or the store. Everything
/// else is dispatched in order; at most `INBOUND_BACKLOG` frames wait.
async fn receive_loop(
    receiver: &mut SplitStream<WebSocket>,
    conn: &Arc<Connection>,
    ws_state: &WebSocketState,
    heartbeat: &HeartbeatHandle,
) -> CloseReason {
    let (frames_tx, frames_rx) = mpsc::channel(INBOUND_BACKLOG);

    let pump = read_frames(receiver, conn, heartbeat, frames_tx);
    let dispatch = dispatch_frames(frames_rx, conn, ws_state);
    tokio::pin!(pump, dispatch);

    tokio::select! {
        reason = &mut dispatch => reason,
        // Frames read before the close are still dispatched
        () = &mut pump => dispatch.await,
    }
}

async fn read_frames(
    receiver: &mut SplitStream<WebSocket>,
    conn: &Connection,
    heartbeat: &HeartbeatHandle,
    frames: mpsc::Sender<Inbound>,
) {
    let closed = loop {
        let Some(msg) = receiver.next().await else {
            break CloseReason::ClientClosed;
        };
        let inbound = match msg {
            Ok(Message::Text(text)) => match ClientEvent::from_json(&text) {
                Ok(ClientEvent::HeartbeatAck) => {
                    heartbeat.record_ack();
                    continue;
                }
                Ok(event) => Inbound::Event(event),
                Err(e) => {
                    tracing::warn!(
                        session_id = %conn.session_id,
                        error = %e,
                        "Failed to parse client event"
                    );
                    Inbound::Invalid(e)
                }
            },
            Ok(Message::Binary(_)) => Inbound::Invalid(ProtocolError::Malformed(
                "binary frames are not supported".to_string(),
            )),
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = %conn.session_id, "WebSocket close frame received");
                break CloseReason::ClientClosed;
            }
            // Axum handles ping/pong automatically
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => {
                tracing::debug!(session_id = %conn.session_id, error = %e, "WebSocket read failed");
                break CloseReason::TransportError;
            }
        };
        if frames.send(inbound).await.is_err() {
            return;
        }
    };
    let _ = frames.send(Inbound::Closed(closed)).await;
}

async fn dispatch_frames(
    mut frames: mpsc::Receiver<Inbound>,
    conn: &Arc<Connection>,
    ws_state: &WebSocketState,
) -> CloseReason {
    let limit = ws_state.settings.protocol_error_limit.max(1);
    let mut protocol_errors: u32 = 0;

    while let Some(inbound) = frames.recv().await {
        let (subject, result) = match inbound {
            Inbound::Event(event) => (
                event.subject(),
                handle_client_event(event, conn, ws_state).await,
            ),
            Inbound::Invalid(err) => (None, Err(err.into())),
            Inbound::Closed(reason) => return reason,
        };

        match result {
            Ok(()) => protocol_errors = 0,
            Err(err) => {
                let _ = conn.send(ServerEvent::Error {
                    message: err.client_message(),
                    message_id: subject,
                });
                if !err.is_protocol_violation() {
                    protocol_errors = 0;
                    continue;
                }
                protocol_errors += 1;
                if protocol_errors >= limit {
                    tracing::warn!(
                        session_id = %conn.session_id,
                        user_id = %conn.user_id,
                        protocol_errors,
                        "Closing session after repeated protocol errors"
                    );
                    return CloseReason::ProtocolErrors;
                }
            }
        }
    }

    CloseReason::ClientClosed
}

/// Handle client event
async fn handle_client_event(
    event: ClientEvent,
    conn: &Arc<Connection>,
    ws_state: &WebSocketState,
) -> Result<(), ReconcileError> {
    match event {
        ClientEvent::Message {
            room_id,
            temp_id,
            content,
            internal,
        } => {
            ws_state
                .reconciler
                .accept_message(conn, room_id, temp_id, content, internal)
                .await?;
        }

        ClientEvent::Typing { room_id } => {
            if room_id != conn.room_id {
                return Err(ProtocolError::RoomMismatch.into());
            }
            ws_state
                .rooms
                .broadcast(
                    &room_id,
                    ServerEvent::UserTyping {
                        user_id: conn.user_id,
                        room_id,
                    },
                    &[conn.session_id],
                )
                .await;
        }

        ClientEvent::MessageRead {
            message_id,
            read_at,
        } => {
            ws_state
                .reconciler
                .mark_read(conn, message_id, read_at)
                .await?;
        }

        ClientEvent::WithdrawMessage {
            message_id,
            room_id,
        } => {
            ws_state
                .reconciler
                .withdraw(conn, message_id, room_id)
                .await?;
        }

        // Acks are recorded as they are read; liveness is judged by acks to
        // server probes only
        ClientEvent::Heartbeat | ClientEvent::HeartbeatAck => {
            tracing::trace!(session_id = %conn.session_id, "Client heartbeat received");
        }

        ClientEvent::Custom { event, payload } => {
            let report = ws_state
                .rooms
                .broadcast(
                    &conn.room_id,
                    ServerEvent::CustomEvent {
                        room_id: conn.room_id,
                        sender_id: conn.user_id,
                        event,
                        payload,
                    },
                    &[conn.session_id],
                )
                .await;
            tracing::debug!(
                session_id = %conn.session_id,
                recipients = report.delivered,
                "Relayed custom event"
            );
        }
    }

    Ok(())
}
