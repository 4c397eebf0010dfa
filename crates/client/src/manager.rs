//! Client connection manager
//!
//! One actor task per ticket view owns the transport session, the pending
//! send table and the local message view; the application talks to it through
//! a cloneable [`ConnectionHandle`].
//!
//! State machine: `Idle -> Connecting -> Open -> (Closing) -> Closed`, with
//! `Closed -> Connecting` driven by the reconnect policy: a fixed
//! `reconnect_interval` between attempts, at most `max_reconnect_attempts`
//! consecutive failures, then the terminal `Disconnected` state.
//!
//! Withdrawals and read receipts are accepted in any state. What a closed
//! session could not carry is written to the next one as soon as it opens.

use std::sync::Arc;

use deskline_shared::{
    ClientEvent, MessageId, RoomId, ServerEvent, TempId, UserId,
};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::local::{Applied, LocalChange, LocalMessage, LocalMessages, Withdrawal};
use crate::outbox::{Intent, Outbox};
use crate::pending::{PendingSends, SendCompletion};
use crate::throttle::TypingThrottle;
use crate::transport::{Connector, TransportSession, TungsteniteConnector};

/// Connection lifecycle as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    /// Terminal: the reconnect budget is spent
    Disconnected { attempts: u32 },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// Everything the manager reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// A server frame not consumed by the manager itself
    Event(ServerEvent),
    State(ConnectionState),
    /// `message_sent` for a send that had already timed out
    LateAck { temp_id: TempId, durable_id: MessageId },
    /// An explicit `error` frame
    Error(ClientError),
    /// Terminal: no further reconnects will be attempted
    Disconnected { attempts: u32 },
}

enum Command {
    Send {
        temp_id: TempId,
        content: String,
        internal: bool,
        reply: SendCompletion,
    },
    Typing,
    ReadReceipt {
        message_id: MessageId,
    },
    Withdraw {
        message_id: MessageId,
    },
    Custom {
        event: String,
        payload: Value,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LocalMessage>>,
    },
}

/// Application-side handle to a connection manager
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Send a chat message and wait for its durable ID.
    ///
    /// Rejects immediately with [`ClientError::NotOpen`] when the session is
    /// not open; nothing is registered or transmitted in that case. Never
    /// retried: a failed send is the caller's to repeat as a new attempt.
    pub async fn send(
        &self,
        temp_id: TempId,
        content: impl Into<String>,
        internal: bool,
    ) -> Result<MessageId, ClientError> {
        let (reply, result) = oneshot::channel();
        let command = Command::Send {
            temp_id,
            content: content.into(),
            internal,
            reply,
        };
        if self.commands.send(command).is_err() {
            return Err(self.stopped_error());
        }
        result.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Best-effort typing notification, throttled by the manager
    pub fn send_typing(&self) {
        let _ = self.commands.send(Command::Typing);
    }

    /// Mark a message read locally, then tell the server once a session is
    /// open
    pub fn send_read_receipt(&self, message_id: MessageId) {
        let _ = self.commands.send(Command::ReadReceipt { message_id });
    }

    /// Hide a message locally, then ask the server to withdraw it.
    ///
    /// The local entry keeps its content until the server confirms, and is
    /// restored if the server refuses.
    pub fn withdraw(&self, message_id: MessageId) {
        let _ = self.commands.send(Command::Withdraw { message_id });
    }

    /// Forward an application-defined event to the room
    pub fn send_custom(&self, event: impl Into<String>, payload: Value) {
        let _ = self.commands.send(Command::Custom {
            event: event.into(),
            payload,
        });
    }

    /// Current local view of the room's messages
    pub async fn local_messages(&self) -> Vec<LocalMessage> {
        let (reply, result) = oneshot::channel();
        if self.commands.send(Command::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        result.await.unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut state = self.state.clone();
        if let Ok(current) = state.wait_for(predicate).await {
            return *current;
        }
        // The manager is gone; its last state is final
        let last = *state.borrow();
        last
    }

    /// Tear the manager down; outstanding sends are rejected with
    /// [`ClientError::Shutdown`]
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn stopped_error(&self) -> ClientError {
        match *self.state.borrow() {
            ConnectionState::Disconnected { attempts } => ClientError::ReconnectExhausted { attempts },
            _ => ClientError::Shutdown,
        }
    }
}

/// How a session ended
enum SessionEnd {
    Lost,
    Shutdown,
}

/// The actor behind a [`ConnectionHandle`]
pub struct ConnectionManager {
    config: ClientConfig,
    room_id: RoomId,
    url: String,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    notices: mpsc::UnboundedSender<ClientNotice>,
    cancel: CancellationToken,
    user_id: Option<UserId>,
    pending: PendingSends,
    local: LocalMessages,
    outbox: Outbox,
    typing: TypingThrottle,
}

impl ConnectionManager {
    /// Connect to a room over a real websocket
    pub fn connect(
        config: ClientConfig,
        room_id: RoomId,
        token: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ClientNotice>) {
        let connector = Arc::new(TungsteniteConnector::new(config.outbound_buffer));
        Self::spawn(config, room_id, token, connector)
    }

    /// Start the manager task with a custom connector
    pub fn spawn(
        config: ClientConfig,
        room_id: RoomId,
        token: &str,
        connector: Arc<dyn Connector>,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ClientNotice>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let manager = Self {
            url: config.ws_url(room_id, token),
            typing: TypingThrottle::new(config.typing_throttle),
            config,
            room_id,
            connector,
            commands: command_rx,
            state: state_tx,
            notices: notice_tx,
            cancel: cancel.clone(),
            user_id: None,
            pending: PendingSends::new(),
            local: LocalMessages::new(),
            outbox: Outbox::new(),
        };
        tokio::spawn(manager.run());

        (
            ConnectionHandle {
                commands: command_tx,
                state: state_rx,
                cancel,
            },
            notice_rx,
        )
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(room_id = %self.room_id, ?previous, ?state, "Connection state changed");
            self.notify(ClientNotice::State(state));
        }
    }

    fn notify(&self, notice: ClientNotice) {
        // The application may have stopped listening
        let _ = self.notices.send(notice);
    }

    async fn run(mut self) {
        // Consecutive failed attempts since the last open session
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            let connect = self.connector.connect(self.url.clone());
            let Some(result) = self.until_ready(connect).await else {
                break;
            };

            match result {
                Ok(session) => {
                    failures = 0;
                    self.typing.reset();
                    self.set_state(ConnectionState::Open);
                    tracing::info!(room_id = %self.room_id, "Connected");

                    let end = self.run_session(session).await;
                    self.outbox.session_lost();
                    let rejected = self.pending.reject_all(match end {
                        SessionEnd::Lost => ClientError::ConnectionClosed,
                        SessionEnd::Shutdown => ClientError::Shutdown,
                    });
                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                    tracing::warn!(room_id = %self.room_id, rejected, "Connection lost");
                    self.set_state(ConnectionState::Closed);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        room_id = %self.room_id,
                        error = %e,
                        attempt = failures,
                        "Connection attempt failed"
                    );
                    self.set_state(ConnectionState::Closed);
                }
            }

            if failures >= self.config.max_reconnect_attempts {
                tracing::warn!(room_id = %self.room_id, attempts = failures, "Giving up reconnecting");
                self.set_state(ConnectionState::Disconnected { attempts: failures });
                self.notify(ClientNotice::Disconnected { attempts: failures });
                return;
            }

            tracing::info!(
                room_id = %self.room_id,
                delay = ?self.config.reconnect_interval,
                attempt = failures + 1,
                "Reconnecting"
            );
            let delay = tokio::time::sleep(self.config.reconnect_interval);
            if self.until_ready(delay).await.is_none() {
                break;
            }
        }

        self.pending.reject_all(ClientError::Shutdown);
        self.set_state(ConnectionState::Closed);
        tracing::debug!(room_id = %self.room_id, "Connection manager stopped");
    }

    /// Drive `future` while serving commands for a closed session.
    ///
    /// Returns `None` on shutdown.
    async fn until_ready<F: std::future::Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                output = &mut future => return Some(output),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_offline_command(command),
                    None => return None,
                },
            }
        }
    }

    fn handle_offline_command(&mut self, command: Command) {
        match command {
            Command::Send { temp_id, reply, .. } => {
                tracing::debug!(temp_id = %temp_id, "Send rejected, connection not open");
                let _ = reply.send(Err(ClientError::NotOpen));
            }
            Command::ReadReceipt { message_id } => self.request_read(message_id),
            Command::Withdraw { message_id } => self.request_withdrawal(message_id),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.local.snapshot());
            }
            Command::Typing | Command::Custom { .. } => {}
        }
    }

    async fn run_session(&mut self, session: TransportSession) -> SessionEnd {
        let TransportSession {
            outbound,
            mut inbound,
        } = session;

        if self.flush_outbox(&outbound).is_err() {
            return SessionEnd::Lost;
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.pending.next_deadline();
            let flow = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command, &outbound),
                    None => {
                        self.set_state(ConnectionState::Closing);
                        return SessionEnd::Shutdown;
                    }
                },
                frame = inbound.recv() => match frame {
                    Some(text) => self.handle_frame(&text, &outbound),
                    None => Err(ClientError::ConnectionClosed),
                },
                _ = heartbeat.tick() => transmit_best_effort(&outbound, &ClientEvent::Heartbeat)
                    .and_then(|()| self.flush_outbox(&outbound)),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_sends();
                    Ok(())
                }
            };

            if let Err(e) = flow {
                tracing::debug!(room_id = %self.room_id, error = %e, "Session ended");
                return SessionEnd::Lost;
            }
        }
    }

    /// Apply a read locally and owe the server the receipt
    fn request_read(&mut self, message_id: MessageId) {
        if let Some(user_id) = self.user_id {
            let applied = self.local.apply_optimistic(LocalChange::Read {
                message_id,
                user_id,
            });
            if applied == Applied::Unchanged {
                return;
            }
        }
        self.outbox.queue_read(message_id);
    }

    /// Hide a message locally and owe the server the withdrawal
    fn request_withdrawal(&mut self, message_id: MessageId) {
        let confirmed = self
            .local
            .get(message_id)
            .is_some_and(|m| m.withdrawal == Some(Withdrawal::Confirmed));
        if confirmed {
            return;
        }
        self.local
            .apply_optimistic(LocalChange::Withdraw { message_id });
        self.outbox.queue_withdrawal(message_id);
    }

    /// Write every owed withdrawal and read receipt to the session
    fn flush_outbox(&mut self, outbound: &mpsc::Sender<String>) -> Result<(), ClientError> {
        if !self.outbox.has_unsent() {
            return Ok(());
        }

        let mut intents = self.outbox.take_unsent().into_iter();
        while let Some(intent) = intents.next() {
            let frame = match intent {
                Intent::Withdraw(message_id) => ClientEvent::WithdrawMessage {
                    message_id,
                    room_id: self.room_id,
                },
                Intent::Read(message_id) => ClientEvent::MessageRead {
                    message_id,
                    read_at: OffsetDateTime::now_utc(),
                },
            };
            if let Err(e) = transmit(outbound, &frame) {
                self.outbox.requeue(intent);
                for rest in intents.by_ref() {
                    self.outbox.requeue(rest);
                }
                tracing::debug!(room_id = %self.room_id, error = %e, "Deferred withdrawals and read receipts");
                return match e {
                    ClientError::ConnectionClosed => Err(e),
                    _ => Ok(()),
                };
            }
        }
        Ok(())
    }

    /// The server refused a withdrawal or read receipt for `message_id`
    fn roll_back(&mut self, message_id: MessageId) {
        if self.outbox.settle_withdrawal(message_id) {
            self.local
                .apply_optimistic(LocalChange::RevertWithdraw { message_id });
        } else if let Some(user_id) = self.user_id {
            self.local.apply_optimistic(LocalChange::RevertRead {
                message_id,
                user_id,
            });
        }
    }

    fn expire_sends(&mut self) {
        for temp_id in self.pending.expire_due(Instant::now()) {
            tracing::warn!(room_id = %self.room_id, temp_id = %temp_id, "Send timed out");
        }
    }

    /// Returns an error only when the session is unusable
    fn handle_command(
        &mut self,
        command: Command,
        outbound: &mpsc::Sender<String>,
    ) -> Result<(), ClientError> {
        match command {
            Command::Send {
                temp_id,
                content,
                internal,
                reply,
            } => {
                let deadline = Instant::now() + self.config.send_timeout;
                if let Err(reply) = self.pending.insert(temp_id.clone(), deadline, reply) {
                    let _ = reply.send(Err(ClientError::Protocol(format!(
                        "temp id {temp_id} is already in flight"
                    ))));
                    return Ok(());
                }

                self.local.apply_optimistic(LocalChange::Compose {
                    temp_id: temp_id.clone(),
                    sender_id: self.user_id,
                    content: content.clone(),
                    internal,
                });

                let frame = ClientEvent::Message {
                    room_id: self.room_id,
                    temp_id: temp_id.clone(),
                    content,
                    internal,
                };
                if let Err(e) = transmit(outbound, &frame) {
                    self.pending.reject(&temp_id, e.clone());
                    self.local.apply_optimistic(LocalChange::Fail { temp_id });
                    if e == ClientError::ConnectionClosed {
                        return Err(e);
                    }
                }
                Ok(())
            }

            Command::Typing => {
                if self.typing.try_acquire(Instant::now()) {
                    // Never queued, never retried
                    let _ = transmit(
                        outbound,
                        &ClientEvent::Typing {
                            room_id: self.room_id,
                        },
                    );
                }
                Ok(())
            }

            Command::ReadReceipt { message_id } => {
                self.request_read(message_id);
                self.flush_outbox(outbound)
            }

            Command::Withdraw { message_id } => {
                self.request_withdrawal(message_id);
                self.flush_outbox(outbound)
            }

            Command::Custom { event, payload } => {
                transmit_best_effort(outbound, &ClientEvent::Custom { event, payload })
            }

            Command::Snapshot { reply } => {
                let _ = reply.send(self.local.snapshot());
                Ok(())
            }
        }
    }

    /// Returns an error only when the session is unusable
    fn handle_frame(&mut self, text: &str, outbound: &mpsc::Sender<String>) -> Result<(), ClientError> {
        let event = match ServerEvent::from_json(text) {
            Ok(event) => event,
            Err(e) => {
                // Dropped; a bad frame does not end the session
                tracing::warn!(room_id = %self.room_id, error = %e, "Failed to parse server event");
                return Ok(());
            }
        };

        match event {
            ServerEvent::Heartbeat => {
                tracing::trace!(room_id = %self.room_id, "Heartbeat probe received");
                return transmit_best_effort(outbound, &ClientEvent::HeartbeatAck);
            }

            ServerEvent::MessageSent {
                temp_id,
                durable_id,
            } => {
                self.local.apply_optimistic(LocalChange::Acknowledge {
                    temp_id: temp_id.clone(),
                    durable_id,
                });
                if !self.pending.resolve(&temp_id, durable_id) {
                    // The message is durable; the late ack is authoritative
                    tracing::info!(
                        room_id = %self.room_id,
                        temp_id = %temp_id,
                        durable_id = %durable_id,
                        "Reconciled late acknowledgement"
                    );
                    self.notify(ClientNotice::LateAck {
                        temp_id,
                        durable_id,
                    });
                }
                return Ok(());
            }

            ServerEvent::Error {
                ref message,
                message_id,
            } => {
                if let Some(message_id) = message_id {
                    self.roll_back(message_id);
                }
                tracing::warn!(room_id = %self.room_id, message = %message, "Server reported an error");
                self.notify(ClientNotice::Error(ClientError::Server {
                    message: message.clone(),
                }));
                return Ok(());
            }

            ServerEvent::JoinSuccess { user_id, .. } => {
                self.user_id = Some(user_id);
            }

            ServerEvent::NewMessage {
                durable_id,
                sender_id,
                ref content,
                internal,
                ..
            } => {
                self.local.apply_optimistic(LocalChange::Remote {
                    durable_id,
                    sender_id,
                    content: content.clone(),
                    internal,
                });
            }

            ServerEvent::MessageWithdrawn { message_id, .. } => {
                self.outbox.settle_withdrawal(message_id);
                self.local
                    .apply_optimistic(LocalChange::ConfirmWithdraw { message_id });
            }

            ServerEvent::MessageReadUpdate {
                message_id,
                user_id,
                ..
            } => {
                self.local.apply_optimistic(LocalChange::Read {
                    message_id,
                    user_id,
                });
            }

            ServerEvent::UserJoined { .. }
            | ServerEvent::UserLeft { .. }
            | ServerEvent::UserTyping { .. }
            | ServerEvent::CustomEvent { .. } => {}
        }

        self.notify(ClientNotice::Event(event));
        Ok(())
    }
}

/// Queue a frame without waiting; a full buffer drops the frame
fn transmit(outbound: &mpsc::Sender<String>, event: &ClientEvent) -> Result<(), ClientError> {
    let json = event.to_json()?;
    outbound.try_send(json).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => {
            ClientError::Transport("outbound buffer full".to_string())
        }
        mpsc::error::TrySendError::Closed(_) => ClientError::ConnectionClosed,
    })
}

/// Like [`transmit`], but only a closed session is an error
fn transmit_best_effort(outbound: &mpsc::Sender<String>, event: &ClientEvent) -> Result<(), ClientError> {
    match transmit(outbound, event) {
        Err(ClientError::ConnectionClosed) => Err(ClientError::ConnectionClosed),
        Err(e) => {
            tracing::debug!(kind = event.kind(), error = %e, "Frame dropped");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
