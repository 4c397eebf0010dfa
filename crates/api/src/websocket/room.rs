//! Ticket room registry
//!
//! Maps each ticket room to its live sessions and a role index derived from
//! them. The registry is the single writer of room membership. All mutations
//! go through one lock, so join/leave/broadcast on a room are linearized.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use deskline_shared::{Role, RoomId, ServerEvent, SessionId, UserId};

use super::connection::Connection;
use super::relay::PresenceRelay;

/// Which sessions in a room may receive an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    /// Only staff-side roles (internal notes)
    StaffOnly,
}

impl Audience {
    pub fn for_internal(internal: bool) -> Self {
        if internal {
            Audience::StaffOnly
        } else {
            Audience::Everyone
        }
    }

    fn admits(&self, role: Role) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::StaffOnly => role.is_staff_side(),
        }
    }
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Role index entry: a user may hold several sessions in one room
#[derive(Debug, Clone, Copy)]
struct RoleEntry {
    role: Role,
    sessions: usize,
}

/// The broadcast domain for one ticket
struct Room {
    sessions: HashMap<SessionId, Arc<Connection>>,
    roles: HashMap<UserId, RoleEntry>,
    /// Serializes id assignment and broadcast so per-room order equals receive order
    sequencer: Arc<Mutex<()>>,
}

impl Room {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            roles: HashMap::new(),
            sequencer: Arc::new(Mutex::new(())),
        }
    }

    fn insert(&mut self, conn: Arc<Connection>) {
        if self.sessions.insert(conn.session_id, Arc::clone(&conn)).is_some() {
            return;
        }
        self.roles
            .entry(conn.user_id)
            .and_modify(|entry| {
                entry.role = conn.role;
                entry.sessions += 1;
            })
            .or_insert(RoleEntry {
                role: conn.role,
                sessions: 1,
            });
    }

    fn remove(&mut self, session_id: &SessionId) -> Option<Arc<Connection>> {
        let conn = self.sessions.remove(session_id)?;
        if let Some(entry) = self.roles.get_mut(&conn.user_id) {
            entry.sessions -= 1;
            if entry.sessions == 0 {
                self.roles.remove(&conn.user_id);
            }
        }
        Some(conn)
    }

    fn send_to(
        &self,
        event: &ServerEvent,
        exclude: &[SessionId],
        audience: Audience,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for conn in self.sessions.values() {
            if exclude.contains(&conn.session_id) || !audience.admits(conn.role) {
                continue;
            }
            match conn.send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(
                        session_id = %conn.session_id,
                        "Failed to send event to connection (likely closed)"
                    );
                }
            }
        }
        report
    }
}

/// Manages ticket rooms for broadcasting events
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Room>>,
    relay: Arc<PresenceRelay>,
}

impl RoomRegistry {
    pub fn new(relay: Arc<PresenceRelay>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            relay,
        }
    }

    /// Admit a session to its room and announce it to the other sessions.
    ///
    /// Creates the room on first join and records the user as an observer of
    /// the room for offline notifications. Returns the room size after joining.
    pub async fn join(&self, conn: Arc<Connection>) -> usize {
        let room_id = conn.room_id;
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_insert_with(|| {
            tracing::debug!(room_id = %room_id, "Created ticket room");
            Room::new()
        });
        room.insert(Arc::clone(&conn));

        let announced = room.send_to(
            &ServerEvent::UserJoined {
                room_id,
                user_id: conn.user_id,
                role: conn.role,
            },
            &[conn.session_id],
            Audience::Everyone,
        );
        let room_size = room.sessions.len();
        drop(rooms);

        self.relay.mark_interested(room_id, conn.user_id, conn.role);

        tracing::debug!(
            room_id = %room_id,
            session_id = %conn.session_id,
            user_id = %conn.user_id,
            role = %conn.role,
            room_size,
            announced = announced.delivered,
            "Connection joined ticket room"
        );
        room_size
    }

    /// Remove a session from a room and announce it to the remaining sessions.
    ///
    /// Idempotent: leaving with an absent session is a no-op returning `None`.
    pub async fn leave(&self, room_id: &RoomId, session_id: &SessionId) -> Option<Arc<Connection>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let conn = room.remove(session_id)?;

        if room.roles.is_empty() {
            rooms.remove(room_id);
            tracing::debug!(room_id = %room_id, "Removed empty ticket room");
        } else {
            room.send_to(
                &ServerEvent::UserLeft {
                    room_id: *room_id,
                    user_id: conn.user_id,
                },
                &[],
                Audience::Everyone,
            );
            tracing::debug!(
                room_id = %room_id,
                session_id = %session_id,
                room_size = room.sessions.len(),
                "Connection left ticket room"
            );
        }
        Some(conn)
    }

    /// Broadcast an event to every live session in a room except `exclude`
    ///
    /// Silently ignores send errors (closed connections will be cleaned up)
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        event: ServerEvent,
        exclude: &[SessionId],
    ) -> BroadcastReport {
        self.broadcast_to(room_id, event, exclude, Audience::Everyone)
            .await
    }

    /// Broadcast restricted to an audience
    pub async fn broadcast_to(
        &self,
        room_id: &RoomId,
        event: ServerEvent,
        exclude: &[SessionId],
        audience: Audience,
    ) -> BroadcastReport {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return BroadcastReport::default();
        };
        let report = room.send_to(&event, exclude, audience);

        tracing::debug!(
            room_id = %room_id,
            event_type = event.kind(),
            recipients = report.delivered,
            failed = report.failed,
            "Broadcast event to ticket room"
        );
        report
    }

    /// Whether any live session in the room holds `role`
    pub async fn has_role(&self, room_id: &RoomId, role: Role) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .is_some_and(|room| room.roles.values().any(|e| e.role == role))
    }

    /// Users live in the room under `role`
    pub async fn users_with_role(&self, room_id: &RoomId, role: Role) -> Vec<UserId> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| {
                room.roles
                    .iter()
                    .filter(|(_, e)| e.role == role)
                    .map(|(user_id, _)| *user_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Users with at least one live session in the room
    pub async fn live_users(&self, room_id: &RoomId) -> HashSet<UserId> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.roles.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Per-room lock under which accepted messages are numbered and broadcast
    pub async fn sequencer(&self, room_id: &RoomId) -> Option<Arc<Mutex<()>>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|room| Arc::clone(&room.sequencer))
    }

    /// Get room size (number of sessions) for a ticket
    pub async fn get_room_size(&self, room_id: &RoomId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|r| r.sessions.len()).unwrap_or(0)
    }

    /// Get total number of active rooms
    pub async fn get_room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}
