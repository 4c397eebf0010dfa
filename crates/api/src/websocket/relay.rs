//! Offline presence relay
//!
//! Tells users about new messages in tickets they participate in while they
//! have no live session in that ticket's room. Two pieces of state:
//!
//! - [`ObserverSet`]: room -> users interested in it. A capped, TTL'd hint
//!   cache that outlives live connections. Ticket membership itself lives in
//!   the store.
//! - User channels: user -> long-lived notification stream (SSE), registered
//!   independently of any room.
//!
//! Delivery is best-effort: users without a registered channel are skipped,
//! nothing is queued.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use deskline_shared::{NotificationEvent, Role, RoomId, UserId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Default observer TTL (3 days)
pub const DEFAULT_OBSERVER_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Default maximum number of rooms tracked
pub const DEFAULT_OBSERVER_MAX_ROOMS: usize = 10_000;

/// Observers of one room
#[derive(Clone)]
struct ObservedRoom {
    users: HashMap<UserId, Role>,
    touched_at: Instant,
}

impl ObservedRoom {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.touched_at.elapsed() > ttl
    }
}

/// Thread-safe capped TTL map of room -> interested users
pub struct ObserverSet {
    rooms: RwLock<HashMap<RoomId, ObservedRoom>>,
    ttl: Duration,
    max_rooms: usize,
}

impl ObserverSet {
    pub fn new(ttl: Duration, max_rooms: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            ttl,
            max_rooms: max_rooms.max(1),
        }
    }

    /// Add a user to a room's observers and refresh the room's TTL
    pub fn mark(&self, room_id: RoomId, user_id: UserId, role: Role) {
        if let Ok(mut rooms) = self.rooms.write() {
            let now = Instant::now();
            let ttl = self.ttl;
            let room = rooms.entry(room_id).or_insert_with(|| ObservedRoom {
                users: HashMap::new(),
                touched_at: now,
            });
            if room.is_expired(ttl) {
                room.users.clear();
            }
            room.users.insert(user_id, role);
            room.touched_at = now;

            if rooms.len() > self.max_rooms {
                Self::evict_oldest(&mut rooms, self.max_rooms);
            }
        }
    }

    fn evict_oldest(rooms: &mut HashMap<RoomId, ObservedRoom>, max_rooms: usize) {
        let excess = rooms.len().saturating_sub(max_rooms);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(RoomId, Instant)> =
            rooms.iter().map(|(id, r)| (*id, r.touched_at)).collect();
        by_age.sort_by_key(|(_, touched_at)| *touched_at);

        for (room_id, _) in by_age.into_iter().take(excess) {
            rooms.remove(&room_id);
            tracing::debug!(room_id = %room_id, "Evicted observer entry (capacity)");
        }
    }

    /// Unexpired observers of a room
    pub fn observers(&self, room_id: &RoomId) -> Vec<(UserId, Role)> {
        let Ok(rooms) = self.rooms.read() else {
            return Vec::new();
        };
        match rooms.get(room_id) {
            Some(room) if !room.is_expired(self.ttl) => {
                room.users.iter().map(|(u, r)| (*u, *r)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Clear expired entries (call periodically for memory management)
    pub fn cleanup(&self) -> usize {
        if let Ok(mut rooms) = self.rooms.write() {
            let before = rooms.len();
            rooms.retain(|_, room| !room.is_expired(self.ttl));
            before - rooms.len()
        } else {
            0
        }
    }

    pub fn stats(&self) -> ObserverStats {
        if let Ok(rooms) = self.rooms.read() {
            let expired = rooms.values().filter(|r| r.is_expired(self.ttl)).count();
            ObserverStats {
                total_rooms: rooms.len(),
                expired_rooms: expired,
                observers: rooms.values().map(|r| r.users.len()).sum(),
            }
        } else {
            ObserverStats::default()
        }
    }
}

/// Observer set statistics
#[derive(Default, Debug, Clone, serde::Serialize)]
pub struct ObserverStats {
    pub total_rooms: usize,
    pub expired_rooms: usize,
    pub observers: usize,
}

/// Identifies one registration of a user channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRegistration(Uuid);

struct UserChannel {
    registration: ChannelRegistration,
    sender: mpsc::UnboundedSender<NotificationEvent>,
}

/// Fans out new-message notifications to interested users who are not live
pub struct PresenceRelay {
    observers: ObserverSet,
    channels: RwLock<HashMap<UserId, UserChannel>>,
}

impl PresenceRelay {
    pub fn new(observer_ttl: Duration, observer_max_rooms: usize) -> Self {
        Self {
            observers: ObserverSet::new(observer_ttl, observer_max_rooms),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Bind the out-of-band channel used to reach a user.
    ///
    /// Replaces any earlier registration for the same user.
    pub fn register_user_channel(
        &self,
        user_id: UserId,
        sender: mpsc::UnboundedSender<NotificationEvent>,
    ) -> ChannelRegistration {
        let registration = ChannelRegistration(Uuid::new_v4());
        if let Ok(mut channels) = self.channels.write() {
            channels.insert(
                user_id,
                UserChannel {
                    registration,
                    sender,
                },
            );
        }
        tracing::debug!(user_id = %user_id, "Registered notification channel");
        registration
    }

    /// Unbind whatever channel is registered for a user
    pub fn unregister_user_channel(&self, user_id: &UserId) {
        if let Ok(mut channels) = self.channels.write() {
            if channels.remove(user_id).is_some() {
                tracing::debug!(user_id = %user_id, "Unregistered notification channel");
            }
        }
    }

    /// Unbind a user's channel only if it is still the given registration
    pub fn unregister_if_current(&self, user_id: &UserId, registration: ChannelRegistration) {
        if let Ok(mut channels) = self.channels.write() {
            if channels
                .get(user_id)
                .is_some_and(|c| c.registration == registration)
            {
                channels.remove(user_id);
                tracing::debug!(user_id = %user_id, "Notification channel closed");
            }
        }
    }

    pub fn has_channel(&self, user_id: &UserId) -> bool {
        self.channels
            .read()
            .map(|channels| channels.contains_key(user_id))
            .unwrap_or(false)
    }

    /// Record that a user is interested in a room's messages
    pub fn mark_interested(&self, room_id: RoomId, user_id: UserId, role: Role) {
        self.observers.mark(room_id, user_id, role);
    }

    /// Push a new-message event to every observer of the room except `skip`.
    ///
    /// Internal messages only reach staff-side observers. Returns the number of
    /// channels the event was handed to.
    pub fn on_new_message(
        &self,
        room_id: RoomId,
        event: NotificationEvent,
        skip: &HashSet<UserId>,
    ) -> usize {
        let staff_only = event.is_internal();
        let targets: Vec<UserId> = self
            .observers
            .observers(&room_id)
            .into_iter()
            .filter(|(user_id, role)| !skip.contains(user_id) && (!staff_only || role.is_staff_side()))
            .map(|(user_id, _)| user_id)
            .collect();

        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut dead = Vec::new();
        if let Ok(channels) = self.channels.read() {
            for user_id in &targets {
                let Some(channel) = channels.get(user_id) else {
                    continue;
                };
                match channel.sender.send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push((*user_id, channel.registration)),
                }
            }
        }

        for (user_id, registration) in dead {
            self.unregister_if_current(&user_id, registration);
        }

        tracing::debug!(
            room_id = %room_id,
            observers = targets.len(),
            delivered,
            "Relayed new message to offline observers"
        );
        delivered
    }

    /// Purge expired observer entries
    pub fn cleanup(&self) -> usize {
        self.observers.cleanup()
    }

    pub fn stats(&self) -> ObserverStats {
        self.observers.stats()
    }
}

impl Default for PresenceRelay {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_TTL, DEFAULT_OBSERVER_MAX_ROOMS)
    }
}
