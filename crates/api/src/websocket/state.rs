//! Global WebSocket state management
//!
//! Owns every live session plus the room registry, relay and reconciler that
//! operate on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use deskline_shared::{SessionId, UserId};

use super::connection::Connection;
use super::heartbeat::HeartbeatConfig;
use super::reconcile::Reconciler;
use super::relay::{ObserverStats, PresenceRelay, DEFAULT_OBSERVER_MAX_ROOMS, DEFAULT_OBSERVER_TTL};
use super::room::RoomRegistry;
use crate::config::{Config, ConfigError};
use crate::store::ChatStore;

/// Tunables for the messaging backbone
#[derive(Debug, Clone, Copy)]
pub struct WebSocketSettings {
    pub heartbeat: HeartbeatConfig,
    pub observer_ttl: Duration,
    pub observer_max_rooms: usize,
    pub max_message_bytes: usize,
    /// Consecutive protocol errors tolerated before a session is closed
    pub protocol_error_limit: u32,
}

impl WebSocketSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            heartbeat: config.heartbeat()?,
            observer_ttl: config.observer_ttl(),
            observer_max_rooms: config.observer_max_rooms,
            max_message_bytes: config.max_message_bytes,
            protocol_error_limit: config.protocol_error_limit,
        })
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            observer_ttl: DEFAULT_OBSERVER_TTL,
            observer_max_rooms: DEFAULT_OBSERVER_MAX_ROOMS,
            max_message_bytes: 16_384,
            protocol_error_limit: 5,
        }
    }
}

/// Global WebSocket state shared across all connections
#[derive(Clone)]
pub struct WebSocketState {
    /// All active connections indexed by session_id
    pub connections: Arc<RwLock<HashMap<SessionId, Arc<Connection>>>>,

    /// Ticket rooms and their live sessions
    pub rooms: Arc<RoomRegistry>,

    /// Out-of-band delivery to users without a live session
    pub relay: Arc<PresenceRelay>,

    pub reconciler: Arc<Reconciler>,

    pub settings: WebSocketSettings,
}

impl WebSocketState {
    /// Create new WebSocket state
    pub fn new(store: Arc<dyn ChatStore>, settings: WebSocketSettings) -> Self {
        let relay = Arc::new(PresenceRelay::new(
            settings.observer_ttl,
            settings.observer_max_rooms,
        ));
        let rooms = Arc::new(RoomRegistry::new(Arc::clone(&relay)));
        let reconciler = Arc::new(Reconciler::new(
            store,
            Arc::clone(&rooms),
            Arc::clone(&relay),
            settings.max_message_bytes,
        ));

        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms,
            relay,
            reconciler,
            settings,
        }
    }

    /// Register a connection and join it to its room.
    ///
    /// Returns the number of sessions in the room after the join.
    pub async fn add_connection(&self, conn: Arc<Connection>) -> usize {
        {
            let mut connections = self.connections.write().await;
            connections.insert(conn.session_id, Arc::clone(&conn));

            tracing::info!(
                session_id = %conn.session_id,
                user_id = %conn.user_id,
                total_connections = connections.len(),
                "WebSocket connection added"
            );
        }

        self.rooms.join(conn).await
    }

    /// Remove a connection and take it out of its room
    pub async fn remove_connection(&self, session_id: &SessionId) {
        let removed = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(session_id);
            if let Some(conn) = &removed {
                tracing::info!(
                    session_id = %session_id,
                    user_id = %conn.user_id,
                    remaining_connections = connections.len(),
                    "WebSocket connection removed"
                );
            }
            removed
        };

        if let Some(conn) = removed {
            self.rooms.leave(&conn.room_id, session_id).await;
        }
    }

    /// Get all connections for a specific user
    pub async fn get_user_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.user_id == *user_id)
            .cloned()
            .collect()
    }

    /// Get total number of active connections
    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    /// Get statistics about the WebSocket state
    pub async fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            active_connections: self.connection_count().await,
            active_rooms: self.rooms.get_room_count().await,
            observers: self.relay.stats(),
        }
    }
}

/// Statistics about WebSocket connections
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebSocketStats {
    /// Number of active connections
    pub active_connections: usize,
    /// Number of active ticket rooms
    pub active_rooms: usize,
    pub observers: ObserverStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use deskline_shared::{Role, RoomId, ServerEvent};
    use tokio::sync::mpsc;

    fn state() -> WebSocketState {
        WebSocketState::new(
            Arc::new(MemoryStore::permissive()),
            WebSocketSettings::default(),
        )
    }

    fn connection(
        room_id: RoomId,
        user_id: UserId,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Connection::new(room_id, user_id, Role::Customer, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_add_and_remove_connection() {
        let state = state();
        let room_id = RoomId::new();
        let (conn, _rx) = connection(room_id, UserId::new());
        let session_id = conn.session_id;

        assert_eq!(state.add_connection(conn).await, 1);
        assert_eq!(state.connection_count().await, 1);
        assert_eq!(state.rooms.get_room_size(&room_id).await, 1);

        state.remove_connection(&session_id).await;
        assert_eq!(state.connection_count().await, 0);
        assert_eq!(state.rooms.get_room_count().await, 0);

        // Removing twice is a no-op
        state.remove_connection(&session_id).await;
        assert_eq!(state.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_user_connections() {
        let state = state();
        let user_id = UserId::new();

        let (a, _rx1) = connection(RoomId::new(), user_id);
        let (b, _rx2) = connection(RoomId::new(), user_id);
        state.add_connection(a).await;
        state.add_connection(b).await;

        assert_eq!(state.get_user_connections(&user_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let state = state();
        let (conn, _rx) = connection(RoomId::new(), UserId::new());
        state.add_connection(conn).await;

        let stats = state.get_stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.active_rooms, 1);
        assert_eq!(stats.observers.total_rooms, 1);
    }

    #[test]
    fn test_settings_reject_misordered_heartbeat() {
        let mut config = Config::with_secret("x".repeat(32));
        config.heartbeat_interval_secs = 10;
        config.heartbeat_timeout_secs = 10;
        assert!(WebSocketSettings::from_config(&config).is_err());
    }
}
