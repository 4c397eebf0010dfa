//! WebSocket messaging backbone for ticket chat
//!
//! # Architecture
//!
//! - **Connection**: one authenticated session joined to one ticket room
//! - **Room**: per-ticket broadcast domain with a role index
//! - **Heartbeat**: server-driven liveness probing per session
//! - **Relay**: new-message notifications for users with no live session
//! - **Reconcile**: durable IDs for client messages, idempotent withdraw/read
//! - **State**: global WebSocket state shared across all connections
//! - **Handler**: Axum WebSocket route handler

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod reconcile;
pub mod relay;
pub mod room;
pub mod state;

pub use handler::ws_handler;
pub use heartbeat::{HeartbeatConfig, HeartbeatSupervisor};
pub use relay::PresenceRelay;
pub use state::{WebSocketSettings, WebSocketState};
