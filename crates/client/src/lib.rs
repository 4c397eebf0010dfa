//! Deskline client
//!
//! Client half of the ticket chat backbone. A [`ConnectionHandle`] owns one
//! websocket session to one ticket room, reconnects on unexpected close,
//! correlates outgoing messages with their durable IDs, and keeps an
//! optimistic local view of the room's messages.

pub mod config;
pub mod error;
pub mod local;
pub mod manager;
pub mod outbox;
pub mod pending;
pub mod throttle;
pub mod transport;

pub use config::ClientConfig;
pub use error::ClientError;
pub use local::{Applied, DeliveryState, LocalChange, LocalMessage, LocalMessages, Withdrawal};
pub use manager::{ClientNotice, ConnectionHandle, ConnectionManager, ConnectionState};
pub use transport::{Connector, TransportSession, TungsteniteConnector};
