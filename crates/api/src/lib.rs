//! Deskline API Library
//!
//! Real-time messaging backbone for help-desk tickets: websocket rooms,
//! heartbeat supervision, offline notification relay and message
//! reconciliation.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
