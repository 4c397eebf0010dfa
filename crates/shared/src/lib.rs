//! Deskline Shared Types and Utilities
//!
//! This crate contains the ID types, the ticket chat wire protocol and the
//! database helpers shared by the server and the client.

pub mod db;
pub mod error;
pub mod events;
pub mod types;

pub use db::*;
pub use error::*;
pub use events::*;
pub use types::*;
