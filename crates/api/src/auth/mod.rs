//! Authentication module for Deskline

pub mod jwt;

pub use jwt::{Claims, IssuedToken, JwtError, JwtManager, Principal};
