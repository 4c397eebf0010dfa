//! Access token utility for Deskline
//!
//! Mints a short-lived access token for local testing of the websocket and
//! notification endpoints. Signs with `JWT_SECRET` from the environment.
//!
//! Usage:
//!   cargo run --bin issue-token -- <role> [user-id] [email]
//!   cargo run --bin issue-token -- staff
//!   cargo run --bin issue-token -- customer 6f1c4e0a-8d2b-4a51-9a8e-2b7c1f3d9e10
//!
//! Roles: customer, staff, admin, agent

use std::env;
use std::str::FromStr;

use deskline_api::auth::JwtManager;
use deskline_api::Config;
use deskline_shared::{Role, UserId};
use uuid::Uuid;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut args = env::args().skip(1);
    let Some(role) = args.next() else {
        eprintln!("Usage: issue-token <role> [user-id] [email]");
        std::process::exit(1);
    };
    let role = Role::from_str(&role)?;

    let user_id = match args.next() {
        Some(raw) => UserId(Uuid::parse_str(&raw)?),
        None => UserId::new(),
    };
    let email = args
        .next()
        .unwrap_or_else(|| format!("{}@deskline.local", role.as_str()));

    let config = Config::from_env()?;
    let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
    let issued = jwt.issue(user_id, role, &email)?;

    println!("\n===========================================");
    println!("User ID:  {}", user_id);
    println!("Role:     {}", role);
    println!("Token ID: {}", issued.jti);
    println!("Expires:  {}", issued.expires_at);
    println!("===========================================\n");
    println!("{}", issued.token);

    Ok(())
}
