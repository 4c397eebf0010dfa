//! API routes

pub mod health;
pub mod notifications;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // Token-in-query routes: browsers cannot set headers on websocket or EventSource requests
    let api_routes = Router::new()
        .route("/ws/tickets/:room_id", get(ws_handler))
        .route(
            "/notifications/stream",
            get(notifications::notification_stream),
        );

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
