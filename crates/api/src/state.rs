//! Shared application state handed to every route

use std::sync::Arc;

use crate::auth::JwtManager;
use crate::config::{Config, ConfigError};
use crate::store::ChatStore;
use crate::websocket::{WebSocketSettings, WebSocketState};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    pub store: Arc<dyn ChatStore>,
    pub ws_state: WebSocketState,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn ChatStore>) -> Result<Self, ConfigError> {
        let settings = WebSocketSettings::from_config(&config)?;
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let ws_state = WebSocketState::new(Arc::clone(&store), settings);

        Ok(Self {
            config: Arc::new(config),
            jwt,
            store,
            ws_state,
        })
    }
}
