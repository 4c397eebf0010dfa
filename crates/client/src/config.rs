//! Client configuration

use std::time::Duration;

use deskline_shared::RoomId;

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP(S) base URL of the API server
    pub base_url: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Consecutive failed reconnects before giving up
    pub max_reconnect_attempts: u32,
    /// How long a send waits for `message_sent`
    pub send_timeout: Duration,
    /// Period of client-originated heartbeats
    pub heartbeat_interval: Duration,
    /// Minimum spacing between typing notifications
    pub typing_throttle: Duration,
    /// Frames buffered in each direction of the transport
    pub outbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            typing_throttle: Duration::from_millis(1500),
            outbound_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Websocket URL for a ticket room
    pub fn ws_url(&self, room_id: RoomId, token: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        // Convert http(s):// to ws(s)://
        let ws_base = if base.starts_with("https://") {
            base.replacen("https://", "wss://", 1)
        } else {
            base.replacen("http://", "ws://", 1)
        };
        format!("{ws_base}/api/v1/ws/tickets/{room_id}?token={token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        let room_id = RoomId::new();
        let config = ClientConfig::with_base_url("https://desk.example.com/");
        assert_eq!(
            config.ws_url(room_id, "abc"),
            format!("wss://desk.example.com/api/v1/ws/tickets/{room_id}?token=abc")
        );

        let config = ClientConfig::with_base_url("http://127.0.0.1:8080");
        assert!(config.ws_url(room_id, "t").starts_with("ws://127.0.0.1:8080/"));
    }
}
