//! Typing notification throttle

use std::time::Duration;

use tokio::time::Instant;

/// Lets at most one typing notification through per interval
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether a notification may go out at `now`; records it if so
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Forget the last notification, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}
