//! Heartbeat supervisor
//!
//! Every `interval` the server sends a `heartbeat` probe and waits up to
//! `timeout` for a `heartbeat_ack`. A missed ack means the session is dead and
//! the caller force-closes it. Reconnection is the client's job.
//!
//! Each probe waits only for acks recorded after that probe was sent, and the
//! wait (with its timer) is dropped before the next probe goes out, so an ack
//! or timer from one cycle can never be observed by another.

use std::time::Duration;

use deskline_shared::ServerEvent;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::Connection;
use crate::config::ConfigError;

/// Default probe period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time allowed for an ack
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// Validated timings; the timeout must be strictly shorter than the interval
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout >= interval {
            return Err(ConfigError::HeartbeatOrdering { interval, timeout });
        }
        Ok(Self { interval, timeout })
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
            timeout: HEARTBEAT_TIMEOUT,
        }
    }
}

/// Why a supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No ack within the timeout; the session must be force-closed
    TimedOut,
    /// The session's writer went away first
    ConnectionClosed,
}

/// Receiving half of a session used to record acks
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    acks: watch::Sender<Instant>,
}

impl HeartbeatHandle {
    /// Record a `heartbeat_ack` from the client
    pub fn record_ack(&self) {
        self.acks.send_replace(Instant::now());
    }
}

/// Per-connection liveness prober
pub struct HeartbeatSupervisor {
    config: HeartbeatConfig,
    acks: watch::Receiver<Instant>,
    last_heartbeat_at: Option<Instant>,
}

impl HeartbeatSupervisor {
    pub fn new(config: HeartbeatConfig) -> (Self, HeartbeatHandle) {
        let (tx, rx) = watch::channel(Instant::now());
        (
            Self {
                config,
                acks: rx,
                last_heartbeat_at: None,
            },
            HeartbeatHandle { acks: tx },
        )
    }

    /// Probe the connection until it dies.
    ///
    /// Dropping the returned future cancels any pending probe timer.
    pub async fn run(mut self, conn: &Connection) -> HeartbeatOutcome {
        let start = Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Only acks recorded after this point answer the probe below
            self.acks.borrow_and_update();
            if conn.send(ServerEvent::Heartbeat).is_err() {
                return HeartbeatOutcome::ConnectionClosed;
            }
            tracing::trace!(session_id = %conn.session_id, "Sent heartbeat probe");

            let acked = tokio::time::timeout(self.config.timeout, self.acks.changed()).await;

            match acked {
                Ok(Ok(())) => {
                    self.last_heartbeat_at = Some(*self.acks.borrow());
                    tracing::trace!(session_id = %conn.session_id, "Heartbeat acknowledged");
                }
                // Every handle dropped: the reader half is gone
                Ok(Err(_)) => return HeartbeatOutcome::ConnectionClosed,
                Err(_) => {
                    tracing::warn!(
                        session_id = %conn.session_id,
                        user_id = %conn.user_id,
                        room_id = %conn.room_id,
                        timeout = ?self.config.timeout,
                        last_heartbeat_at = ?self.last_heartbeat_at.map(|at| at.elapsed()),
                        "Heartbeat timed out, closing connection"
                    );
                    return HeartbeatOutcome::TimedOut;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskline_shared::{Role, RoomId, UserId};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Connection::new(RoomId::new(), UserId::new(), Role::Customer, tx)),
            rx,
        )
    }

    /// Simulated client answering every probe after `delay`
    fn auto_ack(
        mut rx: mpsc::UnboundedReceiver<ServerEvent>,
        handle: HeartbeatHandle,
        delay: Duration,
    ) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut probes = 0;
            while let Some(event) = rx.recv().await {
                if event == ServerEvent::Heartbeat {
                    probes += 1;
                    tokio::time::sleep(delay).await;
                    handle.record_ack();
                }
            }
            probes
        })
    }

    #[test]
    fn test_timeout_must_be_shorter_than_interval() {
        assert!(HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(10)).is_ok());
        assert!(HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(10)).is_err());
        assert!(HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(10)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_connection_times_out() {
        let (conn, _rx) = connection();
        let (supervisor, _handle) = HeartbeatSupervisor::new(HeartbeatConfig::default());

        let started = Instant::now();
        let outcome = supervisor.run(&conn).await;

        assert_eq!(outcome, HeartbeatOutcome::TimedOut);
        assert_eq!(started.elapsed(), HEARTBEAT_INTERVAL + HEARTBEAT_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_connection_stays_open() {
        let (conn, rx) = connection();
        let (supervisor, handle) = HeartbeatSupervisor::new(HeartbeatConfig::default());
        let client = auto_ack(rx, handle, Duration::from_secs(2));

        let result = tokio::time::timeout(
            HEARTBEAT_INTERVAL * 5,
            supervisor.run(&conn),
        )
        .await;
        assert!(result.is_err(), "supervisor must still be running");

        drop(conn);
        assert!(client.await.unwrap() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_misordered_timings_do_not_close_healthy_connection() {
        // Bypasses validation on purpose: timeout longer than the interval
        let config = HeartbeatConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        };
        let (conn, rx) = connection();
        let (supervisor, handle) = HeartbeatSupervisor::new(config);
        let _client = auto_ack(rx, handle, Duration::from_secs(7));

        let result = tokio::time::timeout(
            config.interval + config.timeout + config.interval,
            supervisor.run(&conn),
        )
        .await;
        assert!(result.is_err(), "healthy connection was closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ack_does_not_satisfy_next_probe() {
        let (conn, _rx) = connection();
        let (supervisor, handle) = HeartbeatSupervisor::new(HeartbeatConfig::default());

        // Ack arrives before any probe was sent
        tokio::time::advance(Duration::from_secs(1)).await;
        handle.record_ack();

        let outcome = supervisor.run(&conn).await;
        assert_eq!(outcome, HeartbeatOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_stops_supervisor() {
        let (conn, rx) = connection();
        let (supervisor, _handle) = HeartbeatSupervisor::new(HeartbeatConfig::default());
        drop(rx);

        assert_eq!(supervisor.run(&conn).await, HeartbeatOutcome::ConnectionClosed);
    }
}
