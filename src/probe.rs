//! TCP port reachability probe used as a readiness gate before tests run.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

/// Default time allowed for a port to open.
pub const DEFAULT_PORT_WAIT_TIMEOUT: Duration = Duration::from_secs(61);

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised while waiting for a port.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProbeError {
    /// Raised when the port did not accept a connection in time.
    #[error("{host}:{port} was not reachable within {} seconds", .limit.as_secs())]
    Timeout {
        /// Probed host.
        host: String,
        /// Probed port.
        port: u16,
        /// Limit that was applied.
        limit: Duration,
    },
}

/// Polls `host:port` until a TCP connection succeeds or `limit` elapses.
///
/// # Errors
///
/// Returns [`ProbeError::Timeout`] when no connection succeeds in time.
pub async fn wait_for_port(host: &str, port: u16, limit: Duration) -> Result<(), ProbeError> {
    PortProbe::new(limit).wait(host, port).await
}

/// Port probe with adjustable polling, mainly for tests.
#[derive(Clone, Copy, Debug)]
pub struct PortProbe {
    limit: Duration,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl PortProbe {
    /// Creates a probe with the default poll and connect intervals.
    #[must_use]
    pub const fn new(limit: Duration) -> Self {
        Self {
            limit,
            poll_interval: POLL_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Overrides the pause between attempts.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Waits for `host:port` to accept a connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Timeout`] when no connection succeeds in time.
    pub async fn wait(&self, host: &str, port: u16) -> Result<(), ProbeError> {
        info!(host, port, timeout_secs = self.limit.as_secs(), "waiting for port");
        let deadline = Instant::now() + self.limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = self.connect_timeout.min(remaining);
            match timeout(attempt, TcpStream::connect((host, port))).await {
                Ok(Ok(_)) => {
                    info!(host, port, "port is reachable");
                    return Ok(());
                }
                Ok(Err(err)) => debug!(host, port, error = %err, "port not reachable yet"),
                Err(_) => debug!(host, port, "connection attempt timed out"),
            }

            if Instant::now() + self.poll_interval >= deadline {
                return Err(ProbeError::Timeout {
                    host: host.to_owned(),
                    port,
                    limit: self.limit,
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}
