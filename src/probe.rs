//! TCP readiness probe.
//!
//! A server counts as ready once a plain TCP connect to its port succeeds.
//! This is a liveness proxy only: nothing is sent and the application layer
//! is not checked.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// Lower bound for a single connect attempt, so a zero timeout still probes once.
const MIN_ATTEMPT: Duration = Duration::from_millis(50);
// Lower bound for the poll interval; failed attempts always sleep.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct ReadinessProbe {
    interval: Duration,
    connect_timeout: Duration,
}

impl ReadinessProbe {
    pub fn new(interval: Duration, connect_timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            connect_timeout,
        }
    }

    /// Polls `host:port` until a connection succeeds or `timeout` elapses.
    ///
    /// Blocks for at most `timeout + interval`.
    pub async fn wait_ready(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let addr = format!("{}:{}", host, port);
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_timeout = self
                .connect_timeout
                .min(remaining)
                .max(MIN_ATTEMPT.min(self.interval));
            match tokio::time::timeout(attempt_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_stream)) => {
                    debug!(%addr, attempts, "readiness probe succeeded");
                    return true;
                }
                Ok(Err(err)) => debug!(%addr, attempts, error = %err, "connection refused"),
                Err(_) => debug!(%addr, attempts, "connect attempt timed out"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(%addr, attempts, "readiness probe gave up");
                return false;
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_CONNECT_TIMEOUT)
    }
}
