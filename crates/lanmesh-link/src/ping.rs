//! Round-trip probing of one link
//!
//! A [`PingChecker`] serves one in-flight probe at a time; each
//! connection owns its own checker, so concurrent sweeps across many
//! links still run in parallel.

use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};
use tracing::trace;

use lanmesh_core::OverlayMessage;

use crate::connection::Connection;

/// Single-probe round-trip checker
pub struct PingChecker {
    timeout: Duration,
    in_flight: Mutex<()>,
}

impl PingChecker {
    /// Create a checker with the given probe deadline
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            in_flight: Mutex::new(()),
        }
    }

    /// Probe the round trip once
    ///
    /// Sends a freshly-tokened probe and waits for the matching response.
    /// Returns the elapsed milliseconds, or `u32::MAX` when the deadline
    /// passes or the probe cannot be sent.
    pub async fn check_ping(&self, conn: &Connection) -> u32 {
        let _probe = self.in_flight.lock().await;

        let token = rand::random::<u32>();
        let (done, response) = oneshot::channel();
        conn.register_ping(token, done);

        let start = Instant::now();
        if conn
            .send_message(&OverlayMessage::PingReq { token })
            .await
            .is_err()
        {
            conn.forget_ping(token);
            return u32::MAX;
        }

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed().as_millis() as u32;
                trace!(token, elapsed, "Ping answered");
                elapsed
            }
            _ => {
                conn.forget_ping(token);
                u32::MAX
            }
        }
    }
}
