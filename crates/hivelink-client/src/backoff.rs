//! Retry pacing for the dial loop.
//!
//! The sleep between attempts is keyed to how long the whole dial loop has
//! been running, not to the attempt count: a manager that has been gone for
//! hours is polled every few minutes, one that vanished seconds ago is
//! retried almost immediately. Only an explicit reconnect resets the clock.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maps elapsed wall-time since the dial loop started to a sleep duration.
#[derive(Debug)]
pub struct BackoffClock {
    started: Instant,
}

impl BackoffClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
    }

    /// The sleep for the current elapsed time.
    pub fn delay(&self) -> Duration {
        Self::delay_for(self.started.elapsed())
    }

    /// Tier table, longest first.
    pub fn delay_for(elapsed: Duration) -> Duration {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(60 * 60);

        if elapsed > 12 * HOUR {
            10 * MINUTE
        } else if elapsed > HOUR {
            MINUTE
        } else if elapsed > 30 * MINUTE {
            Duration::from_secs(30)
        } else if elapsed > 10 * MINUTE {
            Duration::from_secs(10)
        } else if elapsed > 3 * MINUTE {
            Duration::from_secs(3)
        } else {
            Duration::from_secs(1)
        }
    }

    /// Sleep for the current tier, returning early on cancellation.
    pub async fn sleep(&self, cancel: &CancellationToken) {
        let delay = self.delay();
        debug!("retrying the manager in {delay:?}");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
