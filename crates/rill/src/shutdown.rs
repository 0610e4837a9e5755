//! Two-level session shutdown.
//!
//! A graceful stop closes segment admission and lets in-flight work drain.
//! A forced abort short-circuits every suspension point and drops in-flight
//! fetches on the floor.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, Default)]
pub struct StopController {
    graceful: CancellationToken,
    force: CancellationToken,
}

impl StopController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop: no new segments are admitted, in-flight
    /// downloads finish and the completion handoff still runs.
    pub fn stop(&self) {
        self.graceful.cancel();
    }

    /// Abort immediately. Implies a graceful stop.
    pub fn abort(&self) {
        self.graceful.cancel();
        self.force.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.force.is_cancelled()
    }

    /// Resolves when a graceful stop (or abort) has been requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.graceful.cancelled()
    }

    /// Resolves when an abort has been requested.
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.force.cancelled()
    }
}
