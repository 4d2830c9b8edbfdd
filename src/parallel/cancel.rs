//! Cooperative cancellation
//!
//! Workers poll the token between items and between tree nodes. In-flight
//! work is never interrupted. A timeout is just a token cancelled by a timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{ParallelError, Result};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that only fires when [`cancel`](Self::cancel) is called
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled by a timer thread once `timeout` elapses
    pub fn after(timeout: Duration) -> Self {
        let token = Self::new();
        token.cancel_after(timeout);
        token
    }

    /// Arm a timer that cancels this token after `timeout`
    pub fn cancel_after(&self, timeout: Duration) {
        let token = self.clone();
        let spawned = thread::Builder::new()
            .name("parwork-cancel-timer".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                tracing::debug!("Cancellation timer fired after {:?}", timeout);
                token.cancel();
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start cancellation timer, cancelling now: {}", e);
            self.cancel();
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once the token has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ParallelError::Cancelled)
        } else {
            Ok(())
        }
    }
}
