//! Retry policy for master-routed calls.

use std::time::Duration;

use tracing::warn;

use crate::config::ClusterConfig;
use crate::error::{ClientError, Result};

use super::session::Session;

/// Linear backoff bounded by a wall-clock deadline.
///
/// Retry `n` (starting at 0) sleeps `n * backoff_scale`. A retry whose sleep
/// would end past the deadline is not attempted; the triggering error is
/// returned instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff_scale: Duration,
    budget: Duration,
}

impl RetryPolicy {
    pub fn new(backoff_scale: Duration, budget: Duration) -> Self {
        RetryPolicy {
            backoff_scale,
            budget,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        RetryPolicy::new(config.backoff_scale(), config.master_retry_budget())
    }

    /// Sleep before retry number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_scale.saturating_mul(attempt)
    }

    /// Run `call`, retrying master-loss failures until the budget runs out.
    ///
    /// Before each retry the cached master is forgotten and every
    /// connection is dropped. Other errors are returned unchanged.
    pub(crate) fn run<T>(
        &self,
        session: &Session,
        op: &'static str,
        mut call: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let clock = session.clock();
        // A budget too large to represent never expires.
        let deadline = clock.now().checked_add(self.budget);
        let mut attempt: u32 = 0;

        loop {
            let err = match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_master_loss() => e,
                Err(e) => return Err(e),
            };

            if session.config().nodes().is_empty() {
                return Err(ClientError::InvalidConfig(
                    "empty client configuration".into(),
                ));
            }
            session.invalidate_master();
            session.drop_connections();

            let pause = self.backoff(attempt);
            let exhausted = match (clock.now().checked_add(pause), deadline) {
                (Some(resume), Some(deadline)) => resume > deadline,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if exhausted {
                warn!(op, attempts = attempt + 1, error = %err, "master retry budget exhausted");
                return Err(err);
            }
            attempt = attempt.saturating_add(1);
            warn!(op, error = %err, retry_in = ?pause, "master not found, retrying");
            clock.sleep(pause);
        }
    }
}
