//! Per-call context handed to gatherer factories and `gather()`.
//!
//! Carries the name of the autoscaler that owns the gatherer (used as log
//! context), an optional cancellation signal and an optional deadline.

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::GatherError;

/// Log context value used when no autoscaler name is set.
pub const UNKNOWN_AUTOSCALER: &str = "unknown";

/// Caller-supplied context for a gather operation.
#[derive(Debug, Clone)]
pub struct GatherContext {
    autoscaler: String,
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Default for GatherContext {
    fn default() -> Self {
        Self::new(UNKNOWN_AUTOSCALER)
    }
}

impl GatherContext {
    /// Create a context for the named autoscaler.
    pub fn new(autoscaler: impl Into<String>) -> Self {
        Self {
            autoscaler: autoscaler.into(),
            cancel: None,
            deadline: None,
        }
    }

    /// Cancel when the watched value becomes `true`.
    ///
    /// Uses the same `watch::Receiver<bool>` shutdown signal the daemon
    /// loops use. Dropping the sender never cancels.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Fail with [`GatherError::DeadlineExceeded`] once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Shorthand for a deadline relative to now. A timeout too large to
    /// represent sets no deadline.
    pub fn with_timeout(self, timeout: std::time::Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn autoscaler(&self) -> &str {
        &self.autoscaler
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check: the error to return if the call is already done.
    pub fn check(&self) -> Result<(), GatherError> {
        if let Some(cancel) = &self.cancel
            && *cancel.borrow()
        {
            return Err(GatherError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(GatherError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolve once the call is cancelled or its deadline passes.
    ///
    /// Never resolves for a context with neither. Meant to be raced against
    /// in-flight work with `tokio::select!`.
    pub async fn done(&self) -> GatherError {
        let cancelled = async {
            match &self.cancel {
                Some(cancel) => {
                    let mut cancel = cancel.clone();
                    if cancel.wait_for(|c| *c).await.is_err() {
                        // Sender dropped without cancelling.
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => GatherError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => GatherError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                GatherError::Cancelled
            }
        }
    }
}
