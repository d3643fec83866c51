//! Delayed arming of the sandbox manual-capture fallback.

use std::time::Duration;
use tokio::task::AbortHandle;

/// How long the live capture gets before the manual fallback is offered.
pub(crate) const SANDBOX_FALLBACK_DELAY: Duration = Duration::from_millis(4000);

/// Handle to a pending arm. Cancelling a handle that already fired is a no-op.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancellationHandle {
    abort: Option<AbortHandle>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Single-shot timer; at most one arm is pending at any time.
#[derive(Debug)]
pub(crate) struct SandboxFallbackTimer {
    delay: Duration,
    pending: CancellationHandle,
}

impl Default for SandboxFallbackTimer {
    fn default() -> Self {
        Self::new(SANDBOX_FALLBACK_DELAY)
    }
}

impl SandboxFallbackTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: CancellationHandle::default(),
        }
    }

    /// Cancel any pending arm, then schedule `on_arm` after the delay if `enabled`.
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(&mut self, enabled: bool, on_arm: F) -> CancellationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.cancel();
        if !enabled {
            self.pending = CancellationHandle::default();
            return self.pending.clone();
        }
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!(delay_ms = delay.as_millis() as u64, "sandbox fallback timer fired");
            on_arm();
        });
        self.pending = CancellationHandle {
            abort: Some(task.abort_handle()),
        };
        self.pending.clone()
    }

    pub fn cancel(&mut self) {
        self.pending.cancel();
        self.pending = CancellationHandle::default();
    }
}
