//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Cloned into every delivery task and room background task; cancelling
//! any clone wakes all waiters, and `cancelled()` is cheap enough to poll
//! once per chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters. Idempotent.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_cancel_from_clone() {
        let sos = SignalOfStop::new();
        let clone = sos.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn test_wait_after_cancel_is_immediate() {
        let sos = SignalOfStop::new();
        sos.cancel();
        sos.cancel();
        tokio::time::timeout(Duration::from_millis(10), sos.wait())
            .await
            .expect("already-cancelled signal must not block");
    }
}
