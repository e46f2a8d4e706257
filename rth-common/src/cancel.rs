//! Cooperative cancellation for blocking waits.
//!
//! The invocation owner holds a [`Cancellation`] and hands clones of its
//! [`CancelToken`] to everything that blocks (subprocess waits, downloads,
//! metric collectors). Cancellation is level-triggered: once fired, every
//! current and future observer sees it.

use tokio::sync::watch;

/// Cancellation source. Dropping it without firing leaves all tokens
/// permanently un-cancelled.
pub struct Cancellation {
    tx: watch::Sender<bool>,
}

impl Cancellation {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Fire the cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer half of a [`Cancellation`]. Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Non-blocking check, for use before expensive steps.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the cancellation fires. If the source was dropped
    /// without firing, pends forever.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that never cancels, for callers without an owner.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_observes_cancellation() {
        let (source, token) = Cancellation::new();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        // Must resolve promptly once fired.
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve after cancel()");
    }

    #[tokio::test]
    async fn clones_share_the_signal() {
        let (source, token) = Cancellation::new();
        let clone = token.clone();
        source.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_source_does_not_cancel() {
        let (source, token) = Cancellation::new();
        drop(source);
        assert!(!token.is_cancelled());
        let waited =
            tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(waited.is_err(), "cancelled() must pend when source is gone");
    }

    #[tokio::test]
    async fn never_token_is_never_cancelled() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
