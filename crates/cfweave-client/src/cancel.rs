//! Cooperative cancellation token
//!
//! Every reconciler entry point receives one of these from the host. On
//! cancel, in-flight requests are abandoned and pollers stop; remote jobs
//! are never cancelled. The token is a thin wrapper over a watch channel
//! so clones are cheap and observation is async.

use tokio::sync::watch;

/// Receiver half handed to reconcilers and pollers
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Sender half kept by the host adapter
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    /// A token that never fires; used where no host is driving (tests)
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the channel open for the lifetime of the token.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested. If the sender is dropped
    /// without cancelling, pend forever - abandoned hosts must not abort
    /// in-flight reconciles.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Run `fut` unless the token fires first.
pub async fn run_cancellable<T>(
    token: &CancelToken,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        out = fut => Some(out),
        _ = token.cancelled() => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_token_does_not_fire() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let out = run_cancellable(&token, async { 42 }).await;
        assert_eq!(out, Some(42));
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_future() {
        let (handle, token) = CancelToken::pair();
        handle.cancel();
        let out = run_cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            42
        })
        .await;
        assert_eq!(out, None);
        assert!(token.is_cancelled());
    }
}
