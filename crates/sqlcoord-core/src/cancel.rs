//! Cooperative cancellation built on `tokio::sync::watch`.
//!
//! A [`CancelToken`] is a `watch::Receiver<bool>` that flips to `true` once
//! the owning [`CancelSource`] cancels. Every blocking loop in this crate
//! checks the token before each attempt and races it against every sleep.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{CoordError, CoordResult};

/// Receiver side of a cancellation signal.
pub type CancelToken = watch::Receiver<bool>;

/// Sender side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    sender: watch::Sender<bool>,
}

impl CancelSource {
    /// Creates a new, not yet cancelled, source.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancelToken {
        self.sender.subscribe()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a token that is never cancelled.
pub fn never() -> CancelToken {
    let (_sender, receiver) = watch::channel(false);
    receiver
}

/// Returns a token that cancels itself after `deadline`.
///
/// Must be called from within a tokio runtime.
pub fn after(deadline: Duration) -> CancelToken {
    let (sender, receiver) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let _ = sender.send(true);
    });
    receiver
}

/// Returns true if the token has been cancelled.
pub fn is_cancelled(token: &CancelToken) -> bool {
    *token.borrow()
}

/// Resolves once the token is cancelled.
///
/// If the sender was dropped without cancelling, this never resolves.
pub async fn cancelled(token: &CancelToken) {
    let mut token = token.clone();
    if token.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Fails with [`CoordError::Cancelled`] if the token is cancelled.
pub fn check(token: &CancelToken) -> CoordResult<()> {
    if is_cancelled(token) {
        Err(CoordError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleeps for `duration` unless cancelled first.
pub async fn sleep(duration: Duration, token: &CancelToken) -> CoordResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => check(token),
        _ = cancelled(token) => Err(CoordError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_never_token_does_not_cancel_sleep() {
        let token = never();
        assert!(!is_cancelled(&token));
        sleep(Duration::from_millis(5), &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let source = CancelSource::new();
        let token = source.token();
        let sleeper = tokio::spawn(async move { sleep(Duration::from_secs(30), &token).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CoordError::Cancelled)));
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn test_after_deadline_cancels() {
        let token = after(Duration::from_millis(20));
        assert!(check(&token).is_ok());
        tokio::time::timeout(Duration::from_secs(1), cancelled(&token))
            .await
            .unwrap();
        assert!(matches!(check(&token), Err(CoordError::Cancelled)));
    }
}
