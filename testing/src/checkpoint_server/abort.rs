//! Cancellation signal for long polls.
//!
//! An [`AbortController`] owns the flag; every cloned [`AbortSignal`]
//! observes it. Built on a `tokio::sync::watch` channel so a waiting poll
//! wakes as soon as the controller aborts.

use tokio::sync::watch;

#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Aborts every signal handed out by this controller. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the controller aborts. Never resolves if the
    /// controller is dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Aborts the wrapped controller when dropped.
#[derive(Debug)]
pub struct AbortOnDrop(pub AbortController);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_abort_wakes_waiter() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        let waiter = tokio::spawn(async move { signal.aborted().await });
        controller.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(controller.is_aborted());
    }

    #[tokio::test]
    async fn test_signal_taken_after_abort_is_aborted() {
        let controller = AbortController::new();
        controller.abort();
        let signal = controller.signal();
        assert!(signal.is_aborted());
        signal.aborted().await;
    }

    #[test]
    fn test_abort_on_drop() {
        let controller = AbortController::new();
        let signal = controller.signal();
        drop(AbortOnDrop(controller));
        assert!(signal.is_aborted());
    }
}
