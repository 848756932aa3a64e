//! Request cancellation primitives.
//!
//! An [`AbortController`] owns the abort state; every [`AbortSignal`]
//! handed out by [`AbortController::signal`] observes the same `abort()`
//! call. Signals are cheap to clone and are checked before dispatch and
//! raced against connect, response headers, and body reads.

use tokio::sync::watch;

/// Controller side of a cancellation pair.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

/// Observer side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    /// Create a new, un-aborted controller.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Get a signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Abort. Every outstanding signal clone observes this; aborting more
    /// than once is a no-op.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether `abort()` has been called.
    pub fn aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Whether the controller has fired.
    pub fn aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the controller fires. If it already fired, resolves
    /// immediately. If the controller is dropped without firing, pends
    /// forever (a dropped controller can no longer abort anything).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Controller gone; the request can never be aborted now.
                std::future::pending::<()>().await;
            }
        }
    }
}
