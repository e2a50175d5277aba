//! One-shot readiness signal.

use std::time::Duration;
use tokio::sync::watch;

/// Set by the transport once a connection (or listener) is live; awaited by
/// any number of callers. Once set it stays set, even across reconnects.
#[derive(Debug)]
pub struct ReadinessLatch {
    tx: watch::Sender<bool>,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the latch. Returns `true` only on the first call.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait for the latch, optionally bounded by `timeout`.
    ///
    /// Returns `true` if the latch fired, `false` if the timeout elapsed.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.tx.subscribe();
        let ready = async move { rx.wait_for(|ready| *ready).await.is_ok() };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, ready).await.unwrap_or(false),
            None => ready.await,
        }
    }
}

impl Default for ReadinessLatch {
    fn default() -> Self {
        Self::new()
    }
}
