//! Cooperative cancellation for wait loops
//!
//! Submitted transactions are never cancelled. Only polling loops observe the
//! token: they check it every iteration and bail out with
//! [`LpFlowError::Cancelled`], leaving the persisted step untouched.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::error::{LpFlowError, Result};

/// Cloneable cancellation handle shared by every pipeline
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Owner side of a [`CancelToken`]
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.rx.clone(),
        }
    }

    pub fn trigger(&self) {
        if !*self.tx.borrow() {
            info!("Shutdown requested; wait loops will stop at their next check");
        }
        let _ = self.tx.send(true);
    }

    /// Trigger on Ctrl-C
    pub fn trigger_on_ctrl_c(self: &std::sync::Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                this.trigger();
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the life of the process so `changed()` stays pending
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail fast if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(LpFlowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(LpFlowError::Cancelled),
        }
    }
}
