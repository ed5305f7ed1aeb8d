//! # Lifetime
//!
//! Cooperative cancellation scope shared by every task of the terminator.
//!
//! A [`Lifetime`] is cancelled once and stays cancelled. Clones observe the same
//! scope. [`Lifetime::child`] derives a scope that is cancelled with its parent
//! but can also be cancelled on its own, which is how a single leadership term
//! is torn down without stopping the process.

use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Lifetime {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancel this scope and every child derived from it
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scope is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this only errors after cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// A scope cancelled together with `self`
    #[must_use]
    pub fn child(&self) -> Lifetime {
        let child = Lifetime::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = parent.cancelled() => linked.cancel(),
                () = linked.cancelled() => {}
            }
        });
        child
    }
}

/// Cancel `lifetime` on the first SIGINT or SIGTERM.
///
/// # Errors
///
/// Fails when the SIGTERM handler cannot be installed.
pub fn cancel_on_shutdown_signal(lifetime: &Lifetime) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let lifetime = lifetime.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            () = lifetime.cancelled() => return,
        }
        lifetime.cancel();
    });

    Ok(())
}
