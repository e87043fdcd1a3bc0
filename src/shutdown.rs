//! # Shutdown Signal
//!
//! Cooperative cancellation for long-running loops. A [`ShutdownHandle`] flips a
//! shared flag once; every cloned [`ShutdownSignal`] observes it, either by polling
//! [`ShutdownSignal::is_triggered`] or by awaiting [`ShutdownSignal::triggered`]
//! inside a `tokio::select!`.

use tokio::sync::watch;
use tracing::info;

/// Sending half, owned by whoever decides when the process stops
#[derive(Debug)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

/// Receiving half, threaded through every suspension point
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownHandle { sender }, ShutdownSignal { receiver })
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        let already = self.sender.send_replace(true);
        if !already {
            info!("🛑 SHUTDOWN: Graceful shutdown requested");
        }
    }

    /// Derive another signal from this handle
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been requested.
    ///
    /// If the handle is dropped without triggering, this future stays pending.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
