//! Shutdown signaling for sync runs.
//!
//! Abstracts a tokio watch channel into a broadcast shutdown signal: one
//! sender notifies every subscribed receiver, and receivers can check or
//! await the signal without polling. Used to propagate run deadlines and
//! Ctrl-C into in-flight page fetches.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

/// Receiver side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownTx {
    /// Signals shutdown to every subscribed receiver.
    ///
    /// Returns an error when no receiver is alive anymore, which callers are
    /// free to ignore: with nobody listening there is nothing to stop.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<bool>> {
        self.0.send(true)
    }

    /// Creates a new receiver subscribed to this channel.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

impl ShutdownRx {
    /// Whether shutdown has already been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is signaled.
    ///
    /// Also resolves when the sender is dropped, treating a vanished
    /// orchestrator the same as an explicit shutdown.
    pub async fn signaled(&mut self) {
        if *self.0.borrow() {
            return;
        }

        // Either the value flips to true or the channel closes.
        while self.0.changed().await.is_ok() {
            if *self.0.borrow() {
                return;
            }
        }
    }
}

/// Creates a connected shutdown channel pair.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
