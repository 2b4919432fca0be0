//! Types for gracefully shutting down background tasks.
//!
//! A component owns a [`ShutdownSender`] and hands a clone of the matching
//! [`ShutdownReceiver`] to every task it spawns. Calling
//! [`ShutdownSender::shutdown`] signals all receivers and then waits until
//! every one of them has been dropped, which is how "all background tasks
//! have exited" is observed without a join-handle registry.

use tokio::sync::watch;

/// Creates a new shutdown channel, returning a [`ShutdownSender`] and a
/// [`ShutdownReceiver`].
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = watch::channel(());
    (ShutdownSender(tx), ShutdownReceiver(rx))
}

/// Broadcasts a shutdown signal to all associated [`ShutdownReceiver`]s.
#[derive(Debug)]
pub struct ShutdownSender(watch::Sender<()>);

impl ShutdownSender {
    /// Signal every receiver, then wait for all of them to be dropped.
    pub async fn shutdown(self) {
        // Send only fails if every receiver is already gone, which is fine.
        let _ = self.0.send(());
        self.0.closed().await;
    }

    /// Signal every receiver without waiting. Callers that must not block
    /// (stop paths inside a lock) use this and wait separately.
    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Wait until all receivers have been dropped without sending a signal.
    pub async fn wait_done(&self) {
        self.0.closed().await;
    }
}

/// Waits for a shutdown signal from the associated [`ShutdownSender`].
///
/// Cloning is cheap; a clone is associated with the same sender as the
/// original.
#[derive(Clone, Debug)]
pub struct ShutdownReceiver(watch::Receiver<()>);

impl ShutdownReceiver {
    /// Wait for the shutdown signal. Intended for use inside
    /// `tokio::select!` alongside the task's real work.
    pub async fn recv(&mut self) {
        let _ = self.0.changed().await;
    }

    /// Whether the signal has already been sent.
    pub fn is_shutdown(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_reaches_all_clones() {
        let (tx, rx) = channel();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mut rx = rx.clone();
            handles.push(tokio::spawn(async move { rx.recv().await }));
        }
        drop(rx);
        tx.shutdown().await;
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_receivers() {
        let (tx, mut rx) = channel();
        let slow = tokio::spawn(async move {
            rx.recv().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(rx);
        });
        tx.shutdown().await;
        assert!(slow.is_finished());
    }

    #[tokio::test]
    async fn is_shutdown_reflects_state() {
        let (tx, rx) = channel();
        assert!(!rx.is_shutdown());
        let task = tokio::spawn(async move {
            let mut rx = rx;
            rx.recv().await;
            assert!(rx.is_shutdown());
        });
        tx.shutdown().await;
        task.await.unwrap();
    }
}
