//! Graceful shutdown coordination.
//!
//! One watch channel fans the shutdown request out to the control loop and
//! the worker pool. The merge consumer is not subscribed: it drains its
//! queue instead, so a partially-applied merge is never abandoned mid-step.

use tokio::sync::watch;
use tracing::info;

pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Flip the shutdown flag. Idempotent. send_replace updates the value
    /// even when no receiver is currently subscribed; plain send would
    /// drop the request on the floor in that case.
    pub fn request_shutdown(&self) {
        if !self.is_requested() {
            info!("shutdown requested");
        }
        self.tx.send_replace(true);
    }

    /// Spawn a task that converts Ctrl-C into a shutdown request so
    /// in-flight workers are terminated and tagged interrupted instead of
    /// being mislabeled as failures.
    pub fn install_ctrl_c_handler(self: &std::sync::Arc<Self>) {
        let coordinator = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt signal received, beginning graceful shutdown");
                coordinator.request_shutdown();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_is_visible_to_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        assert!(!*rx.borrow());

        coordinator.request_shutdown();
        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow());
        assert!(coordinator.is_requested());
    }

    #[tokio::test]
    async fn request_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();
        coordinator.request_shutdown();
        assert!(coordinator.is_requested());
    }

    #[tokio::test]
    async fn request_without_subscribers_is_not_lost() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown();
        assert!(coordinator.is_requested());
        // A subscriber arriving after the fact still observes the request.
        assert!(*coordinator.subscribe().borrow());
    }
}
