use tokio::sync::{Notify, broadcast};

/// Broadcast bus pinging subscribed event streams whenever job state
/// changes. Owned by the daemon's shared state, one per process.
pub struct Events {
    sender: broadcast::Sender<()>,
    shutdown: Notify,
}

impl Events {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            shutdown: Notify::new(),
        }
    }

    pub fn notify(&self) {
        let _ = self.sender.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn shutdown_notified(&self) {
        self.shutdown.notified().await;
    }
}
