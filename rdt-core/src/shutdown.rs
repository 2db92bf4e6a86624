use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

/// A handle which can be used to stop the server. All clones observe the
/// same shutdown.
#[derive(Debug, Clone)]
pub struct Shutdown {
    stopped: Arc<OnceLock<()>>,
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _recv) = broadcast::channel(1);
        Self {
            stopped: Arc::new(OnceLock::new()),
            notify,
        }
    }

    /// Signals every clone of this handle. Repeated calls are no-ops.
    pub fn shut_down(&self) {
        let _ = self.stopped.set(());
        let _ = self.notify.send(());
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.get().is_some()
    }

    /// Waits until some clone calls [`shut_down`](Shutdown::shut_down).
    pub async fn wait_for_shutdown(&self) {
        let mut recv = self.notify.subscribe();
        while !self.is_shut_down() {
            let _ = recv.recv().await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
