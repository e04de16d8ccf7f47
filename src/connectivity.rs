use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Host-driven online/offline signal.
///
/// The host (browser `online`/`offline` events, a platform reachability API)
/// calls [`Connectivity::set_online`]; queue instances subscribe and react to
/// transitions. Cloning shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publishes a transition. Repeating the current state is a no-op so
    /// subscribers only ever see real edges.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
