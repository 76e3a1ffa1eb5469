use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::port::Port;

/// Rendezvous point for named channels plus the host's persistent badge.
///
/// Stands in for the host runtime: it owns no context state, it only
/// introduces two ends of a channel to each other.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<Port>>>,
    badge: watch::Sender<String>,
}

/// Incoming connections for one channel name.
pub struct Listener {
    name: String,
    rx: mpsc::UnboundedReceiver<Port>,
}

impl Hub {
    pub fn new() -> Self {
        let (badge, _) = watch::channel(String::new());
        Self {
            inner: Arc::new(HubInner {
                listeners: Mutex::new(HashMap::new()),
                badge,
            }),
        }
    }

    /// Become the acceptor for `name`, replacing any previous acceptor.
    pub fn listen(&self, name: &str) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners().insert(name.to_string(), tx);
        Listener {
            name: name.to_string(),
            rx,
        }
    }

    /// Open a channel to whoever listens on `name`.
    ///
    /// With no live acceptor the returned port is already disconnected.
    pub fn connect(&self, name: &str) -> Port {
        let (local, remote) = Port::pair(name);
        let mut listeners = self.listeners();
        match listeners.get(name) {
            Some(tx) => {
                if tx.send(remote).is_err() {
                    debug!(channel = name, "acceptor gone; dropping registration");
                    listeners.remove(name);
                }
            }
            None => debug!(channel = name, "no acceptor for channel"),
        }
        local
    }

    pub fn set_badge_text(&self, text: &str) {
        self.inner.badge.send_replace(text.to_string());
    }

    pub fn badge_text(&self) -> String {
        self.inner.badge.borrow().clone()
    }

    pub fn badge(&self) -> watch::Receiver<String> {
        self.inner.badge.subscribe()
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Port>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn accept(&mut self) -> Option<Port> {
        self.rx.recv().await
    }
}
