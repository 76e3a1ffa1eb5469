use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// One end of a named duplex channel between two contexts.
///
/// Frames arrive in send order. When either end is dropped the channel is
/// gone: `post` starts returning `false` and `recv` yields `None`. Neither
/// is an error.
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

/// Sending half of a [`Port`]. Cheap to clone.
#[derive(Clone)]
pub struct PortSender {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Receiving half of a [`Port`].
pub struct PortReceiver {
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Port {
    /// Create both ends of a channel called `name`.
    pub fn pair(name: &str) -> (Port, Port) {
        let name: Arc<str> = Arc::from(name);
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Port {
            sender: PortSender { name: name.clone(), tx: a_tx },
            receiver: PortReceiver { name: name.clone(), rx: a_rx },
        };
        let b = Port {
            sender: PortSender { name: name.clone(), tx: b_tx },
            receiver: PortReceiver { name, rx: b_rx },
        };
        (a, b)
    }

    pub fn name(&self) -> &str {
        &self.sender.name
    }

    pub fn post(&self, frame: Bytes) -> bool {
        self.sender.post(frame)
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

impl PortSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` if the far end has gone away.
    pub fn post(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl PortReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}
