use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

pub type DocumentId = u32;

/// The host's view of open documents and their mounted renderers.
#[derive(Clone, Default)]
pub struct Documents {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_id: DocumentId,
    entries: BTreeMap<DocumentId, Entry>,
}

struct Entry {
    url: String,
    inbox: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Documents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, url: &str) -> DocumentId {
        let mut reg = self.lock();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.entries.insert(
            id,
            Entry {
                url: url.to_string(),
                inbox: None,
            },
        );
        id
    }

    /// Closing drops the renderer's inbox, which ends its task.
    pub fn close(&self, id: DocumentId) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Load a new location; any mounted renderer is torn down.
    pub fn navigate(&self, id: DocumentId, url: &str) -> bool {
        match self.lock().entries.get_mut(&id) {
            Some(entry) => {
                entry.url = url.to_string();
                entry.inbox = None;
                true
            }
            None => false,
        }
    }

    pub fn url(&self, id: DocumentId) -> Option<String> {
        self.lock().entries.get(&id).map(|e| e.url.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents whose URL scheme is in `schemes` (case-insensitive).
    pub fn query(&self, schemes: &[String]) -> Vec<DocumentId> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| scheme_allowed(&e.url, schemes))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Deliver one frame to the renderer mounted in `id`.
    pub fn send_message(&self, id: DocumentId, frame: Bytes) -> Result<()> {
        let reg = self.lock();
        let Some(entry) = reg.entries.get(&id) else {
            bail!("document {id} is closed");
        };
        let Some(inbox) = entry.inbox.as_ref() else {
            bail!("document {id} has no renderer");
        };
        if inbox.send(frame).is_err() {
            bail!("renderer in document {id} is gone");
        }
        Ok(())
    }

    /// Attach a renderer inbox. `None` if the document is closed or a live
    /// renderer is already attached.
    pub(crate) fn attach(&self, id: DocumentId) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        let mut reg = self.lock();
        let entry = reg.entries.get_mut(&id)?;
        if entry.inbox.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        entry.inbox = Some(tx);
        Some(rx)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn scheme_allowed(url: &str, schemes: &[String]) -> bool {
    let Some((scheme, _)) = url.split_once("://") else {
        return false;
    };
    schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
}
