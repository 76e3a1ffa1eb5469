//! Per-document overlay that mirrors the latest alignment verdict.

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::alignment::Alignment;
use crate::runtime::{DocumentId, Documents};

pub const GOOD_CLASS: &str = "good-alignment";
pub const BAD_CLASS: &str = "bad-alignment";
pub const WARNING_TEXT: &str = "STOP SLOUCHING!";

/// What the document currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overlay {
    #[default]
    Neutral,
    Good,
    Bad,
}

impl Overlay {
    pub fn body_class(self) -> Option<&'static str> {
        match self {
            Overlay::Neutral => None,
            Overlay::Good => Some(GOOD_CLASS),
            Overlay::Bad => Some(BAD_CLASS),
        }
    }

    pub fn status_text(self) -> &'static str {
        match self {
            Overlay::Bad => WARNING_TEXT,
            _ => "",
        }
    }
}

impl From<Alignment> for Overlay {
    fn from(a: Alignment) -> Self {
        match a {
            Alignment::Good => Overlay::Good,
            Alignment::Bad => Overlay::Bad,
        }
    }
}

/// Only the field the overlay cares about; `{baseline}` frames carry none.
#[derive(Deserialize)]
struct Incoming {
    #[serde(default)]
    alignment: Option<Alignment>,
}

pub struct Renderer {
    document: DocumentId,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    overlay: watch::Sender<Overlay>,
}

/// Read side of a mounted renderer.
#[derive(Clone)]
pub struct RendererHandle {
    document: DocumentId,
    overlay: watch::Receiver<Overlay>,
}

impl RendererHandle {
    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn overlay(&self) -> Overlay {
        *self.overlay.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Overlay> {
        self.overlay.clone()
    }
}

impl Renderer {
    /// Attach to `document`. `None` if it is closed or already has a live
    /// renderer, so injecting twice is harmless.
    pub fn mount(
        documents: &Documents,
        document: DocumentId,
    ) -> Option<(Renderer, RendererHandle)> {
        let inbox = documents.attach(document)?;
        let (tx, rx) = watch::channel(Overlay::Neutral);
        let renderer = Renderer {
            document,
            inbox,
            overlay: tx,
        };
        let handle = RendererHandle {
            document,
            overlay: rx,
        };
        Some((renderer, handle))
    }

    /// Apply one frame. Returns whether the overlay changed.
    pub fn apply(&self, frame: &[u8]) -> bool {
        let Ok(Incoming {
            alignment: Some(alignment),
        }) = serde_json::from_slice::<Incoming>(frame)
        else {
            return false;
        };
        let next = Overlay::from(alignment);
        self.overlay.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Runs until the document closes or navigates away.
    pub async fn run(mut self) {
        while let Some(frame) = self.inbox.recv().await {
            self.apply(&frame);
        }
        debug!(document = self.document, "renderer unmounted");
    }
}
