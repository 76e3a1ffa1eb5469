//! Relay router: fans alignment events out to every eligible document.
//!
//! Holds no alignment state. Each frame is validated, then delivered to each
//! destination independently; a failed destination is logged and skipped.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::monitor::BADGE_OFF;
use crate::protocol::{self, AlignmentEvent, RELAY_CHANNEL};
use crate::runtime::{Documents, Hub, Port};

/// Outcome of one broadcast, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    pub targets: usize,
    pub delivered: usize,
}

#[derive(Clone)]
pub struct RelayRouter {
    documents: Documents,
    schemes: Arc<[String]>,
}

impl RelayRouter {
    pub fn new(documents: Documents, config: &RelayConfig) -> Self {
        Self {
            documents,
            schemes: config.url_schemes.clone().into(),
        }
    }

    /// Deliver `frame` to every open document in scope.
    pub fn broadcast(&self, frame: &Bytes) -> BroadcastReport {
        let targets = self.documents.query(&self.schemes);
        let mut report = BroadcastReport {
            targets: targets.len(),
            delivered: 0,
        };
        for id in targets {
            match self.documents.send_message(id, frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => debug!(document = id, "delivery skipped: {e:#}"),
            }
        }
        report
    }

    /// Accept monitoring loops on the relay channel until `shutdown`.
    pub async fn run(self, hub: Hub, shutdown: CancellationToken) {
        hub.set_badge_text(BADGE_OFF);
        let mut listener = hub.listen(RELAY_CHANNEL);
        info!(channel = RELAY_CHANNEL, schemes = ?self.schemes, "relay router listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let Some(port) = accepted else { break };
                    debug!("monitoring loop connected");
                    tokio::spawn(self.clone().serve(port, shutdown.clone()));
                }
            }
        }
        info!("relay router stopped");
    }

    async fn serve(self, mut port: Port, shutdown: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = port.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = protocol::decode::<AlignmentEvent>(&frame) {
                debug!("dropping relay frame: {e:#}");
                continue;
            }
            let report = self.broadcast(&frame);
            debug!(targets = report.targets, delivered = report.delivered, "event relayed");
        }
        debug!("relay port closed");
    }
}
