//! Control surface client for the `set-options` channel.

use tracing::debug;

use crate::protocol::{self, ControlCommand, StatusPush, CONTROL_CHANNEL};
use crate::runtime::{Hub, PortReceiver, PortSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Options panel: issues commands and mirrors the status the monitoring
/// loop pushes back.
pub struct ControlPanel {
    tx: PortSender,
    rx: PortReceiver,
    closed: bool,
    is_watching: bool,
    is_panel_open: bool,
}

impl ControlPanel {
    pub fn connect(hub: &Hub) -> Self {
        let (tx, rx) = hub.connect(CONTROL_CHANNEL).split();
        Self {
            tx,
            rx,
            closed: false,
            is_watching: false,
            is_panel_open: false,
        }
    }

    pub fn state(&self) -> LinkState {
        if self.closed || !self.tx.is_connected() {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        }
    }

    pub fn is_watching(&self) -> bool {
        self.is_watching
    }

    pub fn is_panel_open(&self) -> bool {
        self.is_panel_open
    }

    /// Wait for the next status push and mirror it. `None` once the
    /// monitoring loop has gone away.
    pub async fn next_status(&mut self) -> Option<StatusPush> {
        loop {
            let Some(msg) = protocol::recv_message::<StatusPush>(&mut self.rx).await else {
                self.closed = true;
                return None;
            };
            match msg {
                Ok(push) => {
                    match push {
                        StatusPush::SetIsWatching { is_watching } => self.is_watching = is_watching,
                        StatusPush::SetIsPanelOpen { is_panel_open } => {
                            self.is_panel_open = is_panel_open
                        }
                    }
                    return Some(push);
                }
                Err(e) => debug!("ignoring status frame: {e:#}"),
            }
        }
    }

    pub fn set_max_deviation(&self, max_deviation: f32) -> bool {
        self.send(&ControlCommand::SetMaxDeviation { max_deviation })
    }

    pub fn reset_baseline(&self) -> bool {
        self.send(&ControlCommand::ResetBaseline)
    }

    pub fn toggle_watching(&self, is_watching: bool) -> bool {
        self.send(&ControlCommand::ToggleWatching { is_watching })
    }

    pub fn switch_device(&self, device_id: &str) -> bool {
        self.send(&ControlCommand::SwitchDevice {
            device_id: device_id.to_string(),
        })
    }

    fn send(&self, cmd: &ControlCommand) -> bool {
        self.state() == LinkState::Connected && protocol::send_message(&self.tx, cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_no_monitor_means_disconnected() {
        let hub = Hub::new();
        let panel = ControlPanel::connect(&hub);
        assert_eq!(panel.state(), LinkState::Disconnected);
        assert!(!panel.toggle_watching(true));
        assert!(!panel.reset_baseline());
    }

    #[tokio::test]
    async fn test_mirrors_pushes_and_sends_commands() {
        let hub = Hub::new();
        let mut listener = hub.listen(CONTROL_CHANNEL);
        let mut panel = ControlPanel::connect(&hub);
        let mut monitor_side = listener.accept().await.unwrap();
        assert_eq!(panel.state(), LinkState::Connected);

        let watching = protocol::encode(&StatusPush::SetIsWatching { is_watching: true }).unwrap();
        monitor_side.post(watching);
        monitor_side.post(Bytes::from_static(b"{\"action\":\"BOGUS\"}"));
        let panel_open =
            protocol::encode(&StatusPush::SetIsPanelOpen { is_panel_open: true }).unwrap();
        monitor_side.post(panel_open);

        assert_eq!(
            panel.next_status().await,
            Some(StatusPush::SetIsWatching { is_watching: true })
        );
        assert_eq!(
            panel.next_status().await,
            Some(StatusPush::SetIsPanelOpen { is_panel_open: true })
        );
        assert!(panel.is_watching());
        assert!(panel.is_panel_open());

        assert!(panel.set_max_deviation(40.0));
        assert!(panel.switch_device("cam-2"));
        let cmd: ControlCommand = protocol::decode(&monitor_side.recv().await.unwrap()).unwrap();
        assert_eq!(cmd, ControlCommand::SetMaxDeviation { max_deviation: 40.0 });
        let cmd: ControlCommand = protocol::decode(&monitor_side.recv().await.unwrap()).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::SwitchDevice {
                device_id: "cam-2".into()
            }
        );

        drop(monitor_side);
        assert_eq!(panel.next_status().await, None);
        assert_eq!(panel.state(), LinkState::Disconnected);
        assert!(!panel.toggle_watching(false));
    }
}
