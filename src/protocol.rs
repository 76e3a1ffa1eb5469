//! Wire messages exchanged over ports.
//!
//! JSON on the wire so every context can decode defensively and drop frames
//! it does not understand.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::alignment::Alignment;
use crate::runtime::{PortReceiver, PortSender};

/// Monitoring loop → relay router.
pub const RELAY_CHANNEL: &str = "relay-detection";
/// Control surface ⇄ monitoring loop.
pub const CONTROL_CHANNEL: &str = "set-options";

// --- Alignment events (monitoring → router → renderer) ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BaselineSet {
    pub baseline: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AlignmentChanged {
    pub alignment: Alignment,
}

/// `{baseline}` or `{alignment}`, never both.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
pub enum AlignmentEvent {
    Baseline(BaselineSet),
    Alignment(AlignmentChanged),
}

impl AlignmentEvent {
    pub fn baseline(baseline: f32) -> Self {
        Self::Baseline(BaselineSet { baseline })
    }

    pub fn alignment(alignment: Alignment) -> Self {
        Self::Alignment(AlignmentChanged { alignment })
    }
}

// --- Control channel ---

/// Control surface → monitoring loop.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    SetMaxDeviation {
        #[serde(rename = "MAX_DEVIATION")]
        max_deviation: f32,
    },
    ResetBaseline,
    ToggleWatching {
        #[serde(rename = "isWatching")]
        is_watching: bool,
    },
    SwitchDevice {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
}

/// Monitoring loop → control surface.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusPush {
    SetIsWatching {
        #[serde(rename = "isWatching")]
        is_watching: bool,
    },
    SetIsPanelOpen {
        #[serde(rename = "isPanelOpen")]
        is_panel_open: bool,
    },
}

// --- Codec helpers ---

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    let data = serde_json::to_vec(msg).context("failed to encode message")?;
    Ok(Bytes::from(data))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).context("malformed message")
}

/// Encode and post. `false` if encoding failed or the far end is gone.
pub fn send_message<T: Serialize>(port: &PortSender, msg: &T) -> bool {
    match encode(msg) {
        Ok(frame) => port.post(frame),
        Err(e) => {
            tracing::warn!(channel = port.name(), "{e:#}");
            false
        }
    }
}

/// `None` once the channel is closed; `Some(Err)` for an undecodable frame.
pub async fn recv_message<T: DeserializeOwned>(port: &mut PortReceiver) -> Option<Result<T>> {
    let frame = port.recv().await?;
    Some(decode(&frame))
}
