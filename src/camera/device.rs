use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Media device kind as reported by the device enumeration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl MediaDeviceInfo {
    pub fn video(device_id: &str, label: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            label: label.to_string(),
            kind: DeviceKind::VideoInput,
        }
    }

    /// Label shown in a device picker; unnamed devices get a 1-based fallback.
    pub fn display_label(&self, position: usize) -> String {
        if self.label.is_empty() {
            format!("Device {}", position + 1)
        } else {
            self.label.clone()
        }
    }
}

/// Keep only cameras, preserving enumeration order.
pub fn video_inputs(devices: Vec<MediaDeviceInfo>) -> Vec<MediaDeviceInfo> {
    devices
        .into_iter()
        .filter(|d| d.kind == DeviceKind::VideoInput)
        .collect()
}

/// Opaque video frame handed to the keypoint source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// An opened camera. `current_frame` is `None` until the stream is ready.
pub trait VideoSource: Send {
    fn current_frame(&self) -> Option<Frame>;
}

/// Device acquisition boundary.
pub trait CameraBackend: Send + Sync {
    fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>>;
    fn open(&self, device_id: &str) -> Result<Box<dyn VideoSource>>;
}
