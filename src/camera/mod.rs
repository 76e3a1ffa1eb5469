pub mod device;

pub use device::{video_inputs, CameraBackend, DeviceKind, Frame, MediaDeviceInfo, VideoSource};
