pub mod detector;
pub mod keypoint;

pub use detector::KeypointSource;
pub use keypoint::{Keypoint, KeypointIndex, Pose};
