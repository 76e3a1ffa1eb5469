use anyhow::Result;
use futures::future::BoxFuture;

use super::keypoint::Pose;
use crate::camera::Frame;

/// Opaque pose estimator: frame in, zero or more poses out.
///
/// The returned future owns everything it needs so the monitoring loop can
/// run it detached and keep servicing commands while inference is pending.
pub trait KeypointSource: Send + Sync {
    fn estimate(&self, frame: Frame) -> BoxFuture<'static, Result<Vec<Pose>>>;
}
