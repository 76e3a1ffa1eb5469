use crate::pose::{KeypointIndex, Pose};

/// Keypoint whose vertical position drives the alignment signal.
pub const SAMPLE_KEYPOINT: KeypointIndex = KeypointIndex::RightEye;
/// Minimum keypoints the first pose must carry to be usable.
pub const MIN_KEYPOINTS: usize = 3;

/// Re-entrancy guard around the asynchronous keypoint call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerState {
    #[default]
    Idle,
    Sampling,
}

/// Tracks whether an inference is outstanding and counts skipped ticks.
#[derive(Debug, Default)]
pub struct Sampler {
    state: SamplerState,
    skipped: u64,
}

impl Sampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Claim the sampler for one inference. Returns `false` (and counts a
    /// skipped tick) while a previous inference is still running.
    pub fn try_begin(&mut self) -> bool {
        match self.state {
            SamplerState::Idle => {
                self.state = SamplerState::Sampling;
                true
            }
            SamplerState::Sampling => {
                self.skipped += 1;
                false
            }
        }
    }

    /// Release after the inference settled, successfully or not.
    pub fn finish(&mut self) {
        self.state = SamplerState::Idle;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Vertical coordinate of the designated keypoint of the first pose.
pub fn extract_sample_y(poses: &[Pose]) -> Option<f32> {
    let pose = poses.first()?;
    if pose.len() < MIN_KEYPOINTS {
        return None;
    }
    let y = pose.get(SAMPLE_KEYPOINT)?.y;
    y.is_finite().then_some(y)
}
