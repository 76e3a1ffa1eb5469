//! Threshold classifier and baseline calibration.
//!
//! Everything here is pure: no I/O, no clocks.

use serde::{Deserialize, Serialize};

/// Default allowed vertical deviation, in frame pixels.
pub const DEFAULT_MAX_DEVIATION: f32 = 25.0;

/// Verdict for one sample once a baseline exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Good,
    Bad,
}

/// Alignment as seen from outside the classifier: `Unset` until calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentState {
    Unset,
    Good,
    Bad,
}

impl From<Alignment> for AlignmentState {
    fn from(a: Alignment) -> Self {
        match a {
            Alignment::Good => AlignmentState::Good,
            Alignment::Bad => AlignmentState::Bad,
        }
    }
}

/// One vertical coordinate taken from the designated keypoint.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub y: f32,
}

impl Sample {
    pub fn new(y: f32) -> Self {
        Self { y }
    }
}

/// Strictly positive deviation threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationThreshold(f32);

impl DeviationThreshold {
    /// Returns `None` for zero, negative or non-finite values.
    pub fn new(value: f32) -> Option<Self> {
        (value.is_finite() && value > 0.0).then_some(Self(value))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for DeviationThreshold {
    fn default() -> Self {
        Self(DEFAULT_MAX_DEVIATION)
    }
}

/// `Bad` iff `|y - baseline| > threshold`; the boundary itself is `Good`.
pub fn classify(y: f32, baseline: f32, threshold: DeviationThreshold) -> Alignment {
    let deviation = (y - baseline).abs();
    if deviation > threshold.get() {
        Alignment::Bad
    } else {
        Alignment::Good
    }
}

/// Derived state for a sample against an optional baseline.
pub fn alignment_state(
    y: f32,
    baseline: Option<f32>,
    threshold: DeviationThreshold,
) -> AlignmentState {
    match baseline {
        Some(b) => classify(y, b, threshold).into(),
        None => AlignmentState::Unset,
    }
}

/// Baseline holder. Set once per arm cycle by the first sample offered.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    baseline: Option<f32>,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }

    /// Clear the baseline so the next sample recalibrates.
    /// Returns `false` when it was already unset.
    pub fn arm(&mut self) -> bool {
        self.baseline.take().is_some()
    }

    /// Adopt `sample` as the baseline if armed. Returns the new baseline
    /// only when this call set it.
    pub fn calibrate(&mut self, sample: &Sample) -> Option<f32> {
        if self.baseline.is_some() || !sample.y.is_finite() {
            return None;
        }
        self.baseline = Some(sample.y);
        self.baseline
    }
}
