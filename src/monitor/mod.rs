//! Monitoring loop: sole owner of baseline, threshold and run-state.
//!
//! [`Monitor`] is the synchronous state machine. It never performs I/O and
//! answers every input with a list of [`Effect`]s. [`MonitorService`] drives
//! it from a timer, the control channel and inference completions, then
//! carries the effects out.

pub mod driver;
pub mod sampler;

pub use driver::{MonitorHandle, MonitorService};
pub use sampler::{extract_sample_y, Sampler, SamplerState, MIN_KEYPOINTS, SAMPLE_KEYPOINT};

use tracing::debug;

use crate::alignment::{
    alignment_state, classify, Alignment, AlignmentState, Calibration, DeviationThreshold, Sample,
};
use crate::config::{EmitPolicy, MonitorConfig};
use crate::protocol::{AlignmentEvent, ControlCommand};

pub const TITLE_ACTIVE: &str = "Slouch - Active Monitoring";
pub const TITLE_IDLE: &str = "Slouch - Options";
pub const BADGE_ON: &str = "ON";
pub const BADGE_OFF: &str = "OFF";

/// Whether the loop is sampling and from which camera.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub is_watching: bool,
    pub device_id: Option<String>,
}

/// Everything that may change monitor state.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMaxDeviation(f32),
    ResetBaseline,
    SetWatching(bool),
    SwitchDevice(String),
}

impl From<ControlCommand> for Command {
    fn from(cmd: ControlCommand) -> Self {
        match cmd {
            ControlCommand::SetMaxDeviation { max_deviation } => {
                Command::SetMaxDeviation(max_deviation)
            }
            ControlCommand::ResetBaseline => Command::ResetBaseline,
            ControlCommand::ToggleWatching { is_watching } => Command::SetWatching(is_watching),
            ControlCommand::SwitchDevice { device_id } => Command::SwitchDevice(device_id),
        }
    }
}

/// Side effects requested by the state machine, executed by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(AlignmentEvent),
    PushWatching(bool),
    Badge(&'static str),
    Title(&'static str),
    OpenCamera(String),
    CloseCamera,
}

pub struct Monitor {
    threshold: DeviationThreshold,
    calibration: Calibration,
    run: RunState,
    policy: EmitPolicy,
    last_emitted: Option<Alignment>,
    /// Samples classified since the verdict was last emitted.
    since_emit: u32,
    keepalive: u32,
    /// Bumped on every start and device switch; stale inferences compare against it.
    session: u64,
}

impl Monitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.threshold(),
            calibration: Calibration::new(),
            run: RunState::default(),
            policy: config.emit_policy,
            last_emitted: None,
            since_emit: 0,
            keepalive: config.keepalive_samples,
            session: 0,
        }
    }

    pub fn baseline(&self) -> Option<f32> {
        self.calibration.baseline()
    }

    pub fn threshold(&self) -> DeviationThreshold {
        self.threshold
    }

    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    pub fn is_watching(&self) -> bool {
        self.run.is_watching
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// State a sample at `y` would have right now.
    pub fn state_for(&self, y: f32) -> AlignmentState {
        alignment_state(y, self.baseline(), self.threshold)
    }

    /// Pick the camera without touching the run-state; used for the default
    /// device before anything has started.
    pub fn select_device(&mut self, device_id: &str) {
        if self.run.device_id.is_none() {
            self.run.device_id = Some(device_id.to_string());
        }
    }

    pub fn handle(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::SetMaxDeviation(value) => {
                match DeviationThreshold::new(value) {
                    Some(t) => self.threshold = t,
                    None => debug!(value, "ignoring non-positive max deviation"),
                }
                Vec::new()
            }
            Command::ResetBaseline => {
                if self.calibration.arm() {
                    self.last_emitted = None;
                    self.since_emit = 0;
                }
                Vec::new()
            }
            Command::SetWatching(true) if !self.run.is_watching => self.start(),
            Command::SetWatching(false) if self.run.is_watching => self.stop(),
            Command::SetWatching(_) => Vec::new(),
            Command::SwitchDevice(device_id) => self.switch_device(device_id),
        }
    }

    /// Calibrate if armed, classify and report. Ignored while stopped.
    pub fn observe(&mut self, sample: Sample) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.run.is_watching {
            return effects;
        }

        if let Some(baseline) = self.calibration.calibrate(&sample) {
            effects.push(Effect::Emit(AlignmentEvent::baseline(baseline)));
        }
        let Some(baseline) = self.calibration.baseline() else {
            return effects;
        };

        let verdict = classify(sample.y, baseline, self.threshold);
        let changed = self.last_emitted != Some(verdict);
        let keepalive_due = self.keepalive > 0 && self.since_emit >= self.keepalive;
        if changed || keepalive_due || self.policy == EmitPolicy::EveryTick {
            effects.push(Effect::Emit(AlignmentEvent::alignment(verdict)));
            self.last_emitted = Some(verdict);
            self.since_emit = 0;
        } else {
            self.since_emit += 1;
        }
        effects
    }

    /// An emitted event never reached the router; the next sample re-sends
    /// its verdict even if it has not changed.
    pub fn delivery_failed(&mut self) {
        self.last_emitted = None;
    }

    fn start(&mut self) -> Vec<Effect> {
        self.run.is_watching = true;
        self.session += 1;
        let mut effects = vec![
            Effect::Badge(BADGE_ON),
            Effect::Title(TITLE_ACTIVE),
            Effect::PushWatching(true),
        ];
        if let Some(device) = &self.run.device_id {
            effects.push(Effect::OpenCamera(device.clone()));
        }
        effects
    }

    fn stop(&mut self) -> Vec<Effect> {
        self.run.is_watching = false;
        self.reset_session_state();
        vec![
            Effect::CloseCamera,
            Effect::Badge(BADGE_OFF),
            Effect::Title(TITLE_IDLE),
            Effect::PushWatching(false),
        ]
    }

    /// Stop, reassign and restart as one step; badge and status stay put.
    fn switch_device(&mut self, device_id: String) -> Vec<Effect> {
        if self.run.device_id.as_deref() == Some(device_id.as_str()) {
            return Vec::new();
        }
        self.run.device_id = Some(device_id.clone());
        if !self.run.is_watching {
            return Vec::new();
        }
        self.reset_session_state();
        self.session += 1;
        vec![Effect::CloseCamera, Effect::OpenCamera(device_id)]
    }

    fn reset_session_state(&mut self) {
        self.calibration.arm();
        self.last_emitted = None;
        self.since_emit = 0;
    }
}
