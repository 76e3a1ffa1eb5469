use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::alignment::{DeviationThreshold, DEFAULT_MAX_DEVIATION};

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// When the monitoring loop emits an `{alignment}` event.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmitPolicy {
    /// Only when the verdict differs from the last one emitted.
    #[default]
    OnTransition,
    /// After every classified sample.
    EveryTick,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Sampling period in milliseconds
    #[serde(default = "default_detection_rate_ms")]
    pub detection_rate_ms: u64,
    /// Initial allowed deviation from the baseline (pixels)
    #[serde(default = "default_max_deviation")]
    pub max_deviation: f32,
    #[serde(default)]
    pub emit_policy: EmitPolicy,
    /// Under `on_transition`, re-send an unchanged verdict after this many
    /// suppressed samples (0 disables)
    #[serde(default = "default_keepalive_samples")]
    pub keepalive_samples: u32,
}

fn default_detection_rate_ms() -> u64 { 100 }
fn default_max_deviation() -> f32 { DEFAULT_MAX_DEVIATION }
fn default_keepalive_samples() -> u32 { 20 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            detection_rate_ms: default_detection_rate_ms(),
            max_deviation: default_max_deviation(),
            emit_policy: EmitPolicy::default(),
            keepalive_samples: default_keepalive_samples(),
        }
    }
}

impl MonitorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.detection_rate_ms.max(1))
    }

    /// Configured threshold, or the default when the value is not positive.
    pub fn threshold(&self) -> DeviationThreshold {
        DeviationThreshold::new(self.max_deviation).unwrap_or_else(|| {
            tracing::warn!(
                max_deviation = self.max_deviation,
                "max_deviation must be positive; using default"
            );
            DeviationThreshold::default()
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Document URL schemes that receive alignment broadcasts
    #[serde(default = "default_url_schemes")]
    pub url_schemes: Vec<String>,
}

fn default_url_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url_schemes: default_url_schemes(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{e:#}; using default config");
                Self::default()
            }
        }
    }
}
