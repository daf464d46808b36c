//! Session configuration
//!
//! Every component takes a plain config struct with sensible defaults.
//! `SessionConfig` bundles them and round-trips through JSON so a session can
//! be described in a single file.

use crate::error::ComputeError;
use crate::reward::RewardMapping;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Default sampling rate (Hz)
pub const DEFAULT_SAMPLE_RATE: f64 = 512.0;

/// Default window length: 7 s at 512 Hz
pub const DEFAULT_WINDOW_SAMPLES: usize = 3584;

/// Window segmentation parameters, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Opaque session identifier stamped on every window
    pub session_id: String,
    /// Ordered, unique channel names
    pub channels: Vec<String>,
    /// Sampling rate (Hz)
    pub sample_rate: f64,
    /// Window length L (samples)
    pub window_samples: usize,
    /// Overlap O between consecutive windows (samples), 0 <= O < L
    pub overlap_samples: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            channels: vec!["F3".to_string(), "F4".to_string()],
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_samples: DEFAULT_WINDOW_SAMPLES,
            overlap_samples: 0,
        }
    }
}

impl SegmenterConfig {
    pub fn new<S: Into<String>>(
        channels: impl IntoIterator<Item = S>,
        sample_rate: f64,
        window_samples: usize,
    ) -> Self {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            sample_rate,
            window_samples,
            ..Default::default()
        }
    }

    pub fn with_overlap(mut self, overlap_samples: usize) -> Self {
        self.overlap_samples = overlap_samples;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Step S = L - O between window starts
    pub fn step_samples(&self) -> usize {
        self.window_samples.saturating_sub(self.overlap_samples)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.channels.is_empty() {
            return Err(ComputeError::InvalidConfig(
                "at least one channel is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &self.channels {
            if name.is_empty() {
                return Err(ComputeError::InvalidConfig(
                    "channel names must be non-empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(ComputeError::InvalidConfig(format!(
                    "channel names must be unique, '{name}' repeats"
                )));
            }
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ComputeError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.window_samples == 0 {
            return Err(ComputeError::InvalidConfig(
                "window length must be at least one sample".to_string(),
            ));
        }
        if self.overlap_samples >= self.window_samples {
            return Err(ComputeError::InvalidConfig(format!(
                "overlap ({}) must be smaller than window length ({})",
                self.overlap_samples, self.window_samples
            )));
        }
        Ok(())
    }
}

/// A named frequency band `[low_hz, high_hz)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub name: String,
    pub low_hz: f64,
    pub high_hz: f64,
}

impl FrequencyBand {
    pub fn new(name: &str, low_hz: f64, high_hz: f64) -> Self {
        Self {
            name: name.to_string(),
            low_hz,
            high_hz,
        }
    }

    /// Canonical EEG bands: delta, theta, alpha, beta, gamma
    pub fn canonical() -> Vec<FrequencyBand> {
        vec![
            FrequencyBand::new("delta", 1.0, 4.0),
            FrequencyBand::new("theta", 4.0, 8.0),
            FrequencyBand::new("alpha", 8.0, 13.0),
            FrequencyBand::new("beta", 13.0, 30.0),
            FrequencyBand::new("gamma", 30.0, 45.0),
        ]
    }
}

/// How a feature vector is projected onto the bandit context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextProjection {
    /// Use the full `channels × bands` feature vector
    Full,
    /// Relative band power averaged across channels, one value per band
    BandMeans,
}

/// Feature extraction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub bands: Vec<FrequencyBand>,
    /// Welch segment length (samples)
    pub segment_samples: usize,
    /// Hop between Welch segments (samples)
    pub segment_step: usize,
    /// Channels whose variance falls below this are flagged flat
    pub flat_variance: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            bands: FrequencyBand::canonical(),
            segment_samples: 256,
            segment_step: 128,
            flat_variance: 1e-24,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.bands.is_empty() {
            return Err(ComputeError::InvalidConfig(
                "at least one frequency band is required".to_string(),
            ));
        }
        for band in &self.bands {
            if !(band.low_hz >= 0.0 && band.high_hz > band.low_hz) {
                return Err(ComputeError::InvalidConfig(format!(
                    "band '{}' must satisfy 0 <= low < high",
                    band.name
                )));
            }
        }
        if self.segment_samples < 2 || self.segment_step == 0 {
            return Err(ComputeError::InvalidConfig(
                "Welch segment must span at least two samples with a non-zero step".to_string(),
            ));
        }
        Ok(())
    }
}

/// Optional per-window signal conditioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub enabled: bool,
    /// Subtract the across-channel mean from every sample
    pub common_average: bool,
    /// Band-pass low cutoff (Hz)
    pub low_hz: f64,
    /// Band-pass high cutoff (Hz)
    pub high_hz: f64,
    /// Notch frequency (Hz), 0 disables
    pub notch_hz: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            common_average: true,
            low_hz: 0.5,
            high_hz: 40.0,
            notch_hz: 60.0,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self, sample_rate: f64) -> Result<(), ComputeError> {
        if !self.enabled {
            return Ok(());
        }
        let nyquist = sample_rate / 2.0;
        if !(self.low_hz > 0.0 && self.high_hz > self.low_hz && self.high_hz < nyquist) {
            return Err(ComputeError::InvalidConfig(format!(
                "band-pass {}-{} Hz must lie inside (0, {nyquist}) Hz",
                self.low_hz, self.high_hz
            )));
        }
        if self.notch_hz < 0.0 || self.notch_hz >= nyquist {
            return Err(ComputeError::InvalidConfig(format!(
                "notch {} Hz must lie below Nyquist ({nyquist} Hz)",
                self.notch_hz
            )));
        }
        Ok(())
    }
}

/// Error-signal detector timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Length of the post-decision epoch handed to the scorer (seconds)
    pub epoch_seconds: f64,
    /// Hard deadline Δ after the decision (seconds)
    pub deadline_seconds: f64,
    /// Probability emitted when the deadline passes first
    pub default_probability: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            epoch_seconds: 1.0,
            deadline_seconds: 1.5,
            default_probability: 0.5,
        }
    }
}

impl DetectorConfig {
    /// Δ as a wall-clock duration; saturates for values `validate` rejects
    pub fn deadline(&self) -> Duration {
        Duration::try_from_secs_f64(self.deadline_seconds).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        if !(self.epoch_seconds.is_finite() && self.epoch_seconds > 0.0) {
            return Err(ComputeError::InvalidConfig(
                "epoch length must be positive".to_string(),
            ));
        }
        if !(self.deadline_seconds.is_finite() && self.deadline_seconds >= self.epoch_seconds) {
            return Err(ComputeError::InvalidConfig(format!(
                "deadline ({} s) must not be shorter than the epoch ({} s)",
                self.deadline_seconds, self.epoch_seconds
            )));
        }
        if Duration::try_from_secs_f64(self.deadline_seconds).is_err() {
            return Err(ComputeError::InvalidConfig(format!(
                "deadline ({} s) is too large to schedule",
                self.deadline_seconds
            )));
        }
        if !(0.0..=1.0).contains(&self.default_probability) {
            return Err(ComputeError::InvalidConfig(format!(
                "default probability {} must lie in [0, 1]",
                self.default_probability
            )));
        }
        Ok(())
    }
}

/// LinUCB parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Number of intervention arms
    pub arms: usize,
    /// Ridge prior λ, each arm starts at A = λ·I
    pub lambda: f64,
    /// Exploration weight α
    pub alpha: f64,
    pub context: ContextProjection,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            arms: 3,
            lambda: 1.0,
            alpha: 1.0,
            context: ContextProjection::BandMeans,
        }
    }
}

impl BanditConfig {
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.arms == 0 {
            return Err(ComputeError::InvalidConfig(
                "the bandit needs at least one arm".to_string(),
            ));
        }
        if !(self.lambda.is_finite() && self.lambda > 0.0) {
            return Err(ComputeError::InvalidConfig(format!(
                "lambda must be positive, got {}",
                self.lambda
            )));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(ComputeError::InvalidConfig(format!(
                "alpha must be positive, got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Retry policy for stream subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Complete description of one closed-loop session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub segmenter: SegmenterConfig,
    pub features: FeatureConfig,
    pub preprocess: PreprocessConfig,
    pub detector: DetectorConfig,
    pub bandit: BanditConfig,
    pub reward: RewardMapping,
    /// Write every emitted window to this EBS archive
    pub archive_path: Option<PathBuf>,
    /// Capacity of each bounded stream queue
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            features: FeatureConfig::default(),
            preprocess: PreprocessConfig::default(),
            detector: DetectorConfig::default(),
            bandit: BanditConfig::default(),
            reward: RewardMapping::default(),
            archive_path: None,
            queue_capacity: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(segmenter: SegmenterConfig) -> Self {
        Self {
            segmenter,
            ..Default::default()
        }
    }

    pub fn with_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_path = Some(path.into());
        self
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_bandit(mut self, bandit: BanditConfig) -> Self {
        self.bandit = bandit;
        self
    }

    pub fn with_reward(mut self, reward: RewardMapping) -> Self {
        self.reward = reward;
        self
    }

    /// Dimensionality d of the bandit context for this session
    pub fn context_dimension(&self) -> usize {
        match self.bandit.context {
            ContextProjection::Full => self.segmenter.channel_count() * self.features.bands.len(),
            ContextProjection::BandMeans => self.features.bands.len(),
        }
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        self.segmenter.validate()?;
        self.features.validate()?;
        self.preprocess.validate(self.segmenter.sample_rate)?;
        self.detector.validate()?;
        self.bandit.validate()?;
        self.reward.validate()?;
        if self.queue_capacity == 0 {
            return Err(ComputeError::InvalidConfig(
                "stream queues need a capacity of at least one".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ComputeError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::new(SegmenterConfig::default());
        config.validate().unwrap();
        assert_eq!(config.segmenter.step_samples(), 3584);
        assert_eq!(config.context_dimension(), 5);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let config = SegmenterConfig::new(["F3"], 256.0, 128).with_overlap(128);
        assert!(matches!(
            config.validate(),
            Err(ComputeError::InvalidConfig(_))
        ));
        let config = SegmenterConfig::new(["F3"], 256.0, 128).with_overlap(127);
        assert_eq!(config.step_samples(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        let config = SegmenterConfig::new(["F3", "F4", "F3"], 256.0, 128);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'F3' repeats"));
    }

    #[test]
    fn test_deadline_shorter_than_epoch_rejected() {
        let config = DetectorConfig {
            epoch_seconds: 1.0,
            deadline_seconds: 0.5,
            default_probability: 0.5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unschedulable_deadline_rejected() {
        let config = DetectorConfig {
            deadline_seconds: 1e20,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ComputeError::InvalidConfig(_))
        ));
        assert_eq!(config.deadline(), Duration::MAX);

        let json = r#"{"segmenter":{"session_id":"s","channels":["A"],"sample_rate":128.0,"window_samples":128,"overlap_samples":0},"detector":{"epoch_seconds":1.0,"deadline_seconds":1e20,"default_probability":0.5}}"#;
        assert!(SessionConfig::from_json(json).is_err());
    }

    #[test]
    fn test_bandit_parameters_validated() {
        let mut config = BanditConfig::default();
        config.lambda = 0.0;
        assert!(config.validate().is_err());
        config.lambda = 1.0;
        config.arms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_full_projection_dimension() {
        let mut config = SessionConfig::new(SegmenterConfig::new(["F3", "F4", "Cz"], 256.0, 512));
        config.bandit.context = ContextProjection::Full;
        assert_eq!(config.context_dimension(), 15);
    }

    #[test]
    fn test_json_roundtrip_and_partial_documents() {
        let config = SessionConfig::new(SegmenterConfig::default().with_session_id("abc"));
        let json = config.to_json().unwrap();
        let loaded = SessionConfig::from_json(&json).unwrap();
        assert_eq!(loaded, config);

        let partial = r#"{
            "segmenter": {
                "session_id": "p1",
                "channels": ["Fz"],
                "sample_rate": 250.0,
                "window_samples": 1750,
                "overlap_samples": 500
            },
            "queue_capacity": 8
        }"#;
        let loaded = SessionConfig::from_json(partial).unwrap();
        assert_eq!(loaded.segmenter.step_samples(), 1250);
        assert_eq!(loaded.detector, DetectorConfig::default());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_millis(2_000));
    }
}
