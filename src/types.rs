//! Core types for the errp-flux closed loop
//!
//! This module defines the data structures that flow through each stage of the
//! loop: raw sample chunks, windows, feature vectors, decision markers, error
//! signal events and the interventions published back to the delivery layer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A chunk of raw samples as delivered by the acquisition layer.
///
/// `samples` is channel-major: `samples[c][i]` is sample `i` of channel `c`.
/// `timestamp` is the arrival time (stream clock, seconds) of sample 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleChunk {
    pub timestamp: f64,
    pub samples: Vec<Vec<f32>>,
}

impl SampleChunk {
    pub fn new(timestamp: f64, samples: Vec<Vec<f32>>) -> Self {
        Self { timestamp, samples }
    }

    /// Build a chunk from frame-major data (`frames[i][c]`), the layout most
    /// acquisition devices deliver.
    pub fn from_frames(timestamp: f64, frames: &[Vec<f32>], channel_count: usize) -> Self {
        let mut samples = vec![Vec::with_capacity(frames.len()); channel_count];
        for frame in frames {
            for (c, channel) in samples.iter_mut().enumerate() {
                channel.push(frame.get(c).copied().unwrap_or(f32::NAN));
            }
        }
        Self { timestamp, samples }
    }

    pub fn channel_count(&self) -> usize {
        self.samples.len()
    }

    /// Number of samples per channel (0 for a chunk without channels)
    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity of a window for duplicate suppression: session plus the exact bit
/// pattern of its start timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub session_id: String,
    pub start_bits: u64,
}

impl WindowKey {
    pub fn start_time(&self) -> f64 {
        f64::from_bits(self.start_bits)
    }
}

/// A fixed-length multichannel slice of the sample stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Session this window belongs to
    pub session_id: String,
    /// Channel names in session order
    pub channels: Arc<[String]>,
    /// Samples, `channels.len()` rows of `window_samples` each
    pub samples: Vec<Vec<f32>>,
    /// Arrival time of the first sample (stream clock, seconds)
    pub start_time: f64,
    /// Sampling rate (Hz)
    pub sample_rate: f64,
}

impl Window {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel
    pub fn window_samples(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    /// Window duration in seconds
    pub fn duration(&self) -> f64 {
        self.window_samples() as f64 / self.sample_rate
    }

    /// Stream time of sample `index`
    pub fn sample_time(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.sample_rate
    }

    /// Stream time just past the last sample
    pub fn end_time(&self) -> f64 {
        self.sample_time(self.window_samples())
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            session_id: self.session_id.clone(),
            start_bits: self.start_time.to_bits(),
        }
    }

    /// Samples of a named channel
    pub fn channel(&self, name: &str) -> Option<&[f32]> {
        self.channels
            .iter()
            .position(|c| c == name)
            .map(|idx| self.samples[idx].as_slice())
    }
}

/// Why a channel could not produce meaningful features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateKind {
    /// The channel contains NaN or infinite samples
    NonFinite,
    /// The channel has no variance (e.g. all zeros, disconnected electrode)
    Flat,
}

/// A channel flagged during feature extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegenerateChannel {
    pub channel: String,
    pub kind: DegenerateKind,
}

/// Per-window feature vector, `channels × bands` values in session channel order.
///
/// Features of degenerate channels are NaN and the channel is listed in
/// `degenerate`, so downstream consumers can detect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub start_time: f64,
    pub values: Vec<f64>,
    pub degenerate: Vec<DegenerateChannel>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every value is finite and no channel was flagged
    pub fn is_valid(&self) -> bool {
        self.degenerate.is_empty() && self.values.iter().all(|v| v.is_finite())
    }
}

/// Classifier output for one feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub label: u32,
    pub confidence: f64,
}

/// A decision emitted by the classifier, referencing the window it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMarker {
    pub id: Uuid,
    pub label: u32,
    pub confidence: f64,
    /// Decision time t0 (stream clock, seconds)
    pub timestamp: f64,
    /// Window the decision was computed from
    pub window: WindowKey,
}

impl StateMarker {
    /// Marker for a decision taken at the end of `window`
    pub fn for_window(window: &Window, decision: Decision) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: decision.label,
            confidence: decision.confidence,
            timestamp: window.end_time(),
            window: window.key(),
        }
    }
}

/// How an epoch was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The epoch completed and was scored
    Scored,
    /// The deadline passed first; the configured default was used
    Deadline,
    /// The scorer returned no usable probability; the configured default was used
    Unscorable,
}

impl Resolution {
    /// True when the probability is the configured default, not a score
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Resolution::Scored)
    }
}

/// Error probability observed after a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSignalEvent {
    pub marker_id: Uuid,
    /// Probability in [0, 1] that the decision was perceived as erroneous
    pub probability: f64,
    /// Stream time of resolution
    pub timestamp: f64,
    pub resolution: Resolution,
}

/// An arm chosen by the bandit, ready for the delivery layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub arm: usize,
    pub score: f64,
    /// Stream time of the context the arm was selected for
    pub timestamp: f64,
    /// Decision cycle that triggered this selection, if any
    pub marker_id: Option<Uuid>,
}
