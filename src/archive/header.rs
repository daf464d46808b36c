//! EBS archive header
//!
//! The header is a fixed 512-byte block: compact JSON metadata followed by
//! NUL padding. Metadata may use at most 511 bytes so at least one pad byte
//! always terminates it.

use crate::config::SegmenterConfig;
use crate::error::ComputeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Size of the header block (bytes)
pub const HEADER_SIZE: usize = 512;

/// Largest encoded metadata that fits in the header
pub const MAX_METADATA_SIZE: usize = HEADER_SIZE - 1;

/// Byte used to pad the header after the metadata
pub const PAD_BYTE: u8 = 0x00;

/// Each sample is a little-endian IEEE-754 f32
pub const BYTES_PER_SAMPLE: usize = 4;

/// Format tag written into every header
pub const FORMAT_TAG: &str = "EBS";

/// Current header version
pub const FORMAT_VERSION: u32 = 1;

/// Session-level metadata written once at the start of an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format: String,
    pub version: u32,
    pub session_id: String,
    pub sample_rate: f64,
    pub channels: Vec<String>,
    pub window_samples: usize,
    /// Samples between consecutive window starts, when it differs from `window_samples`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_samples: Option<usize>,
    /// Stream time of the first window's first sample
    #[serde(default)]
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ArchiveHeader {
    pub fn new(
        session_id: impl Into<String>,
        sample_rate: f64,
        channels: Vec<String>,
        window_samples: usize,
    ) -> Self {
        Self {
            format: FORMAT_TAG.to_string(),
            version: FORMAT_VERSION,
            session_id: session_id.into(),
            sample_rate,
            channels,
            window_samples,
            step_samples: None,
            start_time: 0.0,
            created_at: None,
        }
    }

    /// Header describing the windows produced by a segmenter configuration
    pub fn from_config(config: &SegmenterConfig) -> Self {
        let mut header = Self::new(
            config.session_id.clone(),
            config.sample_rate,
            config.channels.clone(),
            config.window_samples,
        );
        if config.overlap_samples > 0 {
            header.step_samples = Some(config.step_samples());
        }
        header.created_at = Some(Utc::now());
        header
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn step(&self) -> usize {
        self.step_samples.unwrap_or(self.window_samples)
    }

    /// Bytes per serialized window: `window_samples × channels × 4`.
    ///
    /// Saturates instead of overflowing; `validate` rejects any header whose
    /// window size does not fit, so decoded headers never saturate.
    pub fn window_bytes(&self) -> usize {
        self.checked_window_bytes().unwrap_or(usize::MAX)
    }

    /// Byte offset of window `index`
    pub fn window_offset(&self, index: u64) -> u64 {
        (self.window_bytes() as u64)
            .saturating_mul(index)
            .saturating_add(HEADER_SIZE as u64)
    }

    /// Window size in bytes, if it is representable as both `usize` and `u64`
    fn checked_window_bytes(&self) -> Option<usize> {
        let bytes = self
            .window_samples
            .checked_mul(self.channel_count())?
            .checked_mul(BYTES_PER_SAMPLE)?;
        u64::try_from(bytes).ok()?;
        Some(bytes)
    }

    /// Reconstructed start time of window `index`
    pub fn window_start_time(&self, index: u64) -> f64 {
        self.start_time + (index as f64 * self.step() as f64) / self.sample_rate
    }

    /// Encode into the fixed 512-byte block
    pub fn encode(&self) -> Result<Vec<u8>, ComputeError> {
        self.validate()?;
        let metadata = serde_json::to_vec(self)?;
        if metadata.len() > MAX_METADATA_SIZE {
            return Err(ComputeError::HeaderOverflowError {
                size: metadata.len(),
                limit: MAX_METADATA_SIZE,
            });
        }
        let mut block = metadata;
        block.resize(HEADER_SIZE, PAD_BYTE);
        Ok(block)
    }

    /// Decode a 512-byte header block
    pub fn decode(block: &[u8]) -> Result<Self, ComputeError> {
        if block.len() != HEADER_SIZE {
            return Err(ComputeError::FormatError(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                block.len()
            )));
        }
        let end = block
            .iter()
            .position(|b| *b == PAD_BYTE)
            .ok_or_else(|| ComputeError::FormatError("header metadata is not terminated".to_string()))?;
        if block[end..].iter().any(|b| *b != PAD_BYTE) {
            return Err(ComputeError::FormatError(
                "header padding contains non-pad bytes".to_string(),
            ));
        }
        let header: ArchiveHeader = serde_json::from_slice(&block[..end])
            .map_err(|e| ComputeError::FormatError(format!("header metadata is not valid: {e}")))?;
        if header.format != FORMAT_TAG {
            return Err(ComputeError::FormatError(format!(
                "unknown format tag '{}'",
                header.format
            )));
        }
        if header.version != FORMAT_VERSION {
            return Err(ComputeError::FormatError(format!(
                "unsupported header version {}",
                header.version
            )));
        }
        header
            .validate()
            .map_err(|e| ComputeError::FormatError(e.to_string()))?;
        Ok(header)
    }

    /// Check that this archive matches the active segmenter configuration
    pub fn check_schema(&self, config: &SegmenterConfig) -> Result<(), ComputeError> {
        if self.channels != config.channels {
            return Err(ComputeError::SchemaMismatchError(format!(
                "archive channels {:?} differ from session channels {:?}",
                self.channels, config.channels
            )));
        }
        if self.window_samples != config.window_samples {
            return Err(ComputeError::SchemaMismatchError(format!(
                "archive windows hold {} samples, session uses {}",
                self.window_samples, config.window_samples
            )));
        }
        if self.sample_rate != config.sample_rate {
            return Err(ComputeError::SchemaMismatchError(format!(
                "archive sample rate {} Hz differs from session rate {} Hz",
                self.sample_rate, config.sample_rate
            )));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ComputeError> {
        if self.channels.is_empty() {
            return Err(ComputeError::SchemaMismatchError(
                "archive must declare at least one channel".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.channels.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(ComputeError::SchemaMismatchError(format!(
                "archive channel '{dup}' is declared twice"
            )));
        }
        if self.window_samples == 0 {
            return Err(ComputeError::SchemaMismatchError(
                "archive windows must hold at least one sample".to_string(),
            ));
        }
        if self.checked_window_bytes().is_none() {
            return Err(ComputeError::SchemaMismatchError(format!(
                "{} samples × {} channels does not fit in an addressable window",
                self.window_samples,
                self.channel_count()
            )));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ComputeError::SchemaMismatchError(format!(
                "archive sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }
}
