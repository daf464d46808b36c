//! Feature extraction
//!
//! This module turns a window into a fixed-length feature vector:
//! - Welch power spectral density per channel (periodic Hann, mean detrend)
//! - Band power over each configured frequency band, as log10
//! - Concatenation in session channel order, `channels × bands` values
//!
//! Extraction is a pure function of the window contents. Channels that hold
//! non-finite samples or carry no variance produce NaN features and are listed
//! in `FeatureVector::degenerate`.

use crate::config::{ContextProjection, FeatureConfig};
use crate::error::ComputeError;
use crate::types::{DegenerateChannel, DegenerateKind, FeatureVector, Window};
use std::f64::consts::PI;

/// Band power floor (V²) before taking log10, keeps empty bands finite
const POWER_FLOOR: f64 = 1e-30;

/// Feature extractor for band-power features
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            config: FeatureConfig::default(),
        }
    }
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Result<Self, ComputeError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn bands_per_channel(&self) -> usize {
        self.config.bands.len()
    }

    /// Feature dimensionality for a session with `channels` channels
    pub fn dimension(&self, channels: usize) -> usize {
        channels * self.bands_per_channel()
    }

    /// Extract the feature vector of a window
    pub fn extract(&self, window: &Window) -> FeatureVector {
        let bands = self.bands_per_channel();
        let mut values = Vec::with_capacity(self.dimension(window.channel_count()));
        let mut degenerate = Vec::new();

        for (name, samples) in window.channels.iter().zip(&window.samples) {
            match self.band_powers(samples, window.sample_rate) {
                Ok(powers) => {
                    values.extend(powers.iter().map(|p| p.max(POWER_FLOOR).log10()));
                }
                Err(kind) => {
                    values.extend(std::iter::repeat(f64::NAN).take(bands));
                    degenerate.push(DegenerateChannel {
                        channel: name.clone(),
                        kind,
                    });
                }
            }
        }

        FeatureVector {
            start_time: window.start_time,
            values,
            degenerate,
        }
    }

    /// Absolute band power of one channel, one value per configured band
    pub fn band_powers(&self, samples: &[f32], sample_rate: f64) -> Result<Vec<f64>, DegenerateKind> {
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(DegenerateKind::NonFinite);
        }
        if samples.len() < 2 || variance(samples) <= self.config.flat_variance {
            return Err(DegenerateKind::Flat);
        }

        let psd = welch_psd(
            samples,
            sample_rate,
            self.config.segment_samples.min(samples.len()),
            self.config.segment_step,
            self.max_frequency(),
        );
        let resolution = psd.resolution;

        Ok(self
            .config
            .bands
            .iter()
            .map(|band| {
                psd.density
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| {
                        let freq = *k as f64 * resolution;
                        freq >= band.low_hz && freq < band.high_hz
                    })
                    .map(|(_, d)| d * resolution)
                    .sum()
            })
            .collect())
    }

    fn max_frequency(&self) -> f64 {
        self.config
            .bands
            .iter()
            .map(|b| b.high_hz)
            .fold(0.0, f64::max)
    }
}

/// Project a feature vector onto a bandit context.
///
/// Returns `None` for degenerate feature vectors so no context is ever built
/// from misleading features.
pub fn project_context(
    features: &FeatureVector,
    bands: usize,
    projection: ContextProjection,
) -> Option<Vec<f64>> {
    if !features.is_valid() || bands == 0 || features.len() % bands != 0 {
        return None;
    }
    match projection {
        ContextProjection::Full => Some(features.values.clone()),
        ContextProjection::BandMeans => {
            let channels = features.len() / bands;
            let mut means = vec![0.0; bands];
            for row in features.values.chunks(bands) {
                let linear: Vec<f64> = row.iter().map(|v| 10f64.powf(*v)).collect();
                let total: f64 = linear.iter().sum();
                for (mean, power) in means.iter_mut().zip(&linear) {
                    *mean += power / total;
                }
            }
            for mean in &mut means {
                *mean /= channels as f64;
            }
            Some(means)
        }
    }
}

/// One-sided PSD up to a cutoff frequency
struct Psd {
    /// Density per bin (V²/Hz), bin k at `k * resolution` Hz
    density: Vec<f64>,
    resolution: f64,
}

fn welch_psd(samples: &[f32], sample_rate: f64, segment: usize, step: usize, max_hz: f64) -> Psd {
    let resolution = sample_rate / segment as f64;
    let nyquist_bin = segment / 2;
    let bins = ((max_hz / resolution).ceil() as usize + 1).min(nyquist_bin + 1);

    let window: Vec<f64> = (0..segment)
        .map(|j| 0.5 - 0.5 * (2.0 * PI * j as f64 / segment as f64).cos())
        .collect();
    let window_energy: f64 = window.iter().map(|w| w * w).sum();
    let cos_table: Vec<f64> = (0..segment)
        .map(|m| (2.0 * PI * m as f64 / segment as f64).cos())
        .collect();
    let sin_table: Vec<f64> = (0..segment)
        .map(|m| (2.0 * PI * m as f64 / segment as f64).sin())
        .collect();

    let mut density = vec![0.0; bins];
    let mut segments = 0usize;
    let mut start = 0;
    let mut tapered = vec![0.0; segment];

    while start + segment <= samples.len() {
        let slice = &samples[start..start + segment];
        let mean = slice.iter().map(|&s| s as f64).sum::<f64>() / segment as f64;
        for (j, value) in tapered.iter_mut().enumerate() {
            *value = (slice[j] as f64 - mean) * window[j];
        }

        for (k, acc) in density.iter_mut().enumerate() {
            let mut re = 0.0;
            let mut im = 0.0;
            for (j, value) in tapered.iter().enumerate() {
                let m = (j * k) % segment;
                re += value * cos_table[m];
                im -= value * sin_table[m];
            }
            let mut power = (re * re + im * im) / (sample_rate * window_energy);
            if k != 0 && !(segment % 2 == 0 && k == nyquist_bin) {
                power *= 2.0;
            }
            *acc += power;
        }

        segments += 1;
        start += step;
    }

    if segments > 0 {
        for value in &mut density {
            *value /= segments as f64;
        }
    }

    Psd {
        density,
        resolution,
    }
}

fn variance(samples: &[f32]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
    samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}
