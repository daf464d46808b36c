//! Synthetic multichannel signal source
//!
//! Every channel carries a sinusoid with a frequency drawn uniformly from
//! 6–15 Hz plus Gaussian noise. The generator is seeded, so a given seed always
//! produces the same stream.

use crate::error::ComputeError;
use crate::types::SampleChunk;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Sinusoid amplitude (V)
pub const SYNTH_AMPLITUDE: f64 = 1e-5;

/// Noise standard deviation (V)
pub const SYNTH_NOISE_STD: f64 = 2e-6;

/// Seeded sinusoid-plus-noise generator yielding fixed-size chunks
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    sample_rate: f64,
    chunk_samples: usize,
    frequencies: Vec<f64>,
    noise: Normal<f64>,
    rng: StdRng,
    /// Index of the next sample to generate
    position: u64,
}

impl SyntheticSource {
    pub fn new(
        channels: usize,
        sample_rate: f64,
        chunk_samples: usize,
        seed: u64,
    ) -> Result<Self, ComputeError> {
        if channels == 0 || chunk_samples == 0 {
            return Err(ComputeError::InvalidConfig(
                "synthetic source needs at least one channel and one sample per chunk".to_string(),
            ));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ComputeError::InvalidConfig(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let frequencies = (0..channels).map(|_| rng.gen_range(6.0..15.0)).collect();
        let noise = Normal::new(0.0, SYNTH_NOISE_STD)
            .map_err(|e| ComputeError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            sample_rate,
            chunk_samples,
            frequencies,
            noise,
            rng,
            position: 0,
        })
    }

    /// Replace the noise level (V); zero gives clean sinusoids
    pub fn with_noise(mut self, std_dev: f64) -> Result<Self, ComputeError> {
        self.noise =
            Normal::new(0.0, std_dev).map_err(|e| ComputeError::InvalidConfig(e.to_string()))?;
        Ok(self)
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Stream time of the next sample
    pub fn clock(&self) -> f64 {
        self.position as f64 / self.sample_rate
    }

    /// Generate the next chunk of `samples` samples per channel
    pub fn next_chunk(&mut self, samples: usize) -> SampleChunk {
        let timestamp = self.clock();
        let start = self.position;
        let data = self
            .frequencies
            .iter()
            .map(|&freq| {
                (0..samples as u64)
                    .map(|i| {
                        let t = (start + i) as f64 / self.sample_rate;
                        let clean = SYNTH_AMPLITUDE * (2.0 * PI * freq * t).sin();
                        (clean + self.noise.sample(&mut self.rng)) as f32
                    })
                    .collect()
            })
            .collect();
        self.position += samples as u64;
        SampleChunk::new(timestamp, data)
    }
}

impl Iterator for SyntheticSource {
    type Item = SampleChunk;

    fn next(&mut self) -> Option<SampleChunk> {
        Some(self.next_chunk(self.chunk_samples))
    }
}
