//! Per-window signal conditioning
//!
//! Optional and applied only on the feature/detector path; archived windows
//! are always the raw segmenter output. Each window is filtered from a zero
//! state so the result depends on the window contents alone.

use crate::config::PreprocessConfig;
use crate::error::ComputeError;
use crate::types::Window;
use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Quality factor of the notch filter
const NOTCH_Q: f64 = 30.0;

/// Second-order IIR section (RBJ cookbook coefficients, a0 normalized to 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn normalized(b: [f64; 3], a: [f64; 3]) -> Self {
        Self {
            b0: b[0] / a[0],
            b1: b[1] / a[0],
            b2: b[2] / a[0],
            a1: a[1] / a[0],
            a2: a[2] / a[0],
        }
    }

    pub fn low_pass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let alpha = w0.sin() / (2.0 * FRAC_1_SQRT_2);
        let cos = w0.cos();
        Self::normalized(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    pub fn high_pass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let alpha = w0.sin() / (2.0 * FRAC_1_SQRT_2);
        let cos = w0.cos();
        Self::normalized(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    pub fn notch(center: f64, sample_rate: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * center / sample_rate;
        let alpha = w0.sin() / (2.0 * q);
        let cos = w0.cos();
        Self::normalized([1.0, -2.0 * cos, 1.0], [1.0 + alpha, -2.0 * cos, 1.0 - alpha])
    }

    /// Filter a signal in place, direct form II transposed
    pub fn apply(&self, signal: &mut [f64]) {
        let (mut z1, mut z2) = (0.0, 0.0);
        for x in signal.iter_mut() {
            let y = self.b0 * *x + z1;
            z1 = self.b1 * *x - self.a1 * y + z2;
            z2 = self.b2 * *x - self.a2 * y;
            *x = y;
        }
    }
}

/// Common-average reference plus band-pass and notch filtering
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
    stages: Vec<Biquad>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig, sample_rate: f64) -> Result<Self, ComputeError> {
        config.validate(sample_rate)?;
        let mut stages = vec![
            Biquad::high_pass(config.low_hz, sample_rate),
            Biquad::low_pass(config.high_hz, sample_rate),
        ];
        if config.notch_hz > 0.0 {
            stages.push(Biquad::notch(config.notch_hz, sample_rate, NOTCH_Q));
        }
        Ok(Self { config, stages })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Conditioned copy of a window; a disabled preprocessor returns it unchanged
    pub fn apply(&self, window: &Window) -> Window {
        if !self.config.enabled {
            return window.clone();
        }

        let len = window.window_samples();
        let mut channels: Vec<Vec<f64>> = window
            .samples
            .iter()
            .map(|c| c.iter().map(|&s| s as f64).collect())
            .collect();

        if self.config.common_average && channels.len() > 1 {
            let count = channels.len() as f64;
            for i in 0..len {
                let mean = channels.iter().map(|c| c[i]).sum::<f64>() / count;
                for channel in &mut channels {
                    channel[i] -= mean;
                }
            }
        }

        for channel in &mut channels {
            for stage in &self.stages {
                stage.apply(channel);
            }
        }

        Window {
            samples: channels
                .into_iter()
                .map(|c| c.into_iter().map(|s| s as f32).collect())
                .collect(),
            ..window.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tone(freq: f64, rate: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f64 / rate).sin())
            .collect()
    }

    /// RMS over the second half, after the filter has settled
    fn settled_rms(signal: &[f64]) -> f64 {
        let tail = &signal[signal.len() / 2..];
        (tail.iter().map(|v| v * v).sum::<f64>() / tail.len() as f64).sqrt()
    }

    #[test]
    fn test_notch_removes_line_noise() {
        let notch = Biquad::notch(60.0, 512.0, NOTCH_Q);
        let mut hum = tone(60.0, 512.0, 4096);
        notch.apply(&mut hum);
        assert!(settled_rms(&hum) < 0.05);

        let mut alpha = tone(10.0, 512.0, 4096);
        notch.apply(&mut alpha);
        assert!(settled_rms(&alpha) > 0.65);
    }

    #[test]
    fn test_band_pass_attenuates_out_of_band() {
        let config = PreprocessConfig {
            enabled: true,
            common_average: false,
            ..Default::default()
        };
        let pre = Preprocessor::new(config, 512.0).unwrap();
        let mut high = tone(150.0, 512.0, 4096);
        let mut pass = tone(10.0, 512.0, 4096);
        for stage in &pre.stages {
            stage.apply(&mut high);
            stage.apply(&mut pass);
        }
        assert!(settled_rms(&high) < 0.15);
        assert!(settled_rms(&pass) > 0.6);
    }

    #[test]
    fn test_common_average_removes_shared_signal() {
        let config = PreprocessConfig {
            enabled: true,
            ..Default::default()
        };
        let pre = Preprocessor::new(config, 256.0).unwrap();
        let shared: Vec<f32> = tone(10.0, 256.0, 512).iter().map(|v| *v as f32).collect();
        let window = Window {
            session_id: "p".into(),
            channels: Arc::from(vec!["A".to_string(), "B".to_string()]),
            samples: vec![shared.clone(), shared],
            start_time: 0.0,
            sample_rate: 256.0,
        };
        let out = pre.apply(&window);
        assert!(out.samples.iter().flatten().all(|v| v.abs() < 1e-6));
        assert_eq!(out.start_time, window.start_time);
    }

    #[test]
    fn test_disabled_is_identity() {
        let pre = Preprocessor::new(PreprocessConfig::default(), 256.0).unwrap();
        let window = Window {
            session_id: "p".into(),
            channels: Arc::from(vec!["A".to_string()]),
            samples: vec![vec![1.0, 2.0, 3.0]],
            start_time: 1.0,
            sample_rate: 256.0,
        };
        assert_eq!(pre.apply(&window), window);
    }

    #[test]
    fn test_cutoffs_validated_against_nyquist() {
        let config = PreprocessConfig {
            enabled: true,
            high_hz: 200.0,
            ..Default::default()
        };
        assert!(Preprocessor::new(config, 256.0).is_err());
    }
}
