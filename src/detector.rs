//! Error-signal detection
//!
//! Every decision marker opens one observation epoch covering
//! `[t0, t0 + epoch_seconds)` on the stream clock. Samples are gathered from
//! incoming windows independently for each epoch, so overlapping epochs never
//! share or steal samples. An epoch resolves exactly once:
//!
//! - when all its samples have arrived, by asking the scorer
//! - when a window reaches past `t0 + deadline`, or `deadline` has elapsed on
//!   the wall clock since the marker was registered, with the configured
//!   default probability
//!
//! After `cancel` no further events are produced.

use crate::config::DetectorConfig;
use crate::error::ComputeError;
use crate::types::{ErrorSignalEvent, Resolution, StateMarker, Window};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Samples collected after one decision
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    pub marker_id: Uuid,
    /// Decision time (stream clock, seconds)
    pub t0: f64,
    pub sample_rate: f64,
    pub channels: Arc<[String]>,
    /// Channel-major samples, starting at `t0`
    pub samples: Vec<Vec<f32>>,
}

impl Epoch {
    /// Samples per channel
    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Average across channels, one value per sample
    pub fn channel_mean(&self) -> Vec<f64> {
        let count = self.samples.len().max(1) as f64;
        (0..self.len())
            .map(|i| self.samples.iter().map(|c| c[i] as f64).sum::<f64>() / count)
            .collect()
    }
}

/// Turns a completed epoch into an error probability.
///
/// Implementations may return any value; results outside [0, 1] are clamped
/// and non-finite results fall back to the configured default.
pub trait ErrorScorer: Send {
    fn score(&mut self, epoch: &Epoch) -> f64;
}

impl<F> ErrorScorer for F
where
    F: FnMut(&Epoch) -> f64 + Send,
{
    fn score(&mut self, epoch: &Epoch) -> f64 {
        self(epoch)
    }
}

/// Correlates the channel-mean epoch with a stereotyped error deflection:
/// a negative peak around 250 ms followed by a positive peak around 350 ms.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateScorer {
    /// Logistic slope applied to the correlation
    pub gain: f64,
    /// Correlation that maps to probability 0.5
    pub bias: f64,
}

impl Default for TemplateScorer {
    fn default() -> Self {
        Self {
            gain: 8.0,
            bias: 0.3,
        }
    }
}

impl TemplateScorer {
    /// Template sampled at `sample_rate` for `len` samples
    pub fn template(sample_rate: f64, len: usize) -> Vec<f64> {
        let bump = |t: f64, center: f64, width: f64| (-0.5 * ((t - center) / width).powi(2)).exp();
        (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate;
                bump(t, 0.35, 0.075) - bump(t, 0.25, 0.05)
            })
            .collect()
    }

    /// Pearson correlation between the channel-mean epoch and the template
    pub fn correlation(&self, epoch: &Epoch) -> f64 {
        let signal = epoch.channel_mean();
        let template = Self::template(epoch.sample_rate, signal.len());
        pearson(&signal, &template)
    }
}

impl ErrorScorer for TemplateScorer {
    fn score(&mut self, epoch: &Epoch) -> f64 {
        let r = self.correlation(epoch);
        1.0 / (1.0 + (-self.gain * (r - self.bias)).exp())
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return f64::NAN;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    // NaN for a flat epoch
    cov / (var_a * var_b).sqrt()
}

/// A marker waiting for its epoch
#[derive(Debug)]
struct PendingEpoch {
    marker: StateMarker,
    registered_at: Instant,
    required: usize,
    /// Epoch sample index expected next
    next: usize,
    epoch: Epoch,
}

/// Tracks outstanding decision epochs for one session
pub struct ErrorSignalDetector {
    config: DetectorConfig,
    scorer: Box<dyn ErrorScorer>,
    pending: Vec<PendingEpoch>,
    cancelled: bool,
}

impl fmt::Debug for ErrorSignalDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSignalDetector")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl ErrorSignalDetector {
    pub fn new(config: DetectorConfig, scorer: Box<dyn ErrorScorer>) -> Result<Self, ComputeError> {
        config.validate()?;
        Ok(Self {
            config,
            scorer,
            pending: Vec::new(),
            cancelled: false,
        })
    }

    /// Detector using the built-in template scorer
    pub fn with_template(config: DetectorConfig) -> Result<Self, ComputeError> {
        Self::new(config, Box::new(TemplateScorer::default()))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Number of unresolved epochs
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Open an epoch for a decision marker
    pub fn track(
        &mut self,
        marker: StateMarker,
        channels: Arc<[String]>,
        sample_rate: f64,
        registered_at: Instant,
    ) -> Result<(), ComputeError> {
        if self.cancelled {
            return Err(ComputeError::SessionClosed);
        }
        let required = ((self.config.epoch_seconds * sample_rate).round() as usize).max(1);
        debug!(
            marker_id = %marker.id,
            t0 = marker.timestamp,
            required,
            "Epoch opened"
        );
        let epoch = Epoch {
            marker_id: marker.id,
            t0: marker.timestamp,
            sample_rate,
            samples: vec![Vec::with_capacity(required); channels.len()],
            channels,
        };
        self.pending.push(PendingEpoch {
            marker,
            registered_at,
            required,
            next: 0,
            epoch,
        });
        Ok(())
    }

    /// Feed a window to every open epoch and return the epochs it resolved
    pub fn observe(&mut self, window: &Window) -> Vec<ErrorSignalEvent> {
        if self.cancelled {
            return Vec::new();
        }
        let deadline = self.config.deadline_seconds;
        let mut events = Vec::new();
        let mut open = Vec::with_capacity(self.pending.len());

        for mut pending in std::mem::take(&mut self.pending) {
            collect(&mut pending, window);
            if pending.next >= pending.required {
                events.push(self.score(pending));
            } else if window.end_time() > pending.epoch.t0 + deadline {
                events.push(self.fallback(&pending.marker, Resolution::Deadline));
            } else {
                open.push(pending);
            }
        }

        self.pending = open;
        events
    }

    /// Resolve epochs whose wall-clock deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<ErrorSignalEvent> {
        if self.cancelled {
            return Vec::new();
        }
        let deadline = self.config.deadline();
        let (expired, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now.saturating_duration_since(p.registered_at) >= deadline);
        self.pending = open;
        expired
            .iter()
            .map(|p| self.fallback(&p.marker, Resolution::Deadline))
            .collect()
    }

    /// Earliest wall-clock deadline among open epochs
    pub fn next_deadline(&self) -> Option<Instant> {
        let deadline = self.config.deadline();
        self.pending
            .iter()
            .filter_map(|p| p.registered_at.checked_add(deadline))
            .min()
    }

    /// Discard every open epoch; nothing is emitted afterwards.
    ///
    /// Returns the number of epochs discarded.
    pub fn cancel(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.cancelled = true;
        if discarded > 0 {
            info!(discarded, "Detector cancelled with open epochs");
        }
        discarded
    }

    fn score(&mut self, pending: PendingEpoch) -> ErrorSignalEvent {
        let probability = self.scorer.score(&pending.epoch);
        if !probability.is_finite() {
            warn!(
                marker_id = %pending.marker.id,
                "Scorer returned a non-finite probability, using default"
            );
            return self.fallback(&pending.marker, Resolution::Unscorable);
        }
        let probability = probability.clamp(0.0, 1.0);
        debug!(
            marker_id = %pending.marker.id,
            probability,
            "Epoch scored"
        );
        ErrorSignalEvent {
            marker_id: pending.marker.id,
            probability,
            timestamp: pending.epoch.t0 + self.config.epoch_seconds,
            resolution: Resolution::Scored,
        }
    }

    fn fallback(&self, marker: &StateMarker, resolution: Resolution) -> ErrorSignalEvent {
        debug!(
            marker_id = %marker.id,
            ?resolution,
            probability = self.config.default_probability,
            "Epoch resolved by fallback"
        );
        ErrorSignalEvent {
            marker_id: marker.id,
            probability: self.config.default_probability,
            timestamp: marker.timestamp + self.config.deadline_seconds,
            resolution,
        }
    }
}

/// Copy the window samples that belong to this epoch, skipping samples an
/// overlapping window already delivered. A gap in the stream stops
/// collection, leaving the epoch to its deadline.
fn collect(pending: &mut PendingEpoch, window: &Window) {
    let rate = pending.epoch.sample_rate;
    let t0 = pending.epoch.t0;
    if window.channel_count() != pending.epoch.samples.len() {
        return;
    }
    for i in 0..window.window_samples() {
        if pending.next >= pending.required {
            break;
        }
        let offset = ((window.sample_time(i) - t0) * rate).round();
        if offset < pending.next as f64 {
            continue;
        }
        if offset > pending.next as f64 {
            break;
        }
        for (epoch, channel) in pending.epoch.samples.iter_mut().zip(&window.samples) {
            epoch.push(channel[i]);
        }
        pending.next += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Decision;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const RATE: f64 = 100.0;

    fn channels() -> Arc<[String]> {
        Arc::from(vec!["Fz".to_string(), "Cz".to_string()])
    }

    /// Window of `len` samples starting at `start` whose values encode their time
    fn window(start: f64, len: usize) -> Window {
        let ramp: Vec<f32> = (0..len).map(|i| (start + i as f64 / RATE) as f32).collect();
        Window {
            session_id: "det".to_string(),
            channels: channels(),
            samples: vec![ramp.clone(), ramp],
            start_time: start,
            sample_rate: RATE,
        }
    }

    fn marker_at(start: f64, len: usize) -> StateMarker {
        StateMarker::for_window(
            &window(start, len),
            Decision {
                label: 1,
                confidence: 0.9,
            },
        )
    }

    fn detector(scorer: Box<dyn ErrorScorer>) -> ErrorSignalDetector {
        ErrorSignalDetector::new(DetectorConfig::default(), scorer).unwrap()
    }

    #[test]
    fn test_epoch_completes_and_is_scored() {
        let mut det = detector(Box::new(|epoch: &Epoch| {
            assert_eq!(epoch.len(), 100);
            assert_eq!(epoch.samples[0][0], 2.0);
            0.8
        }));
        let marker = marker_at(0.0, 200);
        let id = marker.id;
        det.track(marker, channels(), RATE, Instant::now()).unwrap();

        let events = det.observe(&window(2.0, 200));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].marker_id, id);
        assert_eq!(events[0].probability, 0.8);
        assert_eq!(events[0].resolution, Resolution::Scored);
        assert_eq!(det.pending(), 0);
    }

    #[test]
    fn test_epoch_spans_several_windows() {
        let mut det = detector(Box::new(|epoch: &Epoch| {
            let first = epoch.samples[0][0];
            let last = epoch.samples[0][99];
            assert!((first - 1.0).abs() < 1e-6);
            assert!((last - 1.99).abs() < 1e-5);
            0.1
        }));
        det.track(marker_at(0.0, 100), channels(), RATE, Instant::now())
            .unwrap();
        assert!(det.observe(&window(1.0, 40)).is_empty());
        assert!(det.observe(&window(1.4, 40)).is_empty());
        let events = det.observe(&window(1.8, 40));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resolution, Resolution::Scored);
    }

    #[test]
    fn test_overlapping_windows_do_not_duplicate_samples() {
        let mut det = detector(Box::new(|epoch: &Epoch| {
            let times = &epoch.samples[0];
            for pair in times.windows(2) {
                assert!(pair[1] > pair[0]);
            }
            0.3
        }));
        det.track(marker_at(0.0, 100), channels(), RATE, Instant::now())
            .unwrap();
        // step 30, overlap 30
        assert!(det.observe(&window(1.0, 60)).is_empty());
        assert!(det.observe(&window(1.3, 60)).is_empty());
        let events = det.observe(&window(1.6, 60));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_overlapping_epochs_are_independent() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let mut det = detector(Box::new(move |epoch: &Epoch| {
            log.lock().push((epoch.marker_id, epoch.samples[0][0]));
            0.5
        }));
        let a = marker_at(0.0, 100);
        let b = marker_at(0.5, 100);
        let (ida, idb) = (a.id, b.id);
        det.track(a, channels(), RATE, Instant::now()).unwrap();
        det.track(b, channels(), RATE, Instant::now()).unwrap();

        let events = det.observe(&window(1.0, 300));
        assert_eq!(events.len(), 2);
        let seen = seen.lock();
        assert_eq!(seen[0].0, ida);
        assert!((seen[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(seen[1].0, idb);
        assert!((seen[1].1 - 1.5).abs() < 1e-6);
        assert_eq!(events[1].marker_id, idb);
    }

    #[test]
    fn test_stream_deadline_falls_back_exactly_once() {
        let mut det = detector(Box::new(|_: &Epoch| 0.9));
        let marker = marker_at(0.0, 100);
        det.track(marker, channels(), RATE, Instant::now()).unwrap();

        // a gap in the stream: the next window starts well after t0
        let events = det.observe(&window(5.0, 100));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].probability, 0.5);
        assert_eq!(events[0].resolution, Resolution::Deadline);
        assert_eq!(events[0].timestamp, 2.5);
        assert!(det.observe(&window(6.0, 100)).is_empty());
    }

    #[test]
    fn test_wall_clock_deadline() {
        let config = DetectorConfig {
            default_probability: 0.25,
            ..Default::default()
        };
        let mut det = ErrorSignalDetector::new(config, Box::new(|_: &Epoch| 0.9)).unwrap();
        let registered = Instant::now();
        det.track(marker_at(0.0, 100), channels(), RATE, registered)
            .unwrap();

        assert_eq!(det.next_deadline(), Some(registered + Duration::from_millis(1500)));
        assert!(det.expire(registered + Duration::from_millis(1000)).is_empty());
        let events = det.expire(registered + Duration::from_millis(1500));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].probability, 0.25);
        assert_eq!(det.pending(), 0);
        assert!(det.expire(registered + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_non_finite_score_falls_back() {
        let mut det = detector(Box::new(|_: &Epoch| f64::NAN));
        det.track(marker_at(0.0, 100), channels(), RATE, Instant::now())
            .unwrap();
        let events = det.observe(&window(1.0, 100));
        assert_eq!(events[0].resolution, Resolution::Unscorable);
        assert_eq!(events[0].probability, 0.5);
    }

    #[test]
    fn test_cancel_silences_detector() {
        let mut det = detector(Box::new(|_: &Epoch| 0.9));
        det.track(marker_at(0.0, 100), channels(), RATE, Instant::now())
            .unwrap();
        assert_eq!(det.cancel(), 1);
        assert!(det.observe(&window(1.0, 100)).is_empty());
        assert!(det.expire(Instant::now() + Duration::from_secs(60)).is_empty());
        assert!(matches!(
            det.track(marker_at(2.0, 100), channels(), RATE, Instant::now()),
            Err(ComputeError::SessionClosed)
        ));
    }

    #[test]
    fn test_template_scorer_prefers_error_shape() {
        let len = RATE as usize;
        let template = TemplateScorer::template(RATE, len);
        let as_epoch = |signal: Vec<f32>| Epoch {
            marker_id: Uuid::nil(),
            t0: 0.0,
            sample_rate: RATE,
            channels: Arc::from(vec!["Fz".to_string()]),
            samples: vec![signal],
        };
        let mut scorer = TemplateScorer::default();
        let errp = as_epoch(template.iter().map(|v| (*v * 1e-5) as f32).collect());
        let inverted = as_epoch(template.iter().map(|v| (-*v * 1e-5) as f32).collect());
        let flat = as_epoch(vec![0.0; len]);

        let p_err = scorer.score(&errp);
        let p_inv = scorer.score(&inverted);
        assert!(p_err > 0.9, "{p_err}");
        assert!(p_inv < 0.1, "{p_inv}");
        assert!(scorer.score(&flat).is_nan());

        let r = scorer.correlation(&errp);
        assert!((r - 1.0).abs() < 1e-4);
    }
}
