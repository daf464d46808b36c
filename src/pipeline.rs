//! Closed-loop orchestration
//!
//! `FeedbackOrchestrator` owns every per-session component and drives the
//! decision cycle:
//!
//! 1. Segmenter - raw samples → windows
//! 2. Archive - every accepted window is appended to the session's EBS file
//! 3. Preprocessor + FeatureExtractor - window → features → bandit context
//! 4. Classifier - features → decision marker
//! 5. ErrorSignalDetector - marker + following windows → error probability
//! 6. RewardMapping + LinUcbBandit - reward → arm update → next selection
//!
//! Each marker starts its own cycle
//! `Idle → AwaitingSignal → SignalResolved → ArmUpdated → Selected → Idle`.
//! Cycles overlap freely; they only meet at the bandit, which serializes
//! updates per arm.

use crate::archive::{ArchiveHeader, ArchiveReader, ArchiveSummary, ArchiveWriter};
use crate::bandit::LinUcbBandit;
use crate::config::SessionConfig;
use crate::detector::{ErrorScorer, ErrorSignalDetector};
use crate::error::ComputeError;
use crate::features::{project_context, FeatureExtractor};
use crate::preprocess::Preprocessor;
use crate::segmenter::Segmenter;
use crate::types::{
    Decision, ErrorSignalEvent, FeatureVector, Intervention, Resolution, SampleChunk,
    StateMarker, Window, WindowKey,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Number of recent windows remembered for duplicate suppression
pub const DEDUP_CAPACITY: usize = 4096;

/// Maps a feature vector to a decision, or `None` for no decision
pub trait Classifier: Send {
    fn classify(&mut self, features: &FeatureVector) -> Option<Decision>;
}

impl<F> Classifier for F
where
    F: FnMut(&FeatureVector) -> Option<Decision> + Send,
{
    fn classify(&mut self, features: &FeatureVector) -> Option<Decision> {
        self(features)
    }
}

/// Stage of one decision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    AwaitingSignal,
    SignalResolved,
    ArmUpdated,
    Selected,
}

impl CycleState {
    /// The only legal successor of this state
    pub fn next(self) -> CycleState {
        match self {
            CycleState::Idle => CycleState::AwaitingSignal,
            CycleState::AwaitingSignal => CycleState::SignalResolved,
            CycleState::SignalResolved => CycleState::ArmUpdated,
            CycleState::ArmUpdated => CycleState::Selected,
            CycleState::Selected => CycleState::Idle,
        }
    }
}

/// One in-flight decision cycle
#[derive(Debug, Clone)]
struct DecisionCycle {
    marker: StateMarker,
    /// Context of the marker's window, `None` if its features were degenerate
    context: Option<Vec<f64>>,
    /// Intervention active when the marker was emitted
    arm: Option<usize>,
    state: CycleState,
}

impl DecisionCycle {
    fn advance(&mut self, to: CycleState) -> Result<(), ComputeError> {
        if self.state.next() != to {
            return Err(ComputeError::InvalidContext(format!(
                "decision cycle {} cannot move from {:?} to {to:?}",
                self.marker.id, self.state
            )));
        }
        debug!(marker_id = %self.marker.id, from = ?self.state, ?to, "Cycle transition");
        self.state = to;
        Ok(())
    }
}

/// Outcome of a completed decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub marker_id: Uuid,
    pub probability: f64,
    pub resolution: Resolution,
    pub reward: f64,
    /// Arm credited with the reward, if one was active and a context existed
    pub updated_arm: Option<usize>,
    /// Arm selected for the next context
    pub next_arm: Option<usize>,
}

/// Observable output of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedbackEvent {
    Marker(StateMarker),
    Signal(ErrorSignalEvent),
    CycleCompleted(CycleRecord),
    Intervention(Intervention),
}

/// Counters and artifacts of a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub windows: u64,
    pub duplicate_windows: u64,
    pub degenerate_windows: u64,
    pub markers: u64,
    pub signals_scored: u64,
    pub signals_fallback: u64,
    pub arm_updates: u64,
    pub interventions: u64,
    /// Samples per channel left in the partial window at teardown
    pub discarded_samples: usize,
    /// Epochs still open at teardown
    pub cancelled_epochs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSummary>,
}

/// Recently seen windows with the context computed for each
#[derive(Debug, Default)]
struct RecentWindows {
    contexts: HashMap<WindowKey, Option<Vec<f64>>>,
    order: VecDeque<WindowKey>,
}

impl RecentWindows {
    fn contains(&self, key: &WindowKey) -> bool {
        self.contexts.contains_key(key)
    }

    fn insert(&mut self, key: WindowKey, context: Option<Vec<f64>>) {
        if self.order.len() == DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.contexts.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.contexts.insert(key, context);
    }

    fn context(&self, key: &WindowKey) -> Option<Vec<f64>> {
        self.contexts.get(key).cloned().flatten()
    }
}

/// Drives the closed loop for one session
pub struct FeedbackOrchestrator {
    config: SessionConfig,
    segmenter: Segmenter,
    extractor: FeatureExtractor,
    preprocessor: Preprocessor,
    detector: ErrorSignalDetector,
    bandit: Arc<LinUcbBandit>,
    classifier: Option<Box<dyn Classifier>>,
    archive: Option<ArchiveWriter>,
    recent: RecentWindows,
    cycles: HashMap<Uuid, DecisionCycle>,
    active: Option<Intervention>,
    latest_context: Option<(f64, Vec<f64>)>,
    summary: SessionSummary,
}

impl fmt::Debug for FeedbackOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackOrchestrator")
            .field("session_id", &self.config.segmenter.session_id)
            .field("cycles", &self.cycles.len())
            .field("active", &self.active)
            .field("detector", &self.detector)
            .finish()
    }
}

impl FeedbackOrchestrator {
    pub fn new(config: SessionConfig, scorer: Box<dyn ErrorScorer>) -> Result<Self, ComputeError> {
        config.validate()?;
        let segmenter = Segmenter::new(config.segmenter.clone())?;
        let extractor = FeatureExtractor::new(config.features.clone())?;
        let preprocessor =
            Preprocessor::new(config.preprocess.clone(), config.segmenter.sample_rate)?;
        let detector = ErrorSignalDetector::new(config.detector.clone(), scorer)?;
        let bandit = Arc::new(LinUcbBandit::new(
            &config.bandit,
            config.context_dimension(),
        )?);
        let now = Utc::now();
        let summary = SessionSummary {
            session_id: config.segmenter.session_id.clone(),
            started_at: now,
            finished_at: now,
            windows: 0,
            duplicate_windows: 0,
            degenerate_windows: 0,
            markers: 0,
            signals_scored: 0,
            signals_fallback: 0,
            arm_updates: 0,
            interventions: 0,
            discarded_samples: 0,
            cancelled_epochs: 0,
            archive: None,
        };

        info!(
            session_id = %config.segmenter.session_id,
            channels = config.segmenter.channel_count(),
            sample_rate = config.segmenter.sample_rate,
            window_samples = config.segmenter.window_samples,
            arms = config.bandit.arms,
            "Session opened"
        );

        Ok(Self {
            config,
            segmenter,
            extractor,
            preprocessor,
            detector,
            bandit,
            classifier: None,
            archive: None,
            recent: RecentWindows::default(),
            cycles: HashMap::new(),
            active: None,
            latest_context: None,
            summary,
        })
    }

    /// Emit decision markers from this classifier
    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Use an existing bandit, e.g. one restored from a snapshot
    pub fn with_bandit(mut self, bandit: Arc<LinUcbBandit>) -> Result<Self, ComputeError> {
        if bandit.dimension() != self.config.context_dimension() {
            return Err(ComputeError::InvalidConfig(format!(
                "bandit expects {}-dimensional contexts, session produces {}",
                bandit.dimension(),
                self.config.context_dimension()
            )));
        }
        self.bandit = bandit;
        Ok(self)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bandit(&self) -> &Arc<LinUcbBandit> {
        &self.bandit
    }

    /// Intervention currently in effect
    pub fn active_intervention(&self) -> Option<&Intervention> {
        self.active.as_ref()
    }

    /// State of an in-flight cycle
    pub fn cycle_state(&self, marker_id: &Uuid) -> Option<CycleState> {
        self.cycles.get(marker_id).map(|c| c.state)
    }

    pub fn pending_cycles(&self) -> usize {
        self.cycles.len()
    }

    /// Earliest wall-clock deadline among open epochs
    pub fn next_deadline(&self) -> Option<Instant> {
        self.detector.next_deadline()
    }

    /// Feed raw samples and process every window they complete
    pub fn push_samples(
        &mut self,
        chunk: &SampleChunk,
        now: Instant,
    ) -> Result<Vec<FeedbackEvent>, ComputeError> {
        let windows = self.segmenter.push(chunk)?;
        let mut events = Vec::new();
        for window in windows {
            events.extend(self.process_window(&window, now)?);
        }
        Ok(events)
    }

    /// Process one window, from the segmenter or redelivered by a transport.
    ///
    /// Exact duplicates of a recently processed window are ignored.
    pub fn process_window(
        &mut self,
        window: &Window,
        now: Instant,
    ) -> Result<Vec<FeedbackEvent>, ComputeError> {
        let key = window.key();
        if self.recent.contains(&key) {
            self.summary.duplicate_windows += 1;
            debug!(start_time = window.start_time, "Duplicate window ignored");
            return Ok(Vec::new());
        }
        self.check_window(window)?;
        self.archive_window(window)?;
        self.summary.windows += 1;

        let conditioned = self.preprocessor.apply(window);
        let features = self.extractor.extract(&conditioned);
        let context = project_context(
            &features,
            self.extractor.bands_per_channel(),
            self.config.bandit.context,
        );
        if context.is_none() {
            self.summary.degenerate_windows += 1;
            warn!(
                start_time = window.start_time,
                degenerate = ?features.degenerate,
                "Window features are degenerate, no context"
            );
        }
        self.recent.insert(key, context.clone());

        if let Some(ref x) = context {
            self.latest_context = Some((window.end_time(), x.clone()));
        }

        let mut events = Vec::new();
        for signal in self.detector.observe(&conditioned) {
            events.extend(self.resolve(signal)?);
        }
        if self.active.is_none() {
            if let Some(intervention) = self.select_next(None)? {
                events.push(FeedbackEvent::Intervention(intervention));
            }
        }

        let decision = match self.classifier.as_mut() {
            Some(classifier) if features.is_valid() => classifier.classify(&features),
            _ => None,
        };
        if let Some(decision) = decision {
            let marker = StateMarker::for_window(window, decision);
            events.extend(self.open_cycle(marker, context, now)?);
        }

        Ok(events)
    }

    /// Start a cycle for a marker produced outside the orchestrator.
    ///
    /// The marker must reference a recently processed window.
    pub fn submit_marker(
        &mut self,
        marker: StateMarker,
        now: Instant,
    ) -> Result<Vec<FeedbackEvent>, ComputeError> {
        if marker.window.session_id != self.config.segmenter.session_id {
            return Err(ComputeError::SchemaMismatchError(format!(
                "marker belongs to session '{}', not '{}'",
                marker.window.session_id, self.config.segmenter.session_id
            )));
        }
        if !self.recent.contains(&marker.window) {
            warn!(
                marker_id = %marker.id,
                window_start = marker.window.start_time(),
                "Marker references an unknown window, reward will not update an arm"
            );
        }
        let context = self.recent.context(&marker.window);
        self.open_cycle(marker, context, now)
    }

    /// Resolve cycles whose wall-clock deadline passed
    pub fn expire(&mut self, now: Instant) -> Result<Vec<FeedbackEvent>, ComputeError> {
        let mut events = Vec::new();
        for signal in self.detector.expire(now) {
            events.extend(self.resolve(signal)?);
        }
        Ok(events)
    }

    /// Tear the session down.
    ///
    /// Discards the partial window, cancels open epochs without emitting
    /// anything for them, and finalizes the archive.
    pub fn shutdown(self) -> Result<SessionSummary, ComputeError> {
        let Self {
            config,
            segmenter,
            mut detector,
            archive,
            mut summary,
            ..
        } = self;

        summary.discarded_samples = segmenter.finish();
        summary.cancelled_epochs = detector.cancel();

        summary.archive = match (archive, &config.archive_path) {
            (Some(writer), _) => Some(writer.finish()?),
            (None, Some(path)) => {
                let header = ArchiveHeader::from_config(&config.segmenter);
                Some(ArchiveWriter::create(path, header)?.finish()?)
            }
            (None, None) => None,
        };
        summary.finished_at = Utc::now();

        info!(
            session_id = %summary.session_id,
            windows = summary.windows,
            markers = summary.markers,
            arm_updates = summary.arm_updates,
            discarded_samples = summary.discarded_samples,
            cancelled_epochs = summary.cancelled_epochs,
            "Session closed"
        );
        Ok(summary)
    }

    fn check_window(&self, window: &Window) -> Result<(), ComputeError> {
        let expected = &self.config.segmenter;
        if window.session_id != expected.session_id {
            return Err(ComputeError::SchemaMismatchError(format!(
                "window belongs to session '{}', not '{}'",
                window.session_id, expected.session_id
            )));
        }
        if window.channels[..] != expected.channels[..]
            || window.samples.len() != expected.channel_count()
        {
            return Err(ComputeError::SchemaMismatchError(format!(
                "window channels {:?} differ from session channels {:?}",
                window.channels, expected.channels
            )));
        }
        if window
            .samples
            .iter()
            .any(|c| c.len() != expected.window_samples)
        {
            return Err(ComputeError::SchemaMismatchError(format!(
                "window must hold {} samples per channel",
                expected.window_samples
            )));
        }
        if window.sample_rate != expected.sample_rate {
            return Err(ComputeError::SchemaMismatchError(format!(
                "window sample rate {} Hz differs from session rate {} Hz",
                window.sample_rate, expected.sample_rate
            )));
        }
        Ok(())
    }

    fn archive_window(&mut self, window: &Window) -> Result<(), ComputeError> {
        let Some(path) = self.config.archive_path.as_deref() else {
            return Ok(());
        };
        if self.archive.is_none() {
            let header =
                ArchiveHeader::from_config(&self.config.segmenter).with_start_time(window.start_time);
            self.archive = Some(ArchiveWriter::create(path, header)?);
        }
        if let Some(writer) = self.archive.as_mut() {
            writer.append(window)?;
        }
        Ok(())
    }

    fn open_cycle(
        &mut self,
        marker: StateMarker,
        context: Option<Vec<f64>>,
        now: Instant,
    ) -> Result<Vec<FeedbackEvent>, ComputeError> {
        let mut events = Vec::new();
        if self.active.is_none() {
            if let Some(x) = context.as_ref() {
                let intervention = self.select_with(x, marker.timestamp, None)?;
                events.push(FeedbackEvent::Intervention(intervention));
            }
        }

        let mut cycle = DecisionCycle {
            marker: marker.clone(),
            context,
            arm: self.active.as_ref().map(|i| i.arm),
            state: CycleState::Idle,
        };
        self.detector.track(
            marker.clone(),
            Arc::clone(self.segmenter.channels()),
            self.config.segmenter.sample_rate,
            now,
        )?;
        cycle.advance(CycleState::AwaitingSignal)?;
        debug!(
            marker_id = %marker.id,
            label = marker.label,
            t0 = marker.timestamp,
            arm = ?cycle.arm,
            "Decision cycle opened"
        );
        self.cycles.insert(marker.id, cycle);
        self.summary.markers += 1;
        events.insert(0, FeedbackEvent::Marker(marker));
        Ok(events)
    }

    fn resolve(&mut self, signal: ErrorSignalEvent) -> Result<Vec<FeedbackEvent>, ComputeError> {
        let Some(mut cycle) = self.cycles.remove(&signal.marker_id) else {
            warn!(marker_id = %signal.marker_id, "Signal for unknown cycle ignored");
            return Ok(Vec::new());
        };
        if signal.resolution.is_fallback() {
            self.summary.signals_fallback += 1;
        } else {
            self.summary.signals_scored += 1;
        }
        cycle.advance(CycleState::SignalResolved)?;

        let reward = self.config.reward.reward(signal.probability);
        let updated_arm = match (cycle.arm, cycle.context.as_ref()) {
            (Some(arm), Some(x)) => {
                self.bandit.update(arm, x, reward)?;
                self.summary.arm_updates += 1;
                Some(arm)
            }
            _ => {
                debug!(marker_id = %signal.marker_id, "No arm or context to credit");
                None
            }
        };
        cycle.advance(CycleState::ArmUpdated)?;

        let intervention = self.select_next(Some(signal.marker_id))?;
        cycle.advance(CycleState::Selected)?;
        cycle.advance(CycleState::Idle)?;

        let mut events = vec![
            FeedbackEvent::Signal(signal.clone()),
            FeedbackEvent::CycleCompleted(CycleRecord {
                marker_id: signal.marker_id,
                probability: signal.probability,
                resolution: signal.resolution,
                reward,
                updated_arm,
                next_arm: intervention.as_ref().map(|i| i.arm),
            }),
        ];
        if let Some(intervention) = intervention {
            events.push(FeedbackEvent::Intervention(intervention));
        }
        Ok(events)
    }

    /// Select an arm for the most recent context, if there is one
    fn select_next(&mut self, marker_id: Option<Uuid>) -> Result<Option<Intervention>, ComputeError> {
        let Some((timestamp, x)) = self.latest_context.clone() else {
            return Ok(None);
        };
        self.select_with(&x, timestamp, marker_id).map(Some)
    }

    fn select_with(
        &mut self,
        x: &[f64],
        timestamp: f64,
        marker_id: Option<Uuid>,
    ) -> Result<Intervention, ComputeError> {
        let choice = self.bandit.select(x)?;
        let intervention = Intervention {
            arm: choice.arm,
            score: choice.score,
            timestamp,
            marker_id,
        };
        info!(arm = choice.arm, score = choice.score, "Intervention selected");
        self.summary.interventions += 1;
        self.active = Some(intervention.clone());
        Ok(intervention)
    }
}

/// Session parameters for replaying an archive recorded with `header`.
///
/// Segmentation comes from the archive; everything else from `config`.
/// Replays never write an archive of their own.
pub fn replay_config(header: &ArchiveHeader, mut config: SessionConfig) -> SessionConfig {
    config.segmenter.session_id = header.session_id.clone();
    config.segmenter.channels = header.channels.clone();
    config.segmenter.sample_rate = header.sample_rate;
    config.segmenter.window_samples = header.window_samples;
    config.segmenter.overlap_samples =
        header.window_samples - header.step().min(header.window_samples);
    config.archive_path = None;
    config
}

impl FeedbackOrchestrator {
    /// Feed every window of `reader` through the loop, in archive order
    pub fn replay<R: Read + Seek>(
        &mut self,
        reader: &mut ArchiveReader<R>,
    ) -> Result<Vec<FeedbackEvent>, ComputeError> {
        reader.check_schema(&self.config.segmenter)?;
        let mut events = Vec::new();
        for window in reader.windows() {
            events.extend(self.process_window(&window?, Instant::now())?);
        }
        Ok(events)
    }
}

/// Run an archived session through the loop, one window at a time.
///
/// Every window is offered to `classifier`; the archive's own parameters
/// become the session's segmentation parameters.
pub fn replay_archive(
    path: &Path,
    config: SessionConfig,
    scorer: Box<dyn ErrorScorer>,
    classifier: Box<dyn Classifier>,
) -> Result<(Vec<FeedbackEvent>, SessionSummary), ComputeError> {
    let mut reader = ArchiveReader::open(path)?;
    let config = replay_config(reader.header(), config);
    let mut orchestrator = FeedbackOrchestrator::new(config, scorer)?.with_classifier(classifier);
    let events = orchestrator.replay(&mut reader)?;
    let summary = orchestrator.shutdown()?;
    Ok((events, summary))
}
