//! Window segmentation
//!
//! Slices an ordered multichannel sample stream into fixed-length, optionally
//! overlapping windows. Samples are consumed strictly in arrival order; each
//! emitted window advances the buffer head by the step `S = L - O`, so the
//! first `S` samples of consecutive windows tile the stream without gaps or
//! repeats.

use crate::config::SegmenterConfig;
use crate::error::ComputeError;
use crate::types::{SampleChunk, Window};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Streaming window segmenter for one session
#[derive(Debug)]
pub struct Segmenter {
    config: SegmenterConfig,
    channels: Arc<[String]>,
    /// One buffer of unconsumed samples per channel
    buffers: Vec<VecDeque<f32>>,
    /// Absolute index of `buffers[_][0]`
    head: u64,
    /// Absolute index one past the last buffered sample
    tail: u64,
    /// `(absolute index, arrival time)` of each buffered chunk's first sample
    anchors: VecDeque<(u64, f64)>,
    emitted: u64,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Result<Self, ComputeError> {
        config.validate()?;
        let channels: Arc<[String]> = Arc::from(config.channels.clone());
        let buffers = (0..config.channel_count())
            .map(|_| VecDeque::with_capacity(config.window_samples * 2))
            .collect();
        Ok(Self {
            config,
            channels,
            buffers,
            head: 0,
            tail: 0,
            anchors: VecDeque::new(),
            emitted: 0,
        })
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<[String]> {
        &self.channels
    }

    /// Samples per channel currently buffered
    pub fn buffered(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// Number of windows emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Append a chunk without emitting windows
    pub fn append(&mut self, chunk: &SampleChunk) -> Result<(), ComputeError> {
        if chunk.channel_count() != self.config.channel_count() {
            return Err(ComputeError::SchemaMismatchError(format!(
                "chunk carries {} channels, session declares {}",
                chunk.channel_count(),
                self.config.channel_count()
            )));
        }
        let len = chunk.len();
        if chunk.samples.iter().any(|c| c.len() != len) {
            return Err(ComputeError::SchemaMismatchError(
                "chunk channels must all hold the same number of samples".to_string(),
            ));
        }
        if len == 0 {
            return Ok(());
        }

        for (buffer, samples) in self.buffers.iter_mut().zip(&chunk.samples) {
            buffer.extend(samples.iter().copied());
        }
        self.anchors.push_back((self.tail, chunk.timestamp));
        self.tail += len as u64;
        Ok(())
    }

    /// Append a chunk and return every window that became complete
    pub fn push(&mut self, chunk: &SampleChunk) -> Result<Vec<Window>, ComputeError> {
        self.append(chunk)?;
        let mut windows = Vec::new();
        while let Some(window) = self.try_next() {
            windows.push(window);
        }
        Ok(windows)
    }

    /// Emit the next window if one is complete
    pub fn try_next(&mut self) -> Option<Window> {
        let length = self.config.window_samples;
        if self.buffered() < length {
            return None;
        }

        let start_time = self.arrival_time(self.head);
        let samples: Vec<Vec<f32>> = self
            .buffers
            .iter()
            .map(|buffer| buffer.iter().take(length).copied().collect())
            .collect();

        let step = self.config.step_samples();
        for buffer in &mut self.buffers {
            buffer.drain(..step);
        }
        self.head += step as u64;
        while self.anchors.len() > 1 && self.anchors[1].0 <= self.head {
            self.anchors.pop_front();
        }
        self.emitted += 1;

        trace!(
            session_id = %self.config.session_id,
            start_time,
            index = self.emitted - 1,
            "Window emitted"
        );

        Some(Window {
            session_id: self.config.session_id.clone(),
            channels: Arc::clone(&self.channels),
            samples,
            start_time,
            sample_rate: self.config.sample_rate,
        })
    }

    /// Synchronous pull: the next window, or an underrun if too few samples
    /// are buffered.
    pub fn pull(&mut self) -> Result<Window, ComputeError> {
        let available = self.buffered();
        self.try_next().ok_or(ComputeError::UnderrunError {
            available,
            required: self.config.window_samples,
        })
    }

    /// End the session, discarding any partially filled window.
    ///
    /// Returns the number of samples per channel that were discarded.
    pub fn finish(self) -> usize {
        let discarded = self.buffered();
        if discarded > 0 {
            debug!(
                session_id = %self.config.session_id,
                discarded,
                "Discarding partial window at end of session"
            );
        }
        discarded
    }

    /// Arrival time of an absolute sample index still in the buffer
    fn arrival_time(&self, index: u64) -> f64 {
        let (anchor_index, anchor_time) = self
            .anchors
            .iter()
            .rev()
            .find(|(start, _)| *start <= index)
            .copied()
            .unwrap_or((index, 0.0));
        anchor_time + (index - anchor_index) as f64 / self.config.sample_rate
    }
}
