//! In-process stream transport
//!
//! A `StreamHub` holds named, typed streams. Producers advertise a stream with
//! its metadata and publish payloads; consumers discover streams by name or
//! kind and subscribe, receiving every later payload in publish order through
//! a bounded queue. A full queue applies backpressure to the publisher.

use crate::config::RetryPolicy;
use crate::error::ComputeError;
use crate::types::{Intervention, SampleChunk, StateMarker, Window};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Samples,
    Windows,
    Markers,
    Interventions,
}

/// Metadata advertised with every stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub kind: StreamKind,
    pub channel_count: usize,
    /// Nominal sampling rate (Hz), 0 for irregular streams
    pub sample_rate: f64,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_samples: Option<usize>,
}

impl StreamInfo {
    pub fn new(name: impl Into<String>, kind: StreamKind, source_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            channel_count: 0,
            sample_rate: 0.0,
            source_id: source_id.into(),
            window_samples: None,
        }
    }

    pub fn with_signal(mut self, channel_count: usize, sample_rate: f64) -> Self {
        self.channel_count = channel_count;
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_window_samples(mut self, window_samples: usize) -> Self {
        self.window_samples = Some(window_samples);
        self
    }
}

/// A typed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Samples(SampleChunk),
    Window(Window),
    Marker(StateMarker),
    Intervention(Intervention),
}

impl Payload {
    pub fn kind(&self) -> StreamKind {
        match self {
            Payload::Samples(_) => StreamKind::Samples,
            Payload::Window(_) => StreamKind::Windows,
            Payload::Marker(_) => StreamKind::Markers,
            Payload::Intervention(_) => StreamKind::Interventions,
        }
    }
}

#[derive(Debug)]
struct StreamEntry {
    info: StreamInfo,
    subscribers: Vec<mpsc::Sender<Payload>>,
}

/// Registry of named streams shared by producers and consumers
#[derive(Debug, Clone)]
pub struct StreamHub {
    streams: Arc<RwLock<HashMap<String, StreamEntry>>>,
    capacity: usize,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StreamHub {
    /// Hub whose subscriber queues hold up to `capacity` payloads
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a stream and get its publisher
    pub fn advertise(&self, info: StreamInfo) -> Result<Publisher, ComputeError> {
        let mut streams = self.streams.write();
        if let Some(existing) = streams.get(&info.name) {
            if existing.info != info {
                return Err(ComputeError::TransportError(format!(
                    "stream '{}' is already advertised with different metadata",
                    info.name
                )));
            }
        } else {
            info!(stream = %info.name, kind = ?info.kind, "Stream advertised");
            streams.insert(
                info.name.clone(),
                StreamEntry {
                    info: info.clone(),
                    subscribers: Vec::new(),
                },
            );
        }
        Ok(Publisher {
            hub: self.clone(),
            info,
        })
    }

    /// Metadata of every advertised stream, sorted by name
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self
            .streams
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<StreamInfo> {
        self.streams.read().get(name).map(|e| e.info.clone())
    }

    pub fn resolve_by_kind(&self, kind: StreamKind) -> Vec<StreamInfo> {
        self.streams()
            .into_iter()
            .filter(|info| info.kind == kind)
            .collect()
    }

    /// Subscribe to a stream; fails if no such stream is advertised
    pub fn subscribe(&self, name: &str) -> Result<Subscription, ComputeError> {
        let mut streams = self.streams.write();
        let entry = streams.get_mut(name).ok_or_else(|| {
            ComputeError::TransportError(format!("no stream named '{name}' is advertised"))
        })?;
        let (tx, rx) = mpsc::channel(self.capacity);
        entry.subscribers.push(tx);
        debug!(stream = %name, subscribers = entry.subscribers.len(), "Subscribed");
        Ok(Subscription {
            info: entry.info.clone(),
            receiver: rx,
        })
    }

    /// Subscribe, retrying with backoff until the stream appears.
    ///
    /// Gives up after `policy.max_attempts` attempts or when `cancel` fires.
    pub async fn subscribe_with_retry(
        &self,
        name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Subscription, ComputeError> {
        let mut attempt = 1;
        loop {
            match self.subscribe(name) {
                Ok(subscription) => return Ok(subscription),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        stream = %name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Stream unavailable, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ComputeError::SessionClosed),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a stream; its subscribers see the end of the stream
    pub fn close(&self, name: &str) -> bool {
        let removed = self.streams.write().remove(name).is_some();
        if removed {
            info!(stream = %name, "Stream closed");
        }
        removed
    }

    fn senders(&self, name: &str) -> Result<Vec<mpsc::Sender<Payload>>, ComputeError> {
        let mut streams = self.streams.write();
        let entry = streams.get_mut(name).ok_or_else(|| {
            ComputeError::TransportError(format!("stream '{name}' is closed"))
        })?;
        entry.subscribers.retain(|tx| !tx.is_closed());
        Ok(entry.subscribers.clone())
    }
}

/// Producer handle for one stream
#[derive(Debug, Clone)]
pub struct Publisher {
    hub: StreamHub,
    info: StreamInfo,
}

impl Publisher {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Deliver a payload to every current subscriber.
    ///
    /// Waits while a subscriber queue is full. Returns the number of
    /// subscribers reached.
    pub async fn publish(&self, payload: Payload) -> Result<usize, ComputeError> {
        if payload.kind() != self.info.kind {
            return Err(ComputeError::TransportError(format!(
                "stream '{}' carries {:?}, got {:?}",
                self.info.name,
                self.info.kind,
                payload.kind()
            )));
        }
        let mut delivered = 0;
        for tx in self.hub.senders(&self.info.name)? {
            if tx.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

/// Consumer handle for one stream
#[derive(Debug)]
pub struct Subscription {
    info: StreamInfo,
    receiver: mpsc::Receiver<Payload>,
}

impl Subscription {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Next payload, or `None` once the stream is closed and drained
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.receiver.try_recv().ok()
    }
}
