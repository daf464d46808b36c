//! Async session loop
//!
//! Connects a `FeedbackOrchestrator` to a `StreamHub`: samples (or ready-made
//! windows) are received from a bounded subscription, optional external
//! decision markers from a second one, and every selected intervention is
//! published on an output stream. Wall-clock epoch deadlines are served from
//! the same loop. The loop ends when the input stream closes or the
//! cancellation token fires; either way the orchestrator is torn down so the
//! archive is left complete.

use crate::error::ComputeError;
use crate::pipeline::{FeedbackEvent, FeedbackOrchestrator, SessionSummary};
use crate::transport::{Payload, Publisher, StreamHub, StreamInfo, StreamKind, Subscription};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Names of the streams a session uses
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStreams {
    /// Input stream of sample chunks or windows
    pub input: String,
    /// Optional stream of externally produced decision markers
    pub markers: Option<String>,
    /// Output stream for selected interventions
    pub interventions: String,
}

impl SessionStreams {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            markers: None,
            interventions: "interventions".to_string(),
        }
    }

    pub fn with_markers(mut self, name: impl Into<String>) -> Self {
        self.markers = Some(name.into());
        self
    }

    pub fn with_interventions(mut self, name: impl Into<String>) -> Self {
        self.interventions = name.into();
        self
    }
}

/// Run one session until its input closes or `cancel` fires.
///
/// Session-fatal errors (numerical failures, archive or schema errors) stop
/// the loop; the orchestrator is still torn down before the error is
/// returned. Other errors are logged and the offending payload is skipped.
pub async fn run_session(
    orchestrator: FeedbackOrchestrator,
    hub: &StreamHub,
    streams: SessionStreams,
    cancel: CancellationToken,
) -> Result<SessionSummary, ComputeError> {
    let mut orchestrator = orchestrator;
    let retry = orchestrator.config().retry.clone();
    let session_id = orchestrator.config().segmenter.session_id.clone();

    let mut input = hub
        .subscribe_with_retry(&streams.input, &retry, &cancel)
        .await?;
    let mut markers = match streams.markers.as_deref() {
        Some(name) => Some(hub.subscribe_with_retry(name, &retry, &cancel).await?),
        None => None,
    };
    let channel_count = orchestrator.config().segmenter.channel_count();
    let output = hub.advertise(
        StreamInfo::new(&streams.interventions, StreamKind::Interventions, &session_id)
            .with_signal(channel_count, 0.0),
    )?;

    info!(session_id = %session_id, input = %streams.input, "Session loop started");

    let outcome = loop {
        let deadline = orchestrator.next_deadline();
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(session_id = %session_id, "Session cancelled");
                break Ok(());
            }
            payload = input.recv() => match payload {
                Some(payload) => handle_input(&mut orchestrator, payload),
                None => {
                    info!(session_id = %session_id, "Input stream closed");
                    break Ok(());
                }
            },
            marker = recv_optional(&mut markers) => match marker {
                Some(Payload::Marker(marker)) => orchestrator.submit_marker(marker, now()),
                Some(other) => {
                    warn!(kind = ?other.kind(), "Unexpected payload on marker stream");
                    Ok(Vec::new())
                }
                None => {
                    debug!("Marker stream closed");
                    markers = None;
                    Ok(Vec::new())
                }
            },
            _ = sleep_until(deadline) => orchestrator.expire(now()),
        };

        match step {
            Ok(events) => {
                if let Err(e) = publish(&output, events).await {
                    warn!(error = %e, "Failed to publish intervention");
                }
            }
            Err(e) if e.is_session_fatal() => break Err(e),
            Err(e) => warn!(session_id = %session_id, error = %e, "Payload skipped"),
        }
    };

    let summary = orchestrator.shutdown();
    hub.close(&streams.interventions);
    match outcome {
        Ok(()) => summary,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Session aborted");
            if let Err(teardown) = summary {
                error!(error = %teardown, "Teardown after abort failed");
            }
            Err(e)
        }
    }
}

fn handle_input(
    orchestrator: &mut FeedbackOrchestrator,
    payload: Payload,
) -> Result<Vec<FeedbackEvent>, ComputeError> {
    match payload {
        Payload::Samples(chunk) => orchestrator.push_samples(&chunk, now()),
        Payload::Window(window) => orchestrator.process_window(&window, now()),
        other => {
            warn!(kind = ?other.kind(), "Unexpected payload on input stream");
            Ok(Vec::new())
        }
    }
}

async fn publish(output: &Publisher, events: Vec<FeedbackEvent>) -> Result<(), ComputeError> {
    for event in events {
        if let FeedbackEvent::Intervention(intervention) = event {
            output.publish(Payload::Intervention(intervention)).await?;
        }
    }
    Ok(())
}

async fn recv_optional(subscription: &mut Option<Subscription>) -> Option<Payload> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Wall-clock now, following tokio's clock so paused test time applies
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BanditConfig, DetectorConfig, SegmenterConfig, SessionConfig};
    use crate::detector::Epoch;
    use crate::synth::SyntheticSource;
    use crate::types::{Decision, FeatureVector, StateMarker};
    use std::time::Duration;

    const RATE: f64 = 128.0;

    fn config() -> SessionConfig {
        SessionConfig::new(SegmenterConfig::new(["C3", "C4"], RATE, 128).with_session_id("live"))
            .with_detector(DetectorConfig {
                epoch_seconds: 0.5,
                deadline_seconds: 0.75,
                default_probability: 0.5,
            })
            .with_bandit(BanditConfig {
                arms: 2,
                ..Default::default()
            })
    }

    fn orchestrator(classify: bool) -> FeedbackOrchestrator {
        let orch = FeedbackOrchestrator::new(config(), Box::new(|_: &Epoch| 0.1)).unwrap();
        if classify {
            orch.with_classifier(Box::new(|_: &FeatureVector| {
                Some(Decision {
                    label: 0,
                    confidence: 1.0,
                })
            }))
        } else {
            orch
        }
    }

    fn samples_stream(hub: &StreamHub) -> Publisher {
        hub.advertise(StreamInfo::new("eeg", StreamKind::Samples, "synth").with_signal(2, RATE))
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_runs_until_input_closes() {
        let hub = StreamHub::new(16);
        let input = samples_stream(&hub);
        let cancel = CancellationToken::new();

        let session_hub = hub.clone();
        let session = tokio::spawn(async move {
            run_session(
                orchestrator(true),
                &session_hub,
                SessionStreams::new("eeg"),
                cancel,
            )
            .await
        });

        // let the session subscribe before publishing
        while hub.resolve_by_name("interventions").is_none() {
            tokio::task::yield_now().await;
        }
        let mut interventions = hub.subscribe("interventions").unwrap();

        let mut source = SyntheticSource::new(2, RATE, 64, 4).unwrap();
        for _ in 0..6 {
            input
                .publish(Payload::Samples(source.next().unwrap()))
                .await
                .unwrap();
        }
        hub.close("eeg");

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.windows, 3);
        assert_eq!(summary.markers, 3);
        assert_eq!(summary.signals_scored, 2);
        assert_eq!(summary.arm_updates, 2);
        assert_eq!(summary.cancelled_epochs, 1);

        let mut received = 0;
        while let Some(payload) = interventions.recv().await {
            assert!(matches!(payload, Payload::Intervention(_)));
            received += 1;
        }
        assert_eq!(received as u64, summary.interventions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_deadline_and_external_markers() {
        let hub = StreamHub::new(16);
        let input = samples_stream(&hub);
        let markers = hub
            .advertise(StreamInfo::new("markers", StreamKind::Markers, "clf"))
            .unwrap();
        let cancel = CancellationToken::new();

        let session_hub = hub.clone();
        let session_cancel = cancel.clone();
        let session = tokio::spawn(async move {
            run_session(
                orchestrator(false),
                &session_hub,
                SessionStreams::new("eeg").with_markers("markers"),
                session_cancel,
            )
            .await
        });
        while hub.resolve_by_name("interventions").is_none() {
            tokio::task::yield_now().await;
        }

        let mut segmenter = crate::segmenter::Segmenter::new(config().segmenter).unwrap();
        let mut source = SyntheticSource::new(2, RATE, 128, 6).unwrap();
        let chunk = source.next().unwrap();
        let window = segmenter.push(&chunk).unwrap().remove(0);
        input.publish(Payload::Samples(chunk)).await.unwrap();

        let marker = StateMarker::for_window(
            &window,
            Decision {
                label: 3,
                confidence: 0.7,
            },
        );
        markers.publish(Payload::Marker(marker)).await.unwrap();

        // no further samples: the epoch can only resolve on the wall clock
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.markers, 1);
        assert_eq!(summary.signals_fallback, 1);
        assert_eq!(summary.arm_updates, 1);
        assert_eq!(summary.cancelled_epochs, 0);
    }

    #[tokio::test]
    async fn test_foreign_window_aborts_but_archive_is_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.ebs");
        let hub = StreamHub::new(16);
        let input = hub
            .advertise(
                StreamInfo::new("windows", StreamKind::Windows, "seg")
                    .with_signal(2, RATE)
                    .with_window_samples(128),
            )
            .unwrap();
        let orchestrator =
            FeedbackOrchestrator::new(config().with_archive(&path), Box::new(|_: &Epoch| 0.1))
                .unwrap();

        let session_hub = hub.clone();
        let session = tokio::spawn(async move {
            run_session(
                orchestrator,
                &session_hub,
                SessionStreams::new("windows"),
                CancellationToken::new(),
            )
            .await
        });
        while hub.resolve_by_name("interventions").is_none() {
            tokio::task::yield_now().await;
        }

        let mut segmenter = crate::segmenter::Segmenter::new(config().segmenter).unwrap();
        let mut source = SyntheticSource::new(2, RATE, 128, 8).unwrap();
        let window = segmenter.push(&source.next().unwrap()).unwrap().remove(0);
        let mut foreign = window.clone();
        foreign.session_id = "other".to_string();

        // at-least-once delivery: the same window arrives twice
        input.publish(Payload::Window(window.clone())).await.unwrap();
        input.publish(Payload::Window(window)).await.unwrap();
        input.publish(Payload::Window(foreign)).await.unwrap();

        let result = session.await.unwrap();
        assert!(matches!(result, Err(ComputeError::SchemaMismatchError(_))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512 + 1024);
        let reader = crate::archive::ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_input_exists() {
        let hub = StreamHub::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_session(orchestrator(false), &hub, SessionStreams::new("eeg"), cancel).await;
        assert!(matches!(result, Err(ComputeError::SessionClosed)));
    }
}
