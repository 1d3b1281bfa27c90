//! Capture-session runtime.
//!
//! One actor task per session serializes track aggregation and
//! reconciliation, so the "at most one record per identity per session"
//! invariant never races. The handle side mirrors the request/reply
//! channel pattern used across the codebase: an mpsc of requests, a
//! oneshot per reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use muster_core::{
    CosineMatcher, EmbeddingStore, Gate, GateResult, GeoPoint, MatchDecision, Matcher,
    Observation, RecordType,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::reconcile::{reconcile, GroupAttendanceResult, SessionTally};
use crate::sink::{RecordStore, SubmissionChannel};
use crate::track::{TrackAggregator, TrackPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Individual,
    Group,
    Verification,
}

/// Per-session capture options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub mode: SessionMode,
    pub record_type: RecordType,
    pub location: Option<GeoPoint>,
    /// Liveness and anti-spoof gating applies unless explicitly
    /// disabled for a low-risk re-verification flow.
    pub require_liveness: bool,
}

impl SessionOptions {
    pub fn individual() -> Self {
        Self {
            mode: SessionMode::Individual,
            record_type: RecordType::Entry,
            location: None,
            require_liveness: true,
        }
    }

    pub fn group() -> Self {
        Self {
            mode: SessionMode::Group,
            record_type: RecordType::GroupPresence,
            location: None,
            require_liveness: true,
        }
    }

    /// Re-verification of an already-present user; liveness requirement
    /// is deliberately relaxed.
    pub fn verification() -> Self {
        Self {
            mode: SessionMode::Verification,
            record_type: RecordType::Entry,
            location: None,
            require_liveness: false,
        }
    }

    pub fn with_record_type(mut self, record_type: RecordType) -> Self {
        self.record_type = record_type;
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session task unavailable")]
    ChannelClosed,
}

/// Outcome of one observation within a processed frame.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationReport {
    /// Track that absorbed the observation; absent for invalid input.
    pub track_id: Option<Uuid>,
    pub gate: Option<GateResult>,
    /// Present only when the observation was eligible for matching.
    pub decision: Option<MatchDecision>,
    /// Rendered `InvalidObservation` for a structurally broken input.
    pub invalid: Option<String>,
}

/// Outcome of feeding one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Frame skipped by the sampling rate; index still advanced.
    pub sampled_out: bool,
    pub observations: Vec<ObservationReport>,
}

pub(crate) enum SessionRequest {
    Feed {
        observations: Vec<Observation>,
        reply: oneshot::Sender<Result<FrameReport, SessionError>>,
    },
    End {
        reply: oneshot::Sender<GroupAttendanceResult>,
    },
}

#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) tx: mpsc::Sender<SessionRequest>,
}

/// Spawn the per-session actor task.
pub(crate) fn spawn_session<R, C>(
    id: String,
    options: SessionOptions,
    config: EngineConfig,
    store: Arc<EmbeddingStore>,
    records: Arc<R>,
    channel: Arc<C>,
) -> SessionHandle
where
    R: RecordStore,
    C: SubmissionChannel,
{
    let (tx, rx) = mpsc::channel::<SessionRequest>(16);
    let worker = SessionWorker::new(id, options, config, store);
    tokio::spawn(run_session(worker, rx, records, channel));
    SessionHandle { tx }
}

struct SessionWorker {
    id: String,
    options: SessionOptions,
    config: EngineConfig,
    store: Arc<EmbeddingStore>,
    gate: Gate,
    matcher: CosineMatcher,
    aggregator: TrackAggregator,
    tally: SessionTally,
    next_frame: u64,
}

impl SessionWorker {
    fn new(
        id: String,
        options: SessionOptions,
        config: EngineConfig,
        store: Arc<EmbeddingStore>,
    ) -> Self {
        let gate = Gate::new(
            config.embedding_dim,
            config.gate_config(options.require_liveness),
        );
        let matcher = CosineMatcher::new(config.matcher_config());
        let aggregator = TrackAggregator::new(&config);
        Self {
            id,
            options,
            config,
            store,
            gate,
            matcher,
            aggregator,
            tally: SessionTally::default(),
            next_frame: 0,
        }
    }

    /// Gate, match, and aggregate one frame's observations. A
    /// structurally invalid observation aborts only itself.
    fn process_frame(&mut self, observations: Vec<Observation>) -> FrameReport {
        let frame_index = self.next_frame;
        self.next_frame += 1;
        self.tally.frames_seen += 1;

        if frame_index % self.config.frame_skip != 0 {
            return FrameReport {
                frame_index,
                sampled_out: true,
                observations: Vec::new(),
            };
        }
        self.tally.frames_processed += 1;

        let gallery = self.store.snapshot();
        let mut reports = Vec::with_capacity(observations.len());

        for obs in observations {
            self.tally.observations += 1;
            match self.gate.evaluate(&obs) {
                Err(err) => {
                    self.tally.invalid_observations += 1;
                    tracing::warn!(
                        session = %self.id,
                        frame = frame_index,
                        error = %err,
                        "invalid observation discarded"
                    );
                    reports.push(ObservationReport {
                        track_id: None,
                        gate: None,
                        decision: None,
                        invalid: Some(err.to_string()),
                    });
                }
                Ok(gate) => {
                    let decision = if gate.eligible {
                        self.tally.eligible_observations += 1;
                        self.tally.quality_sum += gate.quality;
                        let decision = self.matcher.compare(&obs.embedding, &gallery);
                        if decision.accepted {
                            if let Some(identity) = &decision.identity_id {
                                self.store.mark_matched(identity, Utc::now());
                            }
                        }
                        Some(decision)
                    } else {
                        None
                    };

                    let track_id = self.aggregator.ingest(TrackPoint {
                        frame_index,
                        captured_at_ms: obs.captured_at_ms,
                        bbox: obs.tracking_hint,
                        gate: gate.clone(),
                        decision: decision.clone(),
                    });
                    reports.push(ObservationReport {
                        track_id: Some(track_id),
                        gate: Some(gate),
                        decision,
                        invalid: None,
                    });
                }
            }
        }

        FrameReport {
            frame_index,
            sampled_out: false,
            observations: reports,
        }
    }
}

async fn run_session<R, C>(
    mut worker: SessionWorker,
    mut rx: mpsc::Receiver<SessionRequest>,
    records: Arc<R>,
    channel: Arc<C>,
) where
    R: RecordStore,
    C: SubmissionChannel,
{
    let idle_timeout = Duration::from_millis(worker.config.session_idle_timeout_ms);
    let mut closed: Option<GroupAttendanceResult> = None;

    tracing::info!(session = %worker.id, mode = ?worker.options.mode, "session opened");

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(SessionRequest::Feed { observations, reply }) => {
                    if closed.is_some() {
                        // Late observations are rejected, not silently
                        // dropped: the caller learns the session ended.
                        let _ = reply.send(Err(SessionError::SessionClosed(worker.id.clone())));
                    } else {
                        let report = worker.process_frame(observations);
                        let _ = reply.send(Ok(report));
                    }
                }
                Some(SessionRequest::End { reply }) => {
                    if closed.is_none() {
                        closed = Some(close(&mut worker, records.as_ref(), channel.as_ref()).await);
                    }
                    if let Some(result) = &closed {
                        let _ = reply.send(result.clone());
                    }
                }
                None => {
                    if closed.is_none() {
                        tracing::warn!(session = %worker.id, "session handle dropped, closing");
                        close(&mut worker, records.as_ref(), channel.as_ref()).await;
                    }
                    break;
                }
            },
            // Fresh sleep each iteration: fires only after a full idle
            // window with no requests.
            _ = tokio::time::sleep(idle_timeout), if closed.is_none() => {
                tracing::info!(session = %worker.id, timeout_ms = worker.config.session_idle_timeout_ms, "session idle timeout");
                closed = Some(close(&mut worker, records.as_ref(), channel.as_ref()).await);
            }
        }
    }

    tracing::debug!(session = %worker.id, "session task exiting");
}

/// Terminal transition: reconcile, persist, submit. Runs exactly once
/// per session.
async fn close<R, C>(worker: &mut SessionWorker, records: &R, channel: &C) -> GroupAttendanceResult
where
    R: RecordStore,
    C: SubmissionChannel,
{
    let aggregator =
        std::mem::replace(&mut worker.aggregator, TrackAggregator::new(&worker.config));
    let result = reconcile(
        &worker.id,
        &worker.options,
        aggregator.into_tracks(),
        &worker.tally,
        &worker.config,
    );

    for record in &result.records {
        match records.persist(record).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                identity = %record.identity_id,
                session = %record.session_id,
                "attendance record already stored"
            ),
            Err(err) => tracing::warn!(
                identity = %record.identity_id,
                session = %record.session_id,
                error = %err,
                "failed to persist attendance record"
            ),
        }
    }

    if let Err(err) = channel.submit(&result).await {
        tracing::warn!(session = %worker.id, error = %err, "failed to submit session result");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_core::{BoundingBox, Embedding, LivenessSubscores, QualitySubscores};

    fn config() -> EngineConfig {
        EngineConfig { embedding_dim: 3, ..EngineConfig::default() }
    }

    fn observation(values: Vec<f32>) -> Observation {
        Observation {
            tracking_hint: BoundingBox::new(10.0, 10.0, 100.0, 100.0),
            embedding: Embedding::new(values),
            quality: QualitySubscores {
                blur: 0.9,
                illumination: 0.9,
                resolution: 0.9,
                angle: 0.9,
            },
            liveness: LivenessSubscores {
                blink: 0.95,
                motion: 0.95,
                texture: 0.95,
                depth: 0.95,
            },
            anti_spoof: Some(0.95),
            captured_at_ms: 0,
        }
    }

    fn worker(config: EngineConfig) -> SessionWorker {
        let store = Arc::new(EmbeddingStore::new(config.embedding_dim));
        SessionWorker::new("s1".into(), SessionOptions::individual(), config, store)
    }

    #[test]
    fn test_frame_sampling_skips_but_advances_index() {
        let mut w = worker(config());
        let first = w.process_frame(vec![observation(vec![1.0, 0.0, 0.0])]);
        assert!(!first.sampled_out);
        let second = w.process_frame(vec![observation(vec![1.0, 0.0, 0.0])]);
        assert!(second.sampled_out);
        assert_eq!(second.frame_index, 1);
        let third = w.process_frame(vec![observation(vec![1.0, 0.0, 0.0])]);
        assert!(third.sampled_out);
        // Frame 3 is the next processed one with the default skip of 3.
        let fourth = w.process_frame(vec![observation(vec![1.0, 0.0, 0.0])]);
        assert!(!fourth.sampled_out);
        assert_eq!(fourth.frame_index, 3);
        assert_eq!(w.tally.frames_seen, 4);
        assert_eq!(w.tally.frames_processed, 2);
    }

    #[test]
    fn test_invalid_observation_aborts_only_itself() {
        let cfg = EngineConfig { frame_skip: 1, ..config() };
        let mut w = worker(cfg);
        let report = w.process_frame(vec![
            observation(vec![1.0, f32::NAN, 0.0]),
            observation(vec![1.0, 0.0, 0.0]),
        ]);
        assert_eq!(report.observations.len(), 2);
        assert!(report.observations[0].invalid.is_some());
        assert!(report.observations[0].track_id.is_none());
        assert!(report.observations[1].invalid.is_none());
        assert!(report.observations[1].track_id.is_some());
        assert_eq!(w.tally.invalid_observations, 1);
        assert_eq!(w.tally.observations, 2);
    }

    #[test]
    fn test_empty_gallery_decision_is_recorded() {
        let cfg = EngineConfig { frame_skip: 1, ..config() };
        let mut w = worker(cfg);
        let report = w.process_frame(vec![observation(vec![1.0, 0.0, 0.0])]);
        let decision = report.observations[0].decision.as_ref().unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.score, -1.0);
    }

    #[test]
    fn test_ineligible_observation_not_matched() {
        let cfg = EngineConfig { frame_skip: 1, ..config() };
        let mut w = worker(cfg);
        let mut obs = observation(vec![1.0, 0.0, 0.0]);
        obs.quality.blur = 0.2;
        obs.quality.illumination = 0.5;
        obs.quality.resolution = 0.6;
        obs.quality.angle = 0.6;
        let report = w.process_frame(vec![obs]);
        let entry = &report.observations[0];
        assert!(entry.decision.is_none());
        assert!(entry.track_id.is_some());
        assert!(!entry.gate.as_ref().unwrap().eligible);
        assert_eq!(w.tally.eligible_observations, 0);
    }
}
