//! Attendance reconciliation.
//!
//! Folds a closed session's tracks into at most one attendance record
//! per (identity, session, record type), reports unresolved tracks for
//! manual review, and summarizes capture quality. Never fails for a
//! session containing unresolved tracks; partial success is the default.

use std::collections::HashSet;

use chrono::Utc;
use muster_core::{AttendanceRecord, MatchDecision, RecordType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::session::{SessionMode, SessionOptions};
use crate::track::Track;

/// Running per-session counters, accumulated by the session worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTally {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub observations: u64,
    pub eligible_observations: u64,
    pub invalid_observations: u64,
    /// Sum of gate quality over eligible observations.
    pub quality_sum: f64,
}

/// A track that closed without a resolved identity. Carried in the
/// result for manual follow-up; never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnrecognizedTrack {
    pub track_id: Uuid,
    pub observations: usize,
    /// Best rejected decision, if matching ran at all for this track.
    pub best_rejected: Option<MatchDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub observations: u64,
    pub eligible_observations: u64,
    pub invalid_observations: u64,
    /// Mean gate quality across eligible observations; 0.0 when none.
    pub frame_quality: f64,
    /// Tracks folded into an existing record instead of duplicating it.
    pub merged_count: u64,
    /// Set when `frame_quality` fell below the configured floor; the
    /// caller should prompt for a re-scan instead of trusting the batch.
    pub rescan_recommended: bool,
}

/// Result of reconciling one capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAttendanceResult {
    pub session_id: String,
    pub mode: SessionMode,
    pub record_type: RecordType,
    pub records: Vec<AttendanceRecord>,
    pub unrecognized: Vec<UnrecognizedTrack>,
    pub stats: SessionStats,
}

/// Reconcile closed tracks into the session result. Pure: emission to
/// the record store happens separately.
pub fn reconcile(
    session_id: &str,
    options: &SessionOptions,
    tracks: Vec<Track>,
    tally: &SessionTally,
    config: &EngineConfig,
) -> GroupAttendanceResult {
    let mut seen: HashSet<String> = HashSet::new();
    let mut records = Vec::new();
    let mut unrecognized = Vec::new();
    let mut merged_count = 0u64;
    let created_at = Utc::now();

    for track in tracks {
        match &track.resolved_identity {
            Some(identity_id) => {
                if seen.insert(identity_id.clone()) {
                    records.push(AttendanceRecord {
                        identity_id: identity_id.clone(),
                        session_id: session_id.to_string(),
                        record_type: options.record_type,
                        confidence: track.representative_score,
                        location: options.location,
                        created_at,
                        source_track_id: track.id,
                    });
                } else {
                    // A later track for an already-recorded identity is
                    // folded into statistics, never duplicated.
                    merged_count += 1;
                }
            }
            None => {
                unrecognized.push(UnrecognizedTrack {
                    track_id: track.id,
                    observations: track.observations(),
                    best_rejected: track.best_rejected().cloned(),
                });
            }
        }
    }

    let frame_quality = if tally.eligible_observations > 0 {
        tally.quality_sum / tally.eligible_observations as f64
    } else {
        0.0
    };

    let stats = SessionStats {
        frames_seen: tally.frames_seen,
        frames_processed: tally.frames_processed,
        observations: tally.observations,
        eligible_observations: tally.eligible_observations,
        invalid_observations: tally.invalid_observations,
        frame_quality,
        merged_count,
        rescan_recommended: frame_quality < config.rescan_quality_floor,
    };

    tracing::info!(
        session = session_id,
        records = records.len(),
        unrecognized = unrecognized.len(),
        merged = merged_count,
        frame_quality,
        "session reconciled"
    );

    GroupAttendanceResult {
        session_id: session_id.to_string(),
        mode: options.mode,
        record_type: options.record_type,
        records,
        unrecognized,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{TrackAggregator, TrackPoint};
    use muster_core::{BoundingBox, GateResult, MatchRejection};

    fn options() -> SessionOptions {
        SessionOptions::group()
    }

    fn gate_ok(quality: f64) -> GateResult {
        GateResult {
            quality,
            liveness: 0.95,
            anti_spoof: 0.95,
            eligible: true,
            rejection: None,
        }
    }

    fn accepted(id: &str, score: f32) -> MatchDecision {
        MatchDecision {
            identity_id: Some(id.to_string()),
            score,
            runner_up_score: -1.0,
            accepted: true,
            rejection: None,
        }
    }

    fn rejected(score: f32) -> MatchDecision {
        MatchDecision {
            identity_id: None,
            score,
            runner_up_score: -1.0,
            accepted: false,
            rejection: Some(MatchRejection::BelowThreshold),
        }
    }

    fn point(frame: u64, x: f32, decision: Option<MatchDecision>) -> TrackPoint {
        TrackPoint {
            frame_index: frame,
            captured_at_ms: frame * 33,
            bbox: BoundingBox::new(x, 0.0, 100.0, 100.0),
            gate: gate_ok(0.9),
            decision,
        }
    }

    fn tally(eligible: u64, quality_sum: f64) -> SessionTally {
        SessionTally {
            frames_seen: 10,
            frames_processed: 4,
            observations: eligible,
            eligible_observations: eligible,
            invalid_observations: 0,
            quality_sum,
        }
    }

    #[test]
    fn test_one_record_per_identity() {
        let mut agg = TrackAggregator::new(&EngineConfig::default());
        // Two widely separated tracks resolving to the same identity.
        agg.ingest(point(0, 0.0, Some(accepted("u1", 0.92))));
        agg.ingest(point(0, 600.0, Some(accepted("u1", 0.88))));

        let result = reconcile(
            "s1",
            &options(),
            agg.into_tracks(),
            &tally(2, 1.8),
            &EngineConfig::default(),
        );
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].identity_id, "u1");
        assert_eq!(result.records[0].confidence, 0.92);
        assert_eq!(result.stats.merged_count, 1);
        assert!(result.unrecognized.is_empty());
    }

    #[test]
    fn test_unresolved_tracks_reported_not_dropped() {
        let mut agg = TrackAggregator::new(&EngineConfig::default());
        agg.ingest(point(0, 0.0, Some(accepted("u1", 0.92))));
        agg.ingest(point(0, 600.0, Some(rejected(0.7))));

        let result = reconcile(
            "s1",
            &options(),
            agg.into_tracks(),
            &tally(2, 1.8),
            &EngineConfig::default(),
        );
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.unrecognized.len(), 1);
        let review = &result.unrecognized[0];
        assert_eq!(review.best_rejected.as_ref().unwrap().score, 0.7);
    }

    #[test]
    fn test_frame_quality_mean_and_rescan_flag() {
        let agg = TrackAggregator::new(&EngineConfig::default());
        let result = reconcile(
            "s1",
            &options(),
            agg.into_tracks(),
            &tally(4, 4.0 * 0.45),
            &EngineConfig::default(),
        );
        assert!((result.stats.frame_quality - 0.45).abs() < 1e-12);
        assert!(result.stats.rescan_recommended);
    }

    #[test]
    fn test_good_quality_session_not_flagged() {
        let agg = TrackAggregator::new(&EngineConfig::default());
        let result = reconcile(
            "s1",
            &options(),
            agg.into_tracks(),
            &tally(4, 4.0 * 0.9),
            &EngineConfig::default(),
        );
        assert!(!result.stats.rescan_recommended);
    }

    #[test]
    fn test_empty_session_reconciles_cleanly() {
        let agg = TrackAggregator::new(&EngineConfig::default());
        let result = reconcile(
            "s1",
            &options(),
            agg.into_tracks(),
            &SessionTally::default(),
            &EngineConfig::default(),
        );
        assert!(result.records.is_empty());
        assert!(result.unrecognized.is_empty());
        assert_eq!(result.stats.frame_quality, 0.0);
    }

    #[test]
    fn test_record_carries_session_context() {
        let mut agg = TrackAggregator::new(&EngineConfig::default());
        agg.ingest(point(0, 0.0, Some(accepted("u1", 0.92))));

        let mut opts = options();
        opts.location = Some(muster_core::GeoPoint { latitude: 52.3, longitude: 4.9 });
        let result = reconcile(
            "site-7",
            &opts,
            agg.into_tracks(),
            &tally(1, 0.9),
            &EngineConfig::default(),
        );
        let record = &result.records[0];
        assert_eq!(record.session_id, "site-7");
        assert_eq!(record.record_type, RecordType::GroupPresence);
        assert!(record.location.is_some());
    }
}
