//! Face track aggregation.
//!
//! Groups observations that belong to the same physical face across
//! consecutive frames of one session, using bounding-box IoU and frame
//! adjacency, so one person is never double-counted. Single-writer: the
//! session actor owns the aggregator.

use muster_core::{BoundingBox, GateResult, MatchDecision};
use uuid::Uuid;

use crate::config::EngineConfig;

/// Per-observation summary retained by a track. Raw observations (and
/// their embeddings) are ephemeral and dropped after matching.
#[derive(Debug, Clone)]
pub struct TrackPoint {
    pub frame_index: u64,
    pub captured_at_ms: u64,
    pub bbox: BoundingBox,
    pub gate: GateResult,
    /// Present only when the observation was eligible and matching ran.
    pub decision: Option<MatchDecision>,
}

/// A temporal grouping of observations believed to be one physical face.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub points: Vec<TrackPoint>,
    pub resolved_identity: Option<String>,
    /// Best accepted match similarity seen so far; -1.0 until resolved.
    pub representative_score: f32,
    disagreement_streak: u32,
    last_bbox: BoundingBox,
    last_frame: u64,
}

impl Track {
    fn open(point: TrackPoint, revoke_after: u32) -> Self {
        let mut track = Self {
            id: Uuid::new_v4(),
            points: Vec::new(),
            resolved_identity: None,
            representative_score: -1.0,
            disagreement_streak: 0,
            last_bbox: point.bbox,
            last_frame: point.frame_index,
        };
        track.absorb(point, revoke_after);
        track
    }

    pub fn observations(&self) -> usize {
        self.points.len()
    }

    /// Highest-scored decision that was not accepted, for manual review
    /// of unrecognized tracks.
    pub fn best_rejected(&self) -> Option<&MatchDecision> {
        self.points
            .iter()
            .filter_map(|p| p.decision.as_ref())
            .filter(|d| !d.accepted)
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }

    fn absorb(&mut self, point: TrackPoint, revoke_after: u32) {
        self.last_bbox = point.bbox;
        self.last_frame = point.frame_index;

        if let Some(decision) = &point.decision {
            self.apply_decision(decision, revoke_after);
        }
        self.points.push(point);
    }

    /// Resolution policy: accepted decisions support or upgrade the
    /// resolved identity; any other attempted decision is a
    /// disagreement. A resolved track is only revoked after
    /// `revoke_after` consecutive disagreements, never on a single
    /// ambiguous frame. Gate-ineligible observations never reach here.
    fn apply_decision(&mut self, decision: &MatchDecision, revoke_after: u32) {
        match (&decision.identity_id, decision.accepted) {
            (Some(id), true) => match &self.resolved_identity {
                None => {
                    tracing::debug!(track = %self.id, identity = %id, score = decision.score, "track resolved");
                    self.resolved_identity = Some(id.clone());
                    self.representative_score = decision.score;
                    self.disagreement_streak = 0;
                }
                Some(current) if current == id => {
                    self.representative_score = self.representative_score.max(decision.score);
                    self.disagreement_streak = 0;
                }
                Some(current) => {
                    if decision.score > self.representative_score {
                        tracing::debug!(
                            track = %self.id,
                            from = %current,
                            to = %id,
                            score = decision.score,
                            "track identity upgraded"
                        );
                        self.resolved_identity = Some(id.clone());
                        self.representative_score = decision.score;
                        self.disagreement_streak = 0;
                    } else {
                        self.disagree(revoke_after);
                    }
                }
            },
            _ => {
                if self.resolved_identity.is_some() {
                    self.disagree(revoke_after);
                }
            }
        }
    }

    fn disagree(&mut self, revoke_after: u32) {
        self.disagreement_streak += 1;
        if self.disagreement_streak >= revoke_after {
            tracing::debug!(
                track = %self.id,
                identity = ?self.resolved_identity,
                streak = self.disagreement_streak,
                "track resolution revoked"
            );
            self.resolved_identity = None;
            self.representative_score = -1.0;
            self.disagreement_streak = 0;
        }
    }
}

/// Groups observations into tracks within one session.
pub struct TrackAggregator {
    iou_threshold: f32,
    frame_gap_budget: u64,
    revoke_disagreements: u32,
    tracks: Vec<Track>,
}

impl TrackAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            iou_threshold: config.track_iou_threshold,
            frame_gap_budget: config.track_frame_gap_budget,
            revoke_disagreements: config.revoke_disagreements,
            tracks: Vec::new(),
        }
    }

    /// Assign the observation summary to an existing track (best IoU
    /// within the frame-gap budget) or open a new one. Returns the
    /// receiving track's id; an observation joins exactly one track.
    pub fn ingest(&mut self, point: TrackPoint) -> Uuid {
        let mut best: Option<(usize, f32)> = None;
        for (i, track) in self.tracks.iter().enumerate() {
            if point.frame_index.saturating_sub(track.last_frame) > self.frame_gap_budget {
                continue;
            }
            let iou = track.last_bbox.iou(&point.bbox);
            if iou < self.iou_threshold {
                continue;
            }
            if best.map_or(true, |(_, b)| iou > b) {
                best = Some((i, iou));
            }
        }

        match best {
            Some((i, _)) => {
                self.tracks[i].absorb(point, self.revoke_disagreements);
                self.tracks[i].id
            }
            None => {
                let track = Track::open(point, self.revoke_disagreements);
                let id = track.id;
                tracing::debug!(track = %id, frame = track.last_frame, "opened new track");
                self.tracks.push(track);
                id
            }
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn into_tracks(self) -> Vec<Track> {
        self.tracks
    }
}
