use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounding box of a detected face within a frame.
///
/// Used only as a tracking hint for grouping observations into tracks.
/// It never participates in identity decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, in [0, 1].
    ///
    /// Degenerate boxes (zero area) yield 0.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix0 = self.x.max(other.x);
        let iy0 = self.y.max(other.y);
        let ix1 = (self.x + self.width).min(other.x + other.width);
        let iy1 = (self.y + self.height).min(other.y + other.height);

        let iw = (ix1 - ix0).max(0.0);
        let ih = (iy1 - iy0).max(0.0);
        let intersection = iw * ih;

        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional in the reference deployment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Index of the first non-finite component, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.values.iter().position(|v| !v.is_finite())
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Per-observation quality sub-scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualitySubscores {
    pub blur: f64,
    pub illumination: f64,
    pub resolution: f64,
    pub angle: f64,
}

/// Per-observation liveness sub-scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LivenessSubscores {
    pub blink: f64,
    pub motion: f64,
    pub texture: f64,
    pub depth: f64,
}

/// One detected face in one frame, as produced by the external
/// detector/embedder.
///
/// Observations are ephemeral: they exist only for the duration of
/// gating and matching. Durable state is `Identity` and
/// `AttendanceRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub tracking_hint: BoundingBox,
    pub embedding: Embedding,
    pub quality: QualitySubscores,
    pub liveness: LivenessSubscores,
    /// Externally produced anti-spoof score in [0, 1]. `None` engages
    /// the fallback heuristic.
    pub anti_spoof: Option<f64>,
    /// Monotonic capture timestamp in milliseconds, caller-supplied.
    pub captured_at_ms: u64,
}

/// An enrolled person: exactly one active template plus bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub active_template: Embedding,
    /// Prior templates in insertion order, oldest first. Trimmed to the
    /// store's history bound on re-enrollment.
    pub template_history: Vec<Embedding>,
    pub enrolled_at: DateTime<Utc>,
    pub last_matched_at: Option<DateTime<Utc>>,
}

/// Why a match decision was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRejection {
    /// Best score fell below the acceptance threshold.
    BelowThreshold,
    /// Best and runner-up were too close to call; never guess between
    /// look-alike embeddings.
    Ambiguous,
}

/// Output of the matcher for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    /// Matched identity. `None` whenever the decision was not accepted.
    pub identity_id: Option<String>,
    /// Best cosine similarity found; -1.0 against an empty gallery.
    pub score: f32,
    /// Second-best similarity across distinct identities; -1.0 when
    /// there is no runner-up.
    pub runner_up_score: f32,
    pub accepted: bool,
    pub rejection: Option<MatchRejection>,
}

impl MatchDecision {
    /// The deterministic decision for an empty gallery.
    pub fn no_gallery() -> Self {
        Self {
            identity_id: None,
            score: -1.0,
            runner_up_score: -1.0,
            accepted: false,
            rejection: Some(MatchRejection::BelowThreshold),
        }
    }
}

/// Kind of attendance event a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Entry,
    Exit,
    GroupPresence,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Entry => "entry",
            RecordType::Exit => "exit",
            RecordType::GroupPresence => "group_presence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(RecordType::Entry),
            "exit" => Some(RecordType::Exit),
            "group_presence" => Some(RecordType::GroupPresence),
            _ => None,
        }
    }
}

/// Capture location reported by the field device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// The durable output of session reconciliation. At most one record per
/// (identity, session, record type) is ever proposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub session_id: String,
    pub record_type: RecordType,
    /// Best accepted match similarity of the source track.
    pub confidence: f32,
    pub location: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
    pub source_track_id: Uuid,
}
