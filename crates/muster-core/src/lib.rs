//! muster-core — Biometric matching primitives.
//!
//! Pure compute: observation types, quality/liveness gating, cosine
//! matching with ambiguity tie-break, and the enrolled-template store.
//! No I/O happens in this crate.

pub mod gate;
pub mod matcher;
pub mod signals;
pub mod store;
pub mod types;

pub use gate::{Gate, GateConfig, GateRejection, GateResult, InvalidObservation};
pub use matcher::{CosineMatcher, Matcher, MatcherConfig};
pub use store::{EmbeddingStore, EnrollError, SnapshotError, StoreSnapshot};
pub use types::{
    AttendanceRecord, BoundingBox, Embedding, GeoPoint, Identity, LivenessSubscores,
    MatchDecision, MatchRejection, Observation, QualitySubscores, RecordType,
};
