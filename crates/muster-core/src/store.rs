//! Enrolled-template store.
//!
//! Read-mostly: matching reads take a shared lock and clone `Arc`s, so
//! concurrent matches never block each other and never observe a torn
//! template. Enroll/re-enroll hold the exclusive lock only for the swap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::gate::InvalidObservation;
use crate::types::{Embedding, Identity};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const DEFAULT_HISTORY_BOUND: usize = 5;

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("identity {0} already has an active template; re-enroll to replace it")]
    AlreadyEnrolled(String),
    #[error("identity {0} is not enrolled")]
    NotEnrolled(String),
    #[error("template has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("template component {index} is not finite")]
    NonFiniteTemplate { index: usize },
    #[error("candidate matches already-enrolled identity {existing} (similarity {score:.3})")]
    DuplicateIdentity { existing: String, score: f32 },
    #[error("observation quality below enrollment gate")]
    LowQuality,
    #[error("observation liveness not established")]
    NotLive,
    #[error(transparent)]
    InvalidObservation(#[from] InvalidObservation),
}

/// Versioned, integrity-checked serialization of the store, suitable for
/// persistence by the caller and rehydration across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub embedding_dim: usize,
    pub saved_at: DateTime<Utc>,
    /// Sorted by identity id so serialization is deterministic.
    pub identities: Vec<Identity>,
    /// SHA-256 hex digest of the canonical JSON of `identities`.
    pub checksum: String,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot version {found} (supported: {SNAPSHOT_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("snapshot checksum mismatch; refusing to load a corrupted gallery")]
    ChecksumMismatch,
    #[error("identity {id} template has {actual} dimensions, snapshot declares {expected}")]
    DimensionMismatch { id: String, expected: usize, actual: usize },
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// In-memory store of enrolled identities. Owned and injected, never a
/// process-wide singleton; independent instances are cheap.
#[derive(Debug)]
pub struct EmbeddingStore {
    dim: usize,
    history_bound: usize,
    identities: RwLock<HashMap<String, Arc<Identity>>>,
}

impl EmbeddingStore {
    pub fn new(dim: usize) -> Self {
        Self::with_history_bound(dim, DEFAULT_HISTORY_BOUND)
    }

    pub fn with_history_bound(dim: usize, history_bound: usize) -> Self {
        Self {
            dim,
            history_bound,
            identities: RwLock::new(HashMap::new()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Identity>> {
        self.read().get(id).cloned()
    }

    /// All enrolled identities, sorted by id. The returned `Arc`s are a
    /// consistent view: either fully pre- or fully post-swap.
    pub fn snapshot(&self) -> Vec<Arc<Identity>> {
        let mut all: Vec<Arc<Identity>> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Enroll a new identity. Fails with `AlreadyEnrolled` when an
    /// active template exists; use [`re_enroll`](Self::re_enroll) to
    /// replace one.
    pub fn enroll(&self, id: &str, template: Embedding) -> Result<(), EnrollError> {
        self.validate_template(&template)?;
        let mut map = self.write();
        if map.contains_key(id) {
            return Err(EnrollError::AlreadyEnrolled(id.to_string()));
        }
        map.insert(
            id.to_string(),
            Arc::new(Identity {
                id: id.to_string(),
                active_template: template,
                template_history: Vec::new(),
                enrolled_at: Utc::now(),
                last_matched_at: None,
            }),
        );
        tracing::info!(identity = id, "enrolled new identity");
        Ok(())
    }

    /// Atomically swap the active template, pushing the previous one
    /// onto bounded history (oldest dropped first).
    pub fn re_enroll(&self, id: &str, template: Embedding) -> Result<(), EnrollError> {
        self.validate_template(&template)?;
        let mut map = self.write();
        let current = map
            .get(id)
            .ok_or_else(|| EnrollError::NotEnrolled(id.to_string()))?;

        let mut history = current.template_history.clone();
        history.push(current.active_template.clone());
        while history.len() > self.history_bound {
            history.remove(0);
        }

        let replacement = Arc::new(Identity {
            id: current.id.clone(),
            active_template: template,
            template_history: history,
            enrolled_at: current.enrolled_at,
            last_matched_at: current.last_matched_at,
        });
        map.insert(id.to_string(), replacement);
        tracing::info!(identity = id, "re-enrolled identity, previous template retained");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    /// Record a successful match against this identity.
    pub fn mark_matched(&self, id: &str, at: DateTime<Utc>) {
        let mut map = self.write();
        if let Some(current) = map.get(id) {
            let mut updated = Identity::clone(current);
            updated.last_matched_at = Some(at);
            map.insert(id.to_string(), Arc::new(updated));
        }
    }

    /// Export a versioned snapshot with an integrity checksum.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        let identities: Vec<Identity> = self
            .snapshot()
            .iter()
            .map(|arc| Identity::clone(arc))
            .collect();
        let checksum = checksum_of(&identities);
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            embedding_dim: self.dim,
            saved_at: Utc::now(),
            identities,
            checksum,
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(&self.export_snapshot())?)
    }

    /// Rehydrate a store from a snapshot, verifying version, checksum,
    /// and template dimensions.
    pub fn from_snapshot(
        snapshot: StoreSnapshot,
        history_bound: usize,
    ) -> Result<Self, SnapshotError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion { found: snapshot.version });
        }
        if checksum_of(&snapshot.identities) != snapshot.checksum {
            return Err(SnapshotError::ChecksumMismatch);
        }
        for identity in &snapshot.identities {
            if identity.active_template.dim() != snapshot.embedding_dim {
                return Err(SnapshotError::DimensionMismatch {
                    id: identity.id.clone(),
                    expected: snapshot.embedding_dim,
                    actual: identity.active_template.dim(),
                });
            }
        }

        let map = snapshot
            .identities
            .into_iter()
            .map(|identity| (identity.id.clone(), Arc::new(identity)))
            .collect();
        Ok(Self {
            dim: snapshot.embedding_dim,
            history_bound,
            identities: RwLock::new(map),
        })
    }

    pub fn from_json(json: &str, history_bound: usize) -> Result<Self, SnapshotError> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        Self::from_snapshot(snapshot, history_bound)
    }

    fn validate_template(&self, template: &Embedding) -> Result<(), EnrollError> {
        if template.dim() != self.dim {
            return Err(EnrollError::DimensionMismatch {
                expected: self.dim,
                actual: template.dim(),
            });
        }
        if let Some(index) = template.first_non_finite() {
            return Err(EnrollError::NonFiniteTemplate { index });
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Identity>>> {
        self.identities.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Identity>>> {
        self.identities.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// SHA-256 hex digest of the canonical JSON of the identity list.
fn checksum_of(identities: &[Identity]) -> String {
    use std::fmt::Write;

    // Serialization of an in-memory Vec<Identity> cannot fail.
    let bytes = serde_json::to_vec(identities).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 4;

    fn template(seed: f32) -> Embedding {
        Embedding::new(vec![seed, 1.0 - seed, 0.25, 0.5])
    }

    #[test]
    fn test_enroll_and_lookup() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("u1", template(0.1)).unwrap();
        assert_eq!(store.len(), 1);
        let identity = store.get("u1").unwrap();
        assert_eq!(identity.id, "u1");
        assert!(identity.template_history.is_empty());
    }

    #[test]
    fn test_double_enroll_fails() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("u1", template(0.1)).unwrap();
        let err = store.enroll("u1", template(0.2)).unwrap_err();
        assert!(matches!(err, EnrollError::AlreadyEnrolled(_)));
    }

    #[test]
    fn test_re_enroll_requires_existing() {
        let store = EmbeddingStore::new(DIM);
        let err = store.re_enroll("ghost", template(0.1)).unwrap_err();
        assert!(matches!(err, EnrollError::NotEnrolled(_)));
    }

    #[test]
    fn test_re_enroll_pushes_history() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("u1", template(0.1)).unwrap();
        store.re_enroll("u1", template(0.2)).unwrap();

        let identity = store.get("u1").unwrap();
        assert_eq!(identity.active_template.values[0], 0.2);
        assert_eq!(identity.template_history.len(), 1);
        assert_eq!(identity.template_history[0].values[0], 0.1);
    }

    #[test]
    fn test_history_bound_drops_oldest_first() {
        let store = EmbeddingStore::with_history_bound(DIM, 2);
        store.enroll("u1", template(0.0)).unwrap();
        for i in 1..=4 {
            store.re_enroll("u1", template(i as f32 * 0.1)).unwrap();
        }

        let identity = store.get("u1").unwrap();
        assert_eq!(identity.template_history.len(), 2);
        // Templates 0.0 and 0.1 were dropped; 0.2 and 0.3 remain in order.
        assert!((identity.template_history[0].values[0] - 0.2).abs() < 1e-6);
        assert!((identity.template_history[1].values[0] - 0.3).abs() < 1e-6);
        assert!((identity.active_template.values[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_hard_error() {
        let store = EmbeddingStore::new(DIM);
        let err = store.enroll("u1", Embedding::new(vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            EnrollError::DimensionMismatch { expected: DIM, actual: 2 }
        ));
    }

    #[test]
    fn test_non_finite_template_rejected() {
        let store = EmbeddingStore::new(DIM);
        let err = store
            .enroll("u1", Embedding::new(vec![1.0, f32::INFINITY, 0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, EnrollError::NonFiniteTemplate { index: 1 }));
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("zeta", template(0.1)).unwrap();
        store.enroll("alpha", template(0.2)).unwrap();
        let snapshot = store.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_mark_matched() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("u1", template(0.1)).unwrap();
        let at = Utc::now();
        store.mark_matched("u1", at);
        assert_eq!(store.get("u1").unwrap().last_matched_at, Some(at));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("u1", template(0.1)).unwrap();
        store.enroll("u2", template(0.7)).unwrap();
        store.re_enroll("u2", template(0.8)).unwrap();

        let json = store.to_json().unwrap();
        let restored = EmbeddingStore::from_json(&json, DEFAULT_HISTORY_BOUND).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.dim(), DIM);
        let u2 = restored.get("u2").unwrap();
        assert_eq!(u2.template_history.len(), 1);
        assert!((u2.active_template.values[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_rejects_tampering() {
        let store = EmbeddingStore::new(DIM);
        store.enroll("u1", template(0.1)).unwrap();

        let mut snapshot = store.export_snapshot();
        snapshot.identities[0].active_template.values[0] = 0.9;
        let err = EmbeddingStore::from_snapshot(snapshot, DEFAULT_HISTORY_BOUND).unwrap_err();
        assert!(matches!(err, SnapshotError::ChecksumMismatch));
    }

    #[test]
    fn test_snapshot_rejects_unknown_version() {
        let store = EmbeddingStore::new(DIM);
        let mut snapshot = store.export_snapshot();
        snapshot.version = 99;
        let err = EmbeddingStore::from_snapshot(snapshot, DEFAULT_HISTORY_BOUND).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsupportedVersion { found: 99 }));
    }

    #[test]
    fn test_concurrent_readers_see_consistent_identities() {
        use std::thread;

        let store = Arc::new(EmbeddingStore::new(DIM));
        store.enroll("u1", template(0.0)).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100 {
                    store.re_enroll("u1", template((i % 10) as f32 * 0.1)).unwrap();
                }
            })
        };
        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..100 {
                    let snapshot = store.snapshot();
                    assert_eq!(snapshot.len(), 1);
                    // A template is never torn: all components finite
                    // and the vector is full-length.
                    assert_eq!(snapshot[0].active_template.dim(), DIM);
                    assert_eq!(snapshot[0].active_template.first_non_finite(), None);
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
