//! Enrollment workflow.
//!
//! Gates a candidate observation, guards against enrolling the same
//! face under a second key, then commits the template. Re-enrollment
//! runs the same checks before the atomic swap.

use std::sync::Arc;

use muster_core::{EmbeddingStore, EnrollError, Gate, GateRejection, GateResult, Observation};
use serde::Serialize;

use crate::config::EngineConfig;

/// Returned on successful enrollment; surfaces the gate scores the
/// candidate passed with.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollReceipt {
    pub identity_id: String,
    pub quality: f64,
    pub liveness: f64,
}

pub struct EnrollmentWorkflow {
    gate: Gate,
    match_threshold: f32,
    store: Arc<EmbeddingStore>,
}

impl EnrollmentWorkflow {
    /// Enrollment always applies the full gate; the per-session
    /// liveness relaxation does not extend to creating templates.
    pub fn new(config: &EngineConfig, store: Arc<EmbeddingStore>) -> Self {
        Self {
            gate: Gate::new(config.embedding_dim, config.gate_config(true)),
            match_threshold: config.match_threshold,
            store,
        }
    }

    pub fn enroll_candidate(
        &self,
        identity_id: &str,
        observation: &Observation,
    ) -> Result<EnrollReceipt, EnrollError> {
        let gate = self.check_candidate(identity_id, observation)?;
        self.store.enroll(identity_id, observation.embedding.clone())?;
        tracing::info!(
            identity = identity_id,
            quality = gate.quality,
            liveness = gate.liveness,
            "candidate enrolled"
        );
        Ok(EnrollReceipt {
            identity_id: identity_id.to_string(),
            quality: gate.quality,
            liveness: gate.liveness,
        })
    }

    pub fn re_enroll_candidate(
        &self,
        identity_id: &str,
        observation: &Observation,
    ) -> Result<EnrollReceipt, EnrollError> {
        let gate = self.check_candidate(identity_id, observation)?;
        self.store.re_enroll(identity_id, observation.embedding.clone())?;
        tracing::info!(
            identity = identity_id,
            quality = gate.quality,
            "candidate re-enrolled"
        );
        Ok(EnrollReceipt {
            identity_id: identity_id.to_string(),
            quality: gate.quality,
            liveness: gate.liveness,
        })
    }

    /// Gate the candidate, then scan every *other* enrolled identity:
    /// a similarity at or above the match threshold means this face is
    /// already enrolled under a different key.
    fn check_candidate(
        &self,
        identity_id: &str,
        observation: &Observation,
    ) -> Result<GateResult, EnrollError> {
        let gate = self.gate.evaluate(observation)?;
        if let Some(rejection) = gate.rejection {
            return Err(match rejection {
                GateRejection::LowQuality => EnrollError::LowQuality,
                GateRejection::NotLive => EnrollError::NotLive,
            });
        }

        let mut best: Option<(String, f32)> = None;
        for identity in self.store.snapshot() {
            if identity.id == identity_id {
                continue;
            }
            let score = observation.embedding.similarity(&identity.active_template);
            if best.as_ref().map_or(true, |(_, b)| score > *b) {
                best = Some((identity.id.clone(), score));
            }
        }
        if let Some((existing, score)) = best {
            if score >= self.match_threshold {
                tracing::warn!(
                    candidate = identity_id,
                    existing = %existing,
                    score,
                    "duplicate enrollment attempt blocked"
                );
                return Err(EnrollError::DuplicateIdentity { existing, score });
            }
        }

        Ok(gate)
    }
}
