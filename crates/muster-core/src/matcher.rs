//! Cosine matcher with acceptance threshold and ambiguity tie-break.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Embedding, Identity, MatchDecision, MatchRejection};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Closed lower bound: a score exactly at the threshold is accepted.
    pub match_threshold: f32,
    /// When best and runner-up are both above the threshold and closer
    /// than this margin, the decision is ambiguous and not accepted.
    pub ambiguity_margin: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { match_threshold: 0.85, ambiguity_margin: 0.03 }
    }
}

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[Arc<Identity>]) -> MatchDecision;
}

/// Cosine similarity matcher. O(N) over the gallery; always scans every
/// entry so the runner-up score is exact.
pub struct CosineMatcher {
    config: MatcherConfig,
}

impl CosineMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Arc<Identity>]) -> MatchDecision {
        if gallery.is_empty() {
            return MatchDecision::no_gallery();
        }

        let mut best_sim = f32::NEG_INFINITY;
        let mut runner_up = f32::NEG_INFINITY;
        let mut best_idx = 0usize;

        for (i, identity) in gallery.iter().enumerate() {
            let sim = probe.similarity(&identity.active_template);
            if sim > best_sim {
                runner_up = best_sim;
                best_sim = sim;
                best_idx = i;
            } else if sim > runner_up {
                runner_up = sim;
            }
        }

        let runner_up_score = if runner_up == f32::NEG_INFINITY { -1.0 } else { runner_up };

        let threshold = self.config.match_threshold;
        // Exact ties between two identities always land inside the
        // margin, so a tie is ambiguous rather than broken by gallery
        // order.
        let ambiguous = best_sim >= threshold
            && runner_up_score >= threshold
            && best_sim - runner_up_score < self.config.ambiguity_margin;

        if ambiguous {
            tracing::debug!(
                best = best_sim,
                runner_up = runner_up_score,
                margin = self.config.ambiguity_margin,
                "ambiguous match, not accepting"
            );
            MatchDecision {
                identity_id: None,
                score: best_sim,
                runner_up_score,
                accepted: false,
                rejection: Some(MatchRejection::Ambiguous),
            }
        } else if best_sim >= threshold {
            MatchDecision {
                identity_id: Some(gallery[best_idx].id.clone()),
                score: best_sim,
                runner_up_score,
                accepted: true,
                rejection: None,
            }
        } else {
            MatchDecision {
                identity_id: None,
                score: best_sim,
                runner_up_score,
                accepted: false,
                rejection: Some(MatchRejection::BelowThreshold),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity(id: &str, values: Vec<f32>) -> Arc<Identity> {
        Arc::new(Identity {
            id: id.to_string(),
            active_template: Embedding::new(values),
            template_history: Vec::new(),
            enrolled_at: Utc::now(),
            last_matched_at: None,
        })
    }

    /// Unit vector whose cosine similarity with (1, 0) is exactly `c`.
    fn unit_at(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).sqrt()]
    }

    fn matcher() -> CosineMatcher {
        CosineMatcher::new(MatcherConfig::default())
    }

    #[test]
    fn test_empty_gallery_is_deterministic_non_match() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let decision = matcher().compare(&probe, &[]);
        assert!(!decision.accepted);
        assert_eq!(decision.identity_id, None);
        assert_eq!(decision.score, -1.0);
    }

    #[test]
    fn test_self_similarity_accepted() {
        let probe = Embedding::new(vec![0.6, 0.8, 0.0]);
        let gallery = vec![identity("u1", vec![0.6, 0.8, 0.0])];
        let decision = matcher().compare(&probe, &gallery);
        assert!(decision.accepted);
        assert_eq!(decision.identity_id.as_deref(), Some("u1"));
        assert!((decision.score - 1.0).abs() < 1e-6);
        assert_eq!(decision.runner_up_score, -1.0);
    }

    #[test]
    fn test_below_threshold_rejected() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity("u1", unit_at(0.5))];
        let decision = matcher().compare(&probe, &gallery);
        assert!(!decision.accepted);
        assert_eq!(decision.identity_id, None);
        assert_eq!(decision.rejection, Some(MatchRejection::BelowThreshold));
    }

    #[test]
    fn test_threshold_is_closed_lower_bound() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity("u1", unit_at(0.9))];
        let score = matcher().compare(&probe, &gallery).score;

        // Exactly at the threshold: accepted.
        let at = CosineMatcher::new(MatcherConfig {
            match_threshold: score,
            ambiguity_margin: 0.03,
        });
        assert!(at.compare(&probe, &gallery).accepted);

        // A hair above: rejected.
        let above = CosineMatcher::new(MatcherConfig {
            match_threshold: score + f32::EPSILON * 4.0,
            ambiguity_margin: 0.03,
        });
        assert!(!above.compare(&probe, &gallery).accepted);
    }

    #[test]
    fn test_ambiguous_pair_not_accepted() {
        // Both above threshold, 0.005 apart — inside the 0.03 margin.
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity("u1", unit_at(0.86)), identity("u2", unit_at(0.855))];
        let decision = matcher().compare(&probe, &gallery);
        assert!(!decision.accepted);
        assert_eq!(decision.identity_id, None);
        assert_eq!(decision.rejection, Some(MatchRejection::Ambiguous));
        assert!(decision.score > decision.runner_up_score);
    }

    #[test]
    fn test_exact_tie_is_ambiguous_regardless_of_order() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let a = identity("u1", unit_at(0.9));
        let b = identity("u2", unit_at(0.9));

        let forward = matcher().compare(&probe, &[a.clone(), b.clone()]);
        let reverse = matcher().compare(&probe, &[b, a]);
        assert_eq!(forward.rejection, Some(MatchRejection::Ambiguous));
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_clear_winner_above_margin_accepted() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity("u1", unit_at(0.95)), identity("u2", unit_at(0.86))];
        let decision = matcher().compare(&probe, &gallery);
        assert!(decision.accepted);
        assert_eq!(decision.identity_id.as_deref(), Some("u1"));
        assert!(decision.runner_up_score >= 0.85);
    }

    #[test]
    fn test_runner_up_below_threshold_is_not_ambiguous() {
        // Runner-up close in score but below the threshold: no ambiguity.
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity("u1", unit_at(0.86)), identity("u2", unit_at(0.84))];
        let decision = matcher().compare(&probe, &gallery);
        assert!(decision.accepted);
        assert_eq!(decision.identity_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_determinism() {
        let probe = Embedding::new(vec![0.3, 0.7, 0.1]);
        let gallery = vec![
            identity("u1", vec![0.3, 0.7, 0.1]),
            identity("u2", vec![0.1, 0.9, 0.2]),
            identity("u3", vec![0.5, 0.5, 0.5]),
        ];
        let m = matcher();
        let first = m.compare(&probe, &gallery);
        for _ in 0..10 {
            assert_eq!(m.compare(&probe, &gallery), first);
        }
    }
}
