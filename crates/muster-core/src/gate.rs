//! Quality & liveness gate.
//!
//! Decides whether an observation is eligible for matching or
//! enrollment. Pure function over its inputs: the same observation
//! always produces the same result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signals::{AntiSpoofSignal, TextureDepthFallback, WeightedComposite};
use crate::types::Observation;

/// Structurally invalid input. This is the only hard error on the
/// observation path; it aborts that single observation and is never
/// passed downstream into matching.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidObservation {
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding component {index} is not finite")]
    NonFiniteEmbedding { index: usize },
    #[error("{signal} sub-score {value} is outside [0, 1]")]
    SubscoreOutOfRange { signal: &'static str, value: f64 },
}

/// Which gate condition failed. Used to map enrollment rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRejection {
    LowQuality,
    NotLive,
}

/// Composite scores and the eligibility verdict for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub quality: f64,
    pub liveness: f64,
    pub anti_spoof: f64,
    pub eligible: bool,
    pub rejection: Option<GateRejection>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateConfig {
    pub quality_threshold: f64,
    pub liveness_threshold: f64,
    pub anti_spoof_threshold: f64,
    /// Liveness and anti-spoof conditions apply unless the caller
    /// explicitly disables them (low-risk re-verification flows only).
    pub require_liveness: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.8,
            liveness_threshold: 0.9,
            anti_spoof_threshold: 0.8,
            require_liveness: true,
        }
    }
}

/// Quality & liveness gate over pluggable signal strategies.
pub struct Gate {
    config: GateConfig,
    expected_dim: usize,
    quality: WeightedComposite,
    liveness: WeightedComposite,
    anti_spoof: Box<dyn AntiSpoofSignal>,
}

impl Gate {
    /// Gate with the default signal wiring.
    pub fn new(expected_dim: usize, config: GateConfig) -> Self {
        Self::with_signals(
            expected_dim,
            config,
            WeightedComposite::quality_default(),
            WeightedComposite::liveness_default(),
            Box::new(TextureDepthFallback),
        )
    }

    /// Gate with custom signal strategies.
    pub fn with_signals(
        expected_dim: usize,
        config: GateConfig,
        quality: WeightedComposite,
        liveness: WeightedComposite,
        anti_spoof: Box<dyn AntiSpoofSignal>,
    ) -> Self {
        Self { config, expected_dim, quality, liveness, anti_spoof }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Validate structure, compose the scores, and decide eligibility.
    pub fn evaluate(&self, obs: &Observation) -> Result<GateResult, InvalidObservation> {
        self.validate(obs)?;

        let quality = self.quality.score(obs);
        let liveness = self.liveness.score(obs);
        let anti_spoof = self.anti_spoof.score(obs);

        let quality_ok = quality >= self.config.quality_threshold;
        let live_ok = !self.config.require_liveness
            || (liveness >= self.config.liveness_threshold
                && anti_spoof >= self.config.anti_spoof_threshold);

        let rejection = if !quality_ok {
            Some(GateRejection::LowQuality)
        } else if !live_ok {
            Some(GateRejection::NotLive)
        } else {
            None
        };

        let result = GateResult {
            quality,
            liveness,
            anti_spoof,
            eligible: rejection.is_none(),
            rejection,
        };

        if !result.eligible {
            tracing::debug!(
                quality,
                liveness,
                anti_spoof,
                rejection = ?result.rejection,
                "observation gated out"
            );
        }

        Ok(result)
    }

    fn validate(&self, obs: &Observation) -> Result<(), InvalidObservation> {
        if obs.embedding.dim() != self.expected_dim {
            return Err(InvalidObservation::DimensionMismatch {
                expected: self.expected_dim,
                actual: obs.embedding.dim(),
            });
        }
        if let Some(index) = obs.embedding.first_non_finite() {
            return Err(InvalidObservation::NonFiniteEmbedding { index });
        }

        let subscores = [
            ("blur", obs.quality.blur),
            ("illumination", obs.quality.illumination),
            ("resolution", obs.quality.resolution),
            ("angle", obs.quality.angle),
            ("blink", obs.liveness.blink),
            ("motion", obs.liveness.motion),
            ("texture", obs.liveness.texture),
            ("depth", obs.liveness.depth),
        ];
        for (signal, value) in subscores {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(InvalidObservation::SubscoreOutOfRange { signal, value });
            }
        }
        if let Some(value) = obs.anti_spoof {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(InvalidObservation::SubscoreOutOfRange {
                    signal: "anti_spoof",
                    value,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding, LivenessSubscores, QualitySubscores};

    const DIM: usize = 4;

    fn observation(quality: f64, liveness: f64) -> Observation {
        Observation {
            tracking_hint: BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            embedding: Embedding::new(vec![1.0, 0.0, 0.0, 0.0]),
            quality: QualitySubscores {
                blur: quality,
                illumination: quality,
                resolution: quality,
                angle: quality,
            },
            liveness: LivenessSubscores {
                blink: liveness,
                motion: liveness,
                texture: liveness,
                depth: liveness,
            },
            anti_spoof: Some(0.95),
            captured_at_ms: 0,
        }
    }

    fn gate() -> Gate {
        Gate::new(DIM, GateConfig::default())
    }

    #[test]
    fn test_good_observation_eligible() {
        let result = gate().evaluate(&observation(0.9, 0.95)).unwrap();
        assert!(result.eligible);
        assert!(result.rejection.is_none());
        assert!((result.quality - 0.9).abs() < 1e-12);
        assert!((result.liveness - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_low_quality_rejected() {
        // blur 0.2 drags the composite to 0.5, below the 0.8 default
        let mut obs = observation(0.9, 0.95);
        obs.quality = QualitySubscores {
            blur: 0.2,
            illumination: 0.5,
            resolution: 0.6,
            angle: 0.6,
        };
        let result = gate().evaluate(&obs).unwrap();
        assert!(!result.eligible);
        assert_eq!(result.rejection, Some(GateRejection::LowQuality));
    }

    #[test]
    fn test_low_liveness_rejected() {
        let result = gate().evaluate(&observation(0.9, 0.5)).unwrap();
        assert!(!result.eligible);
        assert_eq!(result.rejection, Some(GateRejection::NotLive));
    }

    #[test]
    fn test_low_anti_spoof_rejected() {
        let mut obs = observation(0.9, 0.95);
        obs.anti_spoof = Some(0.3);
        let result = gate().evaluate(&obs).unwrap();
        assert!(!result.eligible);
        assert_eq!(result.rejection, Some(GateRejection::NotLive));
    }

    #[test]
    fn test_liveness_requirement_disabled() {
        let gate = Gate::new(
            DIM,
            GateConfig { require_liveness: false, ..GateConfig::default() },
        );
        let mut obs = observation(0.9, 0.2);
        obs.anti_spoof = Some(0.1);
        let result = gate.evaluate(&obs).unwrap();
        assert!(result.eligible);
    }

    #[test]
    fn test_threshold_is_closed_bound() {
        // Composite exactly at the threshold passes.
        let result = gate().evaluate(&observation(0.8, 0.9)).unwrap();
        assert!(result.eligible);
    }

    #[test]
    fn test_wrong_dimension_is_hard_error() {
        let mut obs = observation(0.9, 0.95);
        obs.embedding = Embedding::new(vec![1.0, 0.0]);
        let err = gate().evaluate(&obs).unwrap_err();
        assert_eq!(err, InvalidObservation::DimensionMismatch { expected: DIM, actual: 2 });
    }

    #[test]
    fn test_nan_embedding_is_hard_error() {
        let mut obs = observation(0.9, 0.95);
        obs.embedding = Embedding::new(vec![1.0, f32::NAN, 0.0, 0.0]);
        let err = gate().evaluate(&obs).unwrap_err();
        assert_eq!(err, InvalidObservation::NonFiniteEmbedding { index: 1 });
    }

    #[test]
    fn test_out_of_range_subscore_is_hard_error() {
        let mut obs = observation(0.9, 0.95);
        obs.quality.blur = 1.4;
        let err = gate().evaluate(&obs).unwrap_err();
        assert!(matches!(
            err,
            InvalidObservation::SubscoreOutOfRange { signal: "blur", .. }
        ));
    }

    #[test]
    fn test_nan_anti_spoof_is_hard_error() {
        let mut obs = observation(0.9, 0.95);
        obs.anti_spoof = Some(f64::NAN);
        let err = gate().evaluate(&obs).unwrap_err();
        assert!(matches!(
            err,
            InvalidObservation::SubscoreOutOfRange { signal: "anti_spoof", .. }
        ));
    }

    #[test]
    fn test_gate_idempotence() {
        let obs = observation(0.85, 0.92);
        let g = gate();
        let first = g.evaluate(&obs).unwrap();
        let second = g.evaluate(&obs).unwrap();
        assert_eq!(first, second);
    }
}
