//! Pluggable sub-signal scoring strategies.
//!
//! Each quality and liveness sub-signal sits behind the [`SignalScorer`]
//! trait so deployments can swap an estimator without touching the gate,
//! and each can be unit-tested in isolation. The default implementors
//! pass through the scores the external detector/embedder already
//! attaches to the observation.

use crate::types::Observation;

/// A single scoring strategy over one observation sub-signal.
///
/// Implementations must be pure: same observation, same score.
pub trait SignalScorer: Send + Sync {
    fn name(&self) -> &'static str;
    /// Score in [0, 1].
    fn score(&self, obs: &Observation) -> f64;
}

macro_rules! passthrough_signal {
    ($ty:ident, $name:literal, $($field:ident).+) => {
        pub struct $ty;

        impl SignalScorer for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn score(&self, obs: &Observation) -> f64 {
                obs.$($field).+
            }
        }
    };
}

passthrough_signal!(BlurSignal, "blur", quality.blur);
passthrough_signal!(IlluminationSignal, "illumination", quality.illumination);
passthrough_signal!(ResolutionSignal, "resolution", quality.resolution);
passthrough_signal!(AngleSignal, "angle", quality.angle);
passthrough_signal!(BlinkSignal, "blink", liveness.blink);
passthrough_signal!(MotionSignal, "motion", liveness.motion);
passthrough_signal!(TextureSignal, "texture", liveness.texture);
passthrough_signal!(DepthSignal, "depth", liveness.depth);

/// Weighted sum over a set of sub-signal scorers.
pub struct WeightedComposite {
    parts: Vec<(Box<dyn SignalScorer>, f64)>,
}

impl WeightedComposite {
    /// Build a composite from (scorer, weight) pairs. Weights are
    /// expected to sum to 1.0 so the composite stays in [0, 1].
    pub fn new(parts: Vec<(Box<dyn SignalScorer>, f64)>) -> Self {
        debug_assert!(
            (parts.iter().map(|(_, w)| w).sum::<f64>() - 1.0).abs() < 1e-9,
            "composite weights must sum to 1.0"
        );
        Self { parts }
    }

    pub fn score(&self, obs: &Observation) -> f64 {
        self.parts.iter().map(|(s, w)| w * s.score(obs)).sum()
    }

    /// Default quality composite:
    /// 0.30*blur + 0.30*illumination + 0.20*resolution + 0.20*angle.
    pub fn quality_default() -> Self {
        Self::new(vec![
            (Box::new(BlurSignal), 0.30),
            (Box::new(IlluminationSignal), 0.30),
            (Box::new(ResolutionSignal), 0.20),
            (Box::new(AngleSignal), 0.20),
        ])
    }

    /// Default liveness composite:
    /// 0.30*blink + 0.30*motion + 0.20*texture + 0.20*depth.
    pub fn liveness_default() -> Self {
        Self::new(vec![
            (Box::new(BlinkSignal), 0.30),
            (Box::new(MotionSignal), 0.30),
            (Box::new(TextureSignal), 0.20),
            (Box::new(DepthSignal), 0.20),
        ])
    }
}

/// Anti-spoof scoring strategy.
pub trait AntiSpoofSignal: Send + Sync {
    /// Score in [0, 1]; higher = more likely a live capture.
    fn score(&self, obs: &Observation) -> f64;
}

/// Uses the externally supplied anti-spoof score when present, otherwise
/// falls back to the mean of the texture and depth liveness sub-scores.
/// A flat photo or screen replay scores low on both.
pub struct TextureDepthFallback;

impl AntiSpoofSignal for TextureDepthFallback {
    fn score(&self, obs: &Observation) -> f64 {
        obs.anti_spoof
            .unwrap_or_else(|| (obs.liveness.texture + obs.liveness.depth) / 2.0)
    }
}
