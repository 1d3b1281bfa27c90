use std::path::Path;

use muster_core::{GateConfig, MatcherConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine configuration. Every knob has a compiled default, a `MUSTER_*`
/// environment override, and can be loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding dimensionality, fixed across the whole system.
    pub embedding_dim: usize,
    /// Cosine similarity acceptance threshold (closed lower bound).
    pub match_threshold: f32,
    /// Best-vs-runner-up margin below which a match is ambiguous.
    pub ambiguity_margin: f32,
    pub quality_threshold: f64,
    pub liveness_threshold: f64,
    pub anti_spoof_threshold: f64,
    /// Process every Nth frame; skipped frames still advance the index.
    pub frame_skip: u64,
    /// Minimum IoU for an observation to join an existing track.
    pub track_iou_threshold: f32,
    /// Maximum frame gap for an observation to join an existing track.
    pub track_frame_gap_budget: u64,
    /// Idle time after which a session closes itself.
    pub session_idle_timeout_ms: u64,
    /// Prior templates retained per identity.
    pub template_history_bound: usize,
    /// Consecutive disagreeing frames required to revoke a resolved track.
    pub revoke_disagreements: u32,
    /// Sessions with mean frame quality below this floor are flagged for
    /// re-scan.
    pub rescan_quality_floor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 512,
            match_threshold: 0.85,
            ambiguity_margin: 0.03,
            quality_threshold: 0.8,
            liveness_threshold: 0.9,
            anti_spoof_threshold: 0.8,
            frame_skip: 3,
            track_iou_threshold: 0.3,
            track_frame_gap_budget: 3,
            session_idle_timeout_ms: 5000,
            template_history_bound: 5,
            revoke_disagreements: 3,
            rescan_quality_floor: 0.6,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl EngineConfig {
    /// Load configuration from `MUSTER_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            embedding_dim: env_usize("MUSTER_EMBEDDING_DIM", d.embedding_dim),
            match_threshold: env_f32("MUSTER_MATCH_THRESHOLD", d.match_threshold),
            ambiguity_margin: env_f32("MUSTER_AMBIGUITY_MARGIN", d.ambiguity_margin),
            quality_threshold: env_f64("MUSTER_QUALITY_THRESHOLD", d.quality_threshold),
            liveness_threshold: env_f64("MUSTER_LIVENESS_THRESHOLD", d.liveness_threshold),
            anti_spoof_threshold: env_f64("MUSTER_ANTI_SPOOF_THRESHOLD", d.anti_spoof_threshold),
            frame_skip: env_u64("MUSTER_FRAME_SKIP", d.frame_skip).max(1),
            track_iou_threshold: env_f32("MUSTER_TRACK_IOU_THRESHOLD", d.track_iou_threshold),
            track_frame_gap_budget: env_u64(
                "MUSTER_TRACK_FRAME_GAP_BUDGET",
                d.track_frame_gap_budget,
            ),
            session_idle_timeout_ms: env_u64(
                "MUSTER_SESSION_IDLE_TIMEOUT_MS",
                d.session_idle_timeout_ms,
            ),
            template_history_bound: env_usize(
                "MUSTER_TEMPLATE_HISTORY_BOUND",
                d.template_history_bound,
            ),
            revoke_disagreements: env_u32("MUSTER_REVOKE_DISAGREEMENTS", d.revoke_disagreements),
            rescan_quality_floor: env_f64("MUSTER_RESCAN_QUALITY_FLOOR", d.rescan_quality_floor),
        }
    }

    /// Load configuration from a TOML file; missing keys fall back to
    /// defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn gate_config(&self, require_liveness: bool) -> GateConfig {
        GateConfig {
            quality_threshold: self.quality_threshold,
            liveness_threshold: self.liveness_threshold,
            anti_spoof_threshold: self.anti_spoof_threshold,
            require_liveness,
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            match_threshold: self.match_threshold,
            ambiguity_margin: self.ambiguity_margin,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.match_threshold, 0.85);
        assert_eq!(config.ambiguity_margin, 0.03);
        assert_eq!(config.quality_threshold, 0.8);
        assert_eq!(config.liveness_threshold, 0.9);
        assert_eq!(config.frame_skip, 3);
        assert_eq!(config.track_iou_threshold, 0.3);
        assert_eq!(config.track_frame_gap_budget, 3);
        assert_eq!(config.session_idle_timeout_ms, 5000);
        assert_eq!(config.template_history_bound, 5);
        assert_eq!(config.revoke_disagreements, 3);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: EngineConfig =
            toml::from_str("match_threshold = 0.9\nframe_skip = 1\n").unwrap();
        assert_eq!(config.match_threshold, 0.9);
        assert_eq!(config.frame_skip, 1);
        assert_eq!(config.ambiguity_margin, 0.03);
        assert_eq!(config.embedding_dim, 512);
    }

    #[test]
    fn test_gate_config_projection() {
        let config = EngineConfig::default();
        let gate = config.gate_config(false);
        assert_eq!(gate.quality_threshold, 0.8);
        assert_eq!(gate.liveness_threshold, 0.9);
        assert!(!gate.require_liveness);
    }
}
