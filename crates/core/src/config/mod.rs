use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub lip_sync: LipSyncConfig,
    pub viewer: ViewerConfig,
}

impl AppConfig {
    /// Reads a configuration file. Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Tuning constants for the lip-sync scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LipSyncConfig {
    /// How long a single character holds its mouth shape.
    pub char_duration_ms: f64,
    /// Base transition length; the closing frame lasts twice as long.
    pub transition_duration_ms: f64,
    /// Weight given to vocalic phonemes.
    pub speaking_weight: f32,
    pub enabled: bool,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            char_duration_ms: 80.0,
            transition_duration_ms: 60.0,
            speaking_weight: 0.7,
            enabled: true,
        }
    }
}

impl LipSyncConfig {
    /// Applies the fields present in `patch`. Values outside their valid range
    /// are ignored and reported in the returned list of rejected field names.
    pub fn apply(&mut self, patch: &LipSyncConfigPatch) -> Vec<&'static str> {
        let mut rejected = Vec::new();

        if let Some(value) = patch.char_duration_ms {
            if value.is_finite() && value > 0.0 {
                self.char_duration_ms = value;
            } else {
                rejected.push("charDurationMs");
            }
        }
        if let Some(value) = patch.transition_duration_ms {
            if value.is_finite() && value > 0.0 {
                self.transition_duration_ms = value;
            } else {
                rejected.push("transitionDurationMs");
            }
        }
        if let Some(value) = patch.speaking_weight {
            if value.is_finite() {
                self.speaking_weight = value.clamp(0.0, 1.0);
            } else {
                rejected.push("speakingWeight");
            }
        }
        if let Some(value) = patch.enabled {
            self.enabled = value;
        }

        rejected
    }
}

/// Partial update for [`LipSyncConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LipSyncConfigPatch {
    pub char_duration_ms: Option<f64>,
    pub transition_duration_ms: Option<f64>,
    pub speaking_weight: Option<f32>,
    pub enabled: Option<bool>,
}

/// What happens to the previous target's mouth when a different target is
/// registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHandoff {
    /// Close the previous target's mouth before switching.
    #[default]
    Reset,
    /// Leave the previous target as it is.
    Seamless,
}

/// Settings for the model viewer and its renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewerConfig {
    /// Upper bound on any single asset fetch during a model load.
    pub load_timeout_ms: u64,
    /// Fade interval used when one motion replaces another.
    pub cross_fade_ms: f64,
    pub target_handoff: TargetHandoff,
    pub width: u32,
    pub height: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 30_000,
            cross_fade_ms: 300.0,
            target_handoff: TargetHandoff::Reset,
            width: 800,
            height: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            AppConfig::from_json_str(r#"{ "lipSync": { "charDurationMs": 100 } }"#).unwrap();

        assert_eq!(config.lip_sync.char_duration_ms, 100.0);
        assert_eq!(config.lip_sync.speaking_weight, 0.7);
        assert_eq!(config.viewer, ViewerConfig::default());
    }

    #[test]
    fn patch_rejects_invalid_durations() {
        let mut config = LipSyncConfig::default();
        let rejected = config.apply(&LipSyncConfigPatch {
            char_duration_ms: Some(0.0),
            speaking_weight: Some(3.0),
            enabled: Some(false),
            ..Default::default()
        });

        assert_eq!(rejected, vec!["charDurationMs"]);
        assert_eq!(config.char_duration_ms, 80.0);
        assert_eq!(config.speaking_weight, 1.0);
        assert!(!config.enabled);
    }

    #[test]
    fn reads_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companion.json");
        std::fs::write(&path, r#"{ "viewer": { "targetHandoff": "seamless" } }"#).unwrap();

        let config = AppConfig::from_json_file(&path).unwrap();
        assert_eq!(config.viewer.target_handoff, TargetHandoff::Seamless);
    }
}
