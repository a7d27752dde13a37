mod outfit;

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

pub use outfit::{categorize_mesh, infer_parts, OutfitCategory, OutfitPart};

use crate::CompanionError;

/// Model formats the viewer can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Live2d,
    Vrm,
    Gltf,
    Fbx,
    Mmd,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Live2d => "live2d",
            ModelType::Vrm => "vrm",
            ModelType::Gltf => "gltf",
            ModelType::Fbx => "fbx",
            ModelType::Mmd => "mmd",
        }
    }

    /// Static capability table used to decide which controls to offer.
    pub fn capabilities(&self) -> RendererCapabilities {
        match self {
            ModelType::Live2d | ModelType::Vrm | ModelType::Mmd => RendererCapabilities {
                has_physics: true,
                has_expressions: true,
                has_animations: true,
            },
            ModelType::Gltf | ModelType::Fbx => RendererCapabilities {
                has_physics: false,
                has_expressions: true,
                has_animations: true,
            },
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererCapabilities {
    pub has_physics: bool,
    pub has_expressions: bool,
    pub has_animations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionGroup {
    pub name: String,
    pub motions: Vec<String>,
}

impl MotionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            motions: Vec::new(),
        }
    }
}

/// Describes the model currently shown by a renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub name: String,
    pub path: PathBuf,
    pub expressions: Vec<String>,
    pub motions: Vec<MotionGroup>,
}

/// Emotion reported with a completed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
    Thinking,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprised,
        Emotion::Thinking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprised => "surprised",
            Emotion::Thinking => "thinking",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = CompanionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Emotion::ALL
            .into_iter()
            .find(|emotion| emotion.as_str() == lower)
            .ok_or_else(|| CompanionError::msg(format!("unknown emotion `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_table_matches_formats() {
        assert!(ModelType::Live2d.capabilities().has_physics);
        assert!(ModelType::Mmd.capabilities().has_physics);
        assert!(!ModelType::Gltf.capabilities().has_physics);
        assert!(!ModelType::Fbx.capabilities().has_physics);
        assert!(ModelType::Fbx.capabilities().has_animations);
    }

    #[test]
    fn emotion_parses_case_insensitively() {
        assert_eq!("Happy".parse::<Emotion>().unwrap(), Emotion::Happy);
        assert!("ecstatic".parse::<Emotion>().is_err());
        let json = serde_json::to_string(&Emotion::Surprised).unwrap();
        assert_eq!(json, r#""surprised""#);
    }

    #[test]
    fn metadata_serializes_type_field() {
        let meta = ModelMetadata {
            model_type: ModelType::Vrm,
            name: "alicia".into(),
            path: PathBuf::from("alicia.vrm"),
            expressions: vec!["happy".into()],
            motions: vec![],
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["type"], "vrm");
    }
}
