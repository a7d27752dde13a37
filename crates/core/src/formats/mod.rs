//! Translation from each engine's file format into [`ModelAsset`].
//!
//! Every decoder here is the single place that knows about its format's field
//! layout; the renderers only ever see the neutral asset description.

pub mod fbx;
pub mod gltf;
pub mod live2d;
pub mod pmx;
mod reader;
pub mod vmd;

use std::collections::HashMap;

use crate::{model::MotionGroup, timeline::AnimationClip};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshDesc {
    pub name: String,
    pub material: Option<String>,
    pub morph_targets: Vec<String>,
}

impl MeshDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Format-neutral description of a decoded model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelAsset {
    pub name: String,
    pub meshes: Vec<MeshDesc>,
    /// Texture references, relative to the model file until resolved.
    pub textures: Vec<String>,
    pub bones: Vec<String>,
    /// Expression channels in their authored order.
    pub expressions: Vec<String>,
    /// Morph dictionary for index-addressed morph targets.
    pub morphs: Vec<String>,
    pub clips: Vec<AnimationClip>,
    /// Motion groups declared by the file. Empty when groups are derived from
    /// clip names.
    pub motion_groups: Vec<MotionGroup>,
    /// Humanoid bone name to scene node name.
    pub humanoid: HashMap<String, String>,
    pub has_physics: bool,
    /// Parameters driven by lip sync (Live2D).
    pub lip_sync_parameters: Vec<String>,
}

/// Turns a texture reference written on any platform into a URL path.
pub fn normalize_reference(reference: &str) -> String {
    reference.replace('\\', "/")
}

/// Adds `name` unless it is already present, keeping first-seen order.
pub(crate) fn push_unique(list: &mut Vec<String>, name: &str) {
    if !name.is_empty() && !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}
