//! Cubism `model3.json` settings and `motion3.json` metadata.
//!
//! The moc3 binary itself is opaque to the core; everything the renderer
//! contract needs is declared in the settings file.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{normalize_reference, push_unique, ModelAsset};
use crate::{
    model::MotionGroup,
    timeline::{AnimationClip, Track, TrackProperty},
    Result,
};

/// Parameter opened by lip sync when the model declares no `LipSync` group.
pub const DEFAULT_MOUTH_OPEN: &str = "ParamMouthOpenY";
pub const MOUTH_FORM: &str = "ParamMouthForm";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Model3 {
    file_references: FileReferences,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileReferences {
    moc: String,
    #[serde(default)]
    textures: Vec<String>,
    #[serde(default)]
    physics: Option<String>,
    #[serde(default)]
    expressions: Vec<ExpressionRef>,
    #[serde(default)]
    motions: BTreeMap<String, Vec<MotionRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExpressionRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MotionRef {
    file: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Group {
    #[serde(default)]
    target: String,
    name: String,
    #[serde(default)]
    ids: Vec<String>,
}

/// A motion file the loader still has to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionFile {
    pub group: String,
    pub name: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model3Settings {
    pub asset: ModelAsset,
    pub moc: String,
    pub motion_files: Vec<MotionFile>,
}

/// Name shown for a motion: the file stem without the `.motion3.json` suffix.
fn motion_name(file: &str) -> String {
    let file = normalize_reference(file);
    let base = file.rsplit('/').next().unwrap_or(&file);
    base.trim_end_matches(".json")
        .trim_end_matches(".motion3")
        .to_string()
}

pub fn parse_model3(bytes: &[u8]) -> Result<Model3Settings> {
    let model: Model3 = serde_json::from_slice(bytes)?;
    let refs = model.file_references;
    let mut asset = ModelAsset {
        textures: refs.textures.iter().map(|t| normalize_reference(t)).collect(),
        has_physics: refs.physics.is_some(),
        ..Default::default()
    };

    for expression in &refs.expressions {
        push_unique(&mut asset.expressions, &expression.name);
    }

    let mut motion_files = Vec::new();
    for (group, motions) in &refs.motions {
        let mut motion_group = MotionGroup::new(group.clone());
        for motion in motions {
            let name = motion_name(&motion.file);
            motion_group.motions.push(name.clone());
            motion_files.push(MotionFile {
                group: group.clone(),
                name,
                file: normalize_reference(&motion.file),
            });
        }
        asset.motion_groups.push(motion_group);
    }

    for group in &model.groups {
        if group.name == "LipSync" && (group.target.is_empty() || group.target == "Parameter") {
            for id in &group.ids {
                push_unique(&mut asset.lip_sync_parameters, id);
            }
        }
    }
    if asset.lip_sync_parameters.is_empty() {
        asset.lip_sync_parameters.push(DEFAULT_MOUTH_OPEN.to_string());
    }

    Ok(Model3Settings {
        asset,
        moc: normalize_reference(&refs.moc),
        motion_files,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Motion3 {
    meta: Motion3Meta,
    curves: Vec<Curve>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Motion3Meta {
    duration: f64,
    #[serde(rename = "Loop")]
    looping: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Curve {
    target: String,
    id: String,
}

pub fn parse_motion3(name: &str, bytes: &[u8]) -> Result<AnimationClip> {
    let motion: Motion3 = serde_json::from_slice(bytes)?;
    let mut clip = AnimationClip::new(name, motion.meta.duration * 1000.0);
    clip.looping = motion.meta.looping;
    clip.tracks = motion
        .curves
        .into_iter()
        .filter(|curve| curve.target == "Parameter")
        .map(|curve| Track::new(curve.id, TrackProperty::Parameter))
        .collect();
    Ok(clip)
}
