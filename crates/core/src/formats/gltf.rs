//! glTF 2.0 (JSON and GLB containers) including the VRM 0.x and 1.0
//! extensions.

use std::collections::HashMap;

use serde::{de::IgnoredAny, Deserialize};
use serde_json::Value;

use super::{push_unique, reader::ByteReader, MeshDesc, ModelAsset};
use crate::{
    timeline::{AnimationClip, Track, TrackProperty},
    CompanionError, Result,
};

const GLB_MAGIC: u32 = 0x4654_6C67;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const GLB_HEADER_LEN: usize = 12;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Root {
    nodes: Vec<Node>,
    meshes: Vec<Mesh>,
    materials: Vec<Named>,
    images: Vec<Image>,
    animations: Vec<Animation>,
    accessors: Vec<Accessor>,
    skins: Vec<Skin>,
    extensions: HashMap<String, Value>,
    extensions_used: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Node {
    name: Option<String>,
    mesh: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Mesh {
    name: Option<String>,
    primitives: Vec<Primitive>,
    extras: Option<MeshExtras>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Primitive {
    material: Option<usize>,
    targets: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MeshExtras {
    target_names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Image {
    uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Animation {
    name: Option<String>,
    channels: Vec<Channel>,
    samplers: Vec<Sampler>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Channel {
    target: ChannelTarget,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChannelTarget {
    node: Option<usize>,
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sampler {
    input: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Accessor {
    max: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Skin {
    joints: Vec<usize>,
}

/// Which avatar extension, if any, a document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrmVersion {
    V0,
    V1,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GltfDocument {
    pub asset: ModelAsset,
    pub vrm: Option<VrmVersion>,
}

/// Whether `bytes` start with a GLB header.
pub fn is_glb(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == GLB_MAGIC
}

/// Returns the JSON text of a glTF file, unwrapping the GLB container if
/// needed.
pub fn json_chunk(bytes: &[u8]) -> Result<&[u8]> {
    if !is_glb(bytes) {
        return Ok(bytes);
    }

    let mut reader = ByteReader::new(bytes, "glb");
    reader.skip(4)?;
    let version = reader.u32()?;
    if version != 2 {
        return Err(CompanionError::invalid(
            "glb",
            format!("unsupported container version {version}"),
        ));
    }
    reader.skip(4)?;
    debug_assert_eq!(reader.pos(), GLB_HEADER_LEN);

    let length = reader.u32()? as usize;
    let kind = reader.u32()?;
    if kind != CHUNK_JSON {
        return Err(CompanionError::invalid("glb", "first chunk is not JSON"));
    }
    reader.take(length)
}

/// Only the top-level `extensions` object, enough to tell a VRM apart.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtensionIndex {
    extensions: HashMap<String, IgnoredAny>,
}

/// Content sniff used by the registry: true when the document carries either
/// VRM extension object.
pub fn has_vrm_markers(bytes: &[u8]) -> bool {
    let Ok(json) = json_chunk(bytes) else {
        return false;
    };
    serde_json::from_slice::<ExtensionIndex>(json)
        .map(|index| ["VRMC_vrm", "VRM"].iter().any(|key| index.extensions.contains_key(*key)))
        .unwrap_or(false)
}

pub fn parse(bytes: &[u8]) -> Result<GltfDocument> {
    let json = json_chunk(bytes)?;
    let root: Root = serde_json::from_slice(json)?;
    let mut asset = ModelAsset::default();

    collect_meshes(&root, &mut asset);
    collect_textures(&root, &mut asset);
    collect_bones(&root, &mut asset);
    collect_clips(&root, &mut asset);

    for mesh in &asset.meshes {
        for target in &mesh.morph_targets {
            push_unique(&mut asset.morphs, target);
        }
    }

    let vrm = if let Some(vrm1) = root.extensions.get("VRMC_vrm") {
        read_vrm1(vrm1, &root, &mut asset);
        Some(VrmVersion::V1)
    } else if let Some(vrm0) = root.extensions.get("VRM") {
        read_vrm0(vrm0, &root, &mut asset);
        Some(VrmVersion::V0)
    } else {
        asset.expressions = asset.morphs.clone();
        None
    };

    if vrm.is_none() && root.extensions_used.iter().any(|e| e.starts_with("VRM")) {
        tracing::warn!("document lists a VRM extension but carries no VRM data");
    }

    Ok(GltfDocument { asset, vrm })
}

fn node_name(root: &Root, index: usize) -> String {
    root.nodes
        .get(index)
        .and_then(|node| node.name.clone())
        .unwrap_or_else(|| format!("node_{index}"))
}

fn collect_meshes(root: &Root, asset: &mut ModelAsset) {
    let describe = |index: usize, name: String| -> Option<MeshDesc> {
        let mesh = root.meshes.get(index)?;
        let target_count = mesh
            .primitives
            .iter()
            .map(|p| p.targets.len())
            .max()
            .unwrap_or(0);
        let morph_targets = match &mesh.extras {
            Some(extras) if !extras.target_names.is_empty() => extras.target_names.clone(),
            _ => (0..target_count).map(|i| format!("morph_{i}")).collect(),
        };
        let material = mesh
            .primitives
            .iter()
            .find_map(|p| p.material)
            .and_then(|m| root.materials.get(m))
            .and_then(|m| m.name.clone());
        Some(MeshDesc {
            name,
            material,
            morph_targets,
        })
    };

    for (index, node) in root.nodes.iter().enumerate() {
        if let Some(mesh_index) = node.mesh {
            let name = node
                .name
                .clone()
                .or_else(|| root.meshes.get(mesh_index).and_then(|m| m.name.clone()))
                .unwrap_or_else(|| format!("mesh_{index}"));
            asset.meshes.extend(describe(mesh_index, name));
        }
    }

    if asset.meshes.is_empty() {
        for (index, mesh) in root.meshes.iter().enumerate() {
            let name = mesh.name.clone().unwrap_or_else(|| format!("mesh_{index}"));
            asset.meshes.extend(describe(index, name));
        }
    }
}

fn collect_textures(root: &Root, asset: &mut ModelAsset) {
    for (index, image) in root.images.iter().enumerate() {
        match &image.uri {
            Some(uri) if !uri.starts_with("data:") => asset.textures.push(uri.clone()),
            _ => asset.textures.push(format!("embedded:{index}")),
        }
    }
}

fn collect_bones(root: &Root, asset: &mut ModelAsset) {
    for skin in &root.skins {
        for joint in &skin.joints {
            push_unique(&mut asset.bones, &node_name(root, *joint));
        }
    }
}

fn collect_clips(root: &Root, asset: &mut ModelAsset) {
    for (index, animation) in root.animations.iter().enumerate() {
        let name = animation
            .name
            .clone()
            .unwrap_or_else(|| format!("animation_{index}"));
        let seconds = animation
            .samplers
            .iter()
            .filter_map(|s| root.accessors.get(s.input))
            .filter_map(|a| a.max.as_ref().and_then(|m| m.first().copied()))
            .fold(0.0_f64, f64::max);

        let mut clip = AnimationClip::new(name, seconds * 1000.0);
        for channel in &animation.channels {
            let Some(node) = channel.target.node else {
                continue;
            };
            let property = match channel.target.path.as_str() {
                "translation" => TrackProperty::Translation,
                "rotation" => TrackProperty::Rotation,
                "scale" => TrackProperty::Scale,
                "weights" => TrackProperty::Morph,
                _ => continue,
            };
            clip.tracks.push(Track::new(node_name(root, node), property));
        }
        asset.clips.push(clip);
    }
}

fn read_vrm0(ext: &Value, root: &Root, asset: &mut ModelAsset) {
    if let Some(title) = ext.pointer("/meta/title").and_then(Value::as_str) {
        asset.name = title.to_string();
    }

    let groups = ext
        .pointer("/blendShapeMaster/blendShapeGroups")
        .and_then(Value::as_array);
    for group in groups.into_iter().flatten() {
        let preset = group.get("presetName").and_then(Value::as_str).unwrap_or("");
        let name = group.get("name").and_then(Value::as_str).unwrap_or("");
        let label = if preset.is_empty() || preset == "unknown" {
            name
        } else {
            preset
        };
        push_unique(&mut asset.expressions, label);
    }

    let bones = ext.pointer("/humanoid/humanBones").and_then(Value::as_array);
    for bone in bones.into_iter().flatten() {
        let (Some(name), Some(node)) = (
            bone.get("bone").and_then(Value::as_str),
            bone.get("node").and_then(Value::as_u64),
        ) else {
            continue;
        };
        asset
            .humanoid
            .insert(name.to_string(), node_name(root, node as usize));
    }

    asset.has_physics = ext
        .pointer("/secondaryAnimation/boneGroups")
        .and_then(Value::as_array)
        .is_some_and(|groups| !groups.is_empty());
}

fn read_vrm1(ext: &Value, root: &Root, asset: &mut ModelAsset) {
    if let Some(name) = ext.pointer("/meta/name").and_then(Value::as_str) {
        asset.name = name.to_string();
    }

    for section in ["/expressions/preset", "/expressions/custom"] {
        if let Some(map) = ext.pointer(section).and_then(Value::as_object) {
            for key in map.keys() {
                push_unique(&mut asset.expressions, key);
            }
        }
    }

    if let Some(bones) = ext.pointer("/humanoid/humanBones").and_then(Value::as_object) {
        for (name, bone) in bones {
            if let Some(node) = bone.get("node").and_then(Value::as_u64) {
                asset
                    .humanoid
                    .insert(name.clone(), node_name(root, node as usize));
            }
        }
    }

    asset.has_physics = root
        .extensions
        .get("VRMC_springBone")
        .and_then(|spring| spring.get("springs"))
        .and_then(Value::as_array)
        .is_some_and(|springs| !springs.is_empty());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Wraps a JSON document in a GLB container.
    pub(crate) fn glb(document: &Value) -> Vec<u8> {
        let mut json = serde_json::to_vec(document).unwrap();
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let total = GLB_HEADER_LEN + 8 + json.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
        out.extend_from_slice(&json);
        out
    }

    pub(crate) fn plain_document() -> Value {
        json!({
            "asset": { "version": "2.0" },
            "nodes": [
                { "name": "Body", "mesh": 0 },
                { "name": "Hair", "mesh": 1 },
                { "name": "Hips" },
                { "name": "Spine" }
            ],
            "meshes": [
                {
                    "primitives": [{ "material": 0, "targets": [{}, {}] }],
                    "extras": { "targetNames": ["happy", "sad"] }
                },
                { "primitives": [{ "material": 1 }] }
            ],
            "materials": [{ "name": "skin" }, { "name": "hair" }],
            "images": [{ "uri": "textures/body.png" }, { "bufferView": 3 }],
            "skins": [{ "joints": [2, 3] }],
            "accessors": [{ "max": [1.5] }, { "max": [2.0] }],
            "animations": [{
                "name": "Idle",
                "channels": [
                    { "sampler": 0, "target": { "node": 2, "path": "rotation" } },
                    { "sampler": 1, "target": { "node": 0, "path": "weights" } }
                ],
                "samplers": [{ "input": 0 }, { "input": 1 }]
            }]
        })
    }

    pub(crate) fn vrm0_document() -> Value {
        let mut doc = plain_document();
        doc["extensionsUsed"] = json!(["VRM"]);
        doc["extensions"] = json!({
            "VRM": {
                "meta": { "title": "Alicia" },
                "blendShapeMaster": { "blendShapeGroups": [
                    { "name": "A", "presetName": "a" },
                    { "name": "I", "presetName": "i" },
                    { "name": "Joy", "presetName": "joy" },
                    { "name": "Sorrow", "presetName": "sorrow" },
                    { "name": "Smirk", "presetName": "unknown" }
                ]},
                "humanoid": { "humanBones": [
                    { "bone": "hips", "node": 2 },
                    { "bone": "spine", "node": 3 }
                ]},
                "secondaryAnimation": { "boneGroups": [{ "bones": [1] }] }
            }
        });
        doc
    }

    #[test]
    fn parses_plain_gltf() {
        let doc = parse(&serde_json::to_vec(&plain_document()).unwrap()).unwrap();
        let asset = doc.asset;

        assert!(doc.vrm.is_none());
        assert_eq!(asset.meshes.len(), 2);
        assert_eq!(asset.meshes[0].name, "Body");
        assert_eq!(asset.meshes[0].material.as_deref(), Some("skin"));
        assert_eq!(asset.meshes[0].morph_targets, vec!["happy", "sad"]);
        assert_eq!(asset.expressions, vec!["happy", "sad"]);
        assert_eq!(asset.textures, vec!["textures/body.png", "embedded:1"]);
        assert_eq!(asset.bones, vec!["Hips", "Spine"]);
        assert_eq!(asset.clips[0].duration_ms, 2000.0);
        assert_eq!(
            asset.clips[0].tracks[1],
            Track::new("Body", TrackProperty::Morph)
        );
    }

    #[test]
    fn parses_vrm0_inside_glb() {
        let bytes = glb(&vrm0_document());
        assert!(is_glb(&bytes));
        assert!(has_vrm_markers(&bytes));

        let doc = parse(&bytes).unwrap();
        assert_eq!(doc.vrm, Some(VrmVersion::V0));
        assert_eq!(doc.asset.name, "Alicia");
        assert_eq!(doc.asset.expressions, vec!["a", "i", "joy", "sorrow", "Smirk"]);
        assert_eq!(doc.asset.humanoid["hips"], "Hips");
        assert!(doc.asset.has_physics);
    }

    #[test]
    fn parses_vrm1_expressions() {
        let mut doc = plain_document();
        doc["extensions"] = json!({
            "VRMC_vrm": {
                "meta": { "name": "Seed" },
                "expressions": {
                    "preset": { "aa": {}, "happy": {} },
                    "custom": { "wink": {} }
                },
                "humanoid": { "humanBones": { "hips": { "node": 2 } } }
            }
        });
        let parsed = parse(&glb(&doc)).unwrap();

        assert_eq!(parsed.vrm, Some(VrmVersion::V1));
        assert_eq!(parsed.asset.expressions, vec!["aa", "happy", "wink"]);
        assert!(!parsed.asset.has_physics);
    }

    #[test]
    fn plain_glb_has_no_markers() {
        assert!(!has_vrm_markers(&glb(&plain_document())));
        assert!(!has_vrm_markers(b"not a model"));
    }

    #[test]
    fn names_that_mention_vrm_are_not_markers() {
        let mut doc = plain_document();
        doc["nodes"][0]["name"] = json!("VRM");
        doc["meshes"][0]["name"] = json!("VRMC_vrm");
        doc["extensionsUsed"] = json!(["VRM"]);
        assert!(!has_vrm_markers(&glb(&doc)));

        let registry = crate::RendererRegistry::with_defaults();
        let probe = crate::ModelProbe::with_bytes("scene.glb", &glb(&doc));
        assert_eq!(registry.select(&probe), Some("gltf"));
    }

    #[test]
    fn rejects_truncated_glb() {
        let mut bytes = glb(&plain_document());
        bytes.truncate(30);
        assert!(parse(&bytes).is_err());
    }
}
