//! Binary FBX (7.x) node tree reader.
//!
//! The document is parsed into a generic [`FbxNode`] tree, then the `Objects`
//! and `Connections` sections are interpreted just far enough to name meshes,
//! blend shape channels, limb nodes, textures and animation stacks.

use std::collections::HashMap;

use super::{normalize_reference, push_unique, reader::ByteReader, MeshDesc, ModelAsset};
use crate::{
    timeline::{AnimationClip, Track, TrackProperty},
    CompanionError, Result,
};

const FORMAT: &str = "fbx";
const MAGIC: &[u8] = b"Kaydara FBX Binary  \0";
const HEADER_LEN: usize = 27;
/// FBX time units per second.
const KTIME_PER_SECOND: f64 = 46_186_158_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum FbxProperty {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Raw(usize),
    Array(usize),
}

impl FbxProperty {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FbxProperty::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FbxProperty::Str(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FbxNode {
    pub name: String,
    pub properties: Vec<FbxProperty>,
    pub children: Vec<FbxNode>,
}

impl FbxNode {
    pub fn child(&self, name: &str) -> Option<&FbxNode> {
        self.children.iter().find(|child| child.name == name)
    }

    fn object_id(&self) -> Option<i64> {
        self.properties.first().and_then(FbxProperty::as_i64)
    }

    /// Object names are stored as `Name\0\x01Class`.
    fn object_name(&self) -> String {
        let raw = self
            .properties
            .get(1)
            .and_then(FbxProperty::as_str)
            .unwrap_or("");
        raw.split("\u{0}\u{1}").next().unwrap_or("").to_string()
    }

    fn object_subtype(&self) -> &str {
        self.properties
            .get(2)
            .and_then(FbxProperty::as_str)
            .unwrap_or("")
    }

    /// Looks up a `Properties70` entry and returns its last value.
    fn property70(&self, key: &str) -> Option<&FbxProperty> {
        self.child("Properties70")?
            .children
            .iter()
            .find(|p| p.properties.first().and_then(FbxProperty::as_str) == Some(key))
            .and_then(|p| p.properties.last())
    }
}

/// Parses the whole node tree.
pub fn parse_tree(bytes: &[u8]) -> Result<(u32, Vec<FbxNode>)> {
    if bytes.starts_with(b"; FBX") {
        return Err(CompanionError::invalid(FORMAT, "ASCII FBX is not supported"));
    }
    let mut reader = ByteReader::new(bytes, FORMAT);
    if reader.take(MAGIC.len())? != MAGIC {
        return Err(CompanionError::invalid(FORMAT, "missing binary FBX signature"));
    }
    reader.skip(2)?;
    debug_assert_eq!(reader.pos() + 4, HEADER_LEN);
    let version = reader.u32()?;
    let wide = version >= 7500;

    let mut nodes = Vec::new();
    let record_len = if wide { 25 } else { 13 };
    let len = bytes.len();
    while reader.remaining() >= record_len {
        match read_node(&mut reader, wide, len)? {
            Some(node) => nodes.push(node),
            None => break,
        }
    }
    Ok((version, nodes))
}

/// Reads one node record. `limit` is the end of the enclosing node (or of the
/// file); a record must end after its own header and within `limit`, so every
/// call moves the reader forward.
fn read_node(reader: &mut ByteReader<'_>, wide: bool, limit: usize) -> Result<Option<FbxNode>> {
    let node_start = reader.pos();
    let (end, count, list_len) = if wide {
        (reader.u64()?, reader.u64()?, reader.u64()?)
    } else {
        (
            reader.u32()? as u64,
            reader.u32()? as u64,
            reader.u32()? as u64,
        )
    };
    let name_len = reader.u8()? as usize;
    if end == 0 {
        return Ok(None);
    }
    let end = usize::try_from(end)
        .ok()
        .filter(|end| *end > node_start && *end <= limit)
        .ok_or_else(|| {
            CompanionError::invalid(
                FORMAT,
                format!("node at offset {node_start} ends at {end}, outside 0..={limit}"),
            )
        })?;
    let name = String::from_utf8_lossy(reader.take(name_len)?).into_owned();

    let list_start = reader.pos();
    let list_end = usize::try_from(list_len)
        .ok()
        .and_then(|len| list_start.checked_add(len))
        .filter(|list_end| *list_end <= end)
        .ok_or_else(|| {
            CompanionError::invalid(
                FORMAT,
                format!("property list of `{name}` ({list_len} bytes) overruns its node"),
            )
        })?;
    let mut properties = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        properties.push(read_property(reader)?);
        if reader.pos() > list_end {
            return Err(CompanionError::invalid(
                FORMAT,
                format!("properties of `{name}` overrun their list"),
            ));
        }
    }
    reader.seek(list_end)?;

    let mut children = Vec::new();
    while reader.pos() < end {
        match read_node(reader, wide, end)? {
            Some(child) => children.push(child),
            None => break,
        }
    }
    reader.seek(end)?;

    Ok(Some(FbxNode {
        name,
        properties,
        children,
    }))
}

fn read_property(reader: &mut ByteReader<'_>) -> Result<FbxProperty> {
    let code = reader.u8()?;
    Ok(match code {
        b'Y' => FbxProperty::Int(reader.u16()? as i16 as i64),
        b'C' => FbxProperty::Bool(reader.u8()? != 0),
        b'I' => FbxProperty::Int(reader.i32()? as i64),
        b'L' => FbxProperty::Int(reader.i64()?),
        b'F' => FbxProperty::Float(reader.f32()? as f64),
        b'D' => FbxProperty::Float(reader.f64()?),
        b'f' | b'd' | b'l' | b'i' | b'b' => {
            let len = reader.u32()? as usize;
            let _encoding = reader.u32()?;
            let compressed = reader.u32()? as usize;
            reader.skip(compressed)?;
            FbxProperty::Array(len)
        }
        b'S' => {
            let len = reader.u32()? as usize;
            FbxProperty::Str(String::from_utf8_lossy(reader.take(len)?).into_owned())
        }
        b'R' => {
            let len = reader.u32()? as usize;
            reader.skip(len)?;
            FbxProperty::Raw(len)
        }
        other => {
            return Err(CompanionError::invalid(
                FORMAT,
                format!("unknown property type {:?}", other as char),
            ))
        }
    })
}

#[derive(Debug, Clone)]
struct Connection {
    child: i64,
    parent: i64,
    property: Option<String>,
}

fn connections(nodes: &[FbxNode]) -> Vec<Connection> {
    let Some(section) = nodes.iter().find(|n| n.name == "Connections") else {
        return Vec::new();
    };
    section
        .children
        .iter()
        .filter(|c| c.name == "C")
        .filter_map(|c| {
            Some(Connection {
                child: c.properties.get(1)?.as_i64()?,
                parent: c.properties.get(2)?.as_i64()?,
                property: c
                    .properties
                    .get(3)
                    .and_then(FbxProperty::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

pub fn parse(bytes: &[u8]) -> Result<ModelAsset> {
    let (_, nodes) = parse_tree(bytes)?;
    let links = connections(&nodes);
    let mut asset = ModelAsset::default();

    let objects: Vec<&FbxNode> = nodes
        .iter()
        .find(|n| n.name == "Objects")
        .map(|objects| objects.children.iter().collect())
        .unwrap_or_default();
    let by_id: HashMap<i64, &FbxNode> = objects
        .iter()
        .filter_map(|node| Some((node.object_id()?, *node)))
        .collect();

    for node in &objects {
        match node.name.as_str() {
            "Model" => match node.object_subtype() {
                "Mesh" => asset.meshes.push(MeshDesc::new(node.object_name())),
                "LimbNode" | "Root" => push_unique(&mut asset.bones, &node.object_name()),
                _ => {}
            },
            "Deformer" if node.object_subtype() == "BlendShapeChannel" => {
                let name = node.object_name();
                push_unique(&mut asset.morphs, &name);
                push_unique(&mut asset.expressions, &name);
            }
            "Texture" => {
                let file = node
                    .child("RelativeFilename")
                    .or_else(|| node.child("FileName"))
                    .and_then(|f| f.properties.first())
                    .and_then(FbxProperty::as_str);
                if let Some(file) = file {
                    push_unique(&mut asset.textures, &normalize_reference(file));
                }
            }
            _ => {}
        }
    }

    // Material and blend shape ownership come from the connection graph.
    for link in &links {
        let (Some(child), Some(parent)) = (by_id.get(&link.child), by_id.get(&link.parent)) else {
            continue;
        };
        if child.name == "Material" && parent.name == "Model" {
            let mesh_name = parent.object_name();
            if let Some(mesh) = asset.meshes.iter_mut().find(|m| m.name == mesh_name) {
                mesh.material.get_or_insert_with(|| child.object_name());
            }
        }
    }

    for stack in objects.iter().filter(|n| n.name == "AnimationStack") {
        asset.clips.push(stack_clip(stack, &links, &by_id));
    }

    Ok(asset)
}

fn children_of<'a>(
    links: &'a [Connection],
    by_id: &'a HashMap<i64, &'a FbxNode>,
    parent: i64,
    kind: &'static str,
) -> impl Iterator<Item = &'a FbxNode> + 'a {
    links
        .iter()
        .filter(move |l| l.parent == parent)
        .filter_map(move |l| by_id.get(&l.child).filter(|n| n.name == kind).copied())
}

fn stack_clip<'a>(
    stack: &FbxNode,
    links: &'a [Connection],
    by_id: &'a HashMap<i64, &'a FbxNode>,
) -> AnimationClip {
    let stop = stack
        .property70("LocalStop")
        .and_then(FbxProperty::as_i64)
        .unwrap_or(0);
    let mut clip = AnimationClip::new(
        stack.object_name(),
        stop as f64 / KTIME_PER_SECOND * 1000.0,
    );
    let Some(stack_id) = stack.object_id() else {
        return clip;
    };

    for layer in children_of(links, by_id, stack_id, "AnimationLayer") {
        let Some(layer_id) = layer.object_id() else {
            continue;
        };
        for curve_node in children_of(links, by_id, layer_id, "AnimationCurveNode") {
            let property = match curve_node.object_name().as_str() {
                "T" => TrackProperty::Translation,
                "R" => TrackProperty::Rotation,
                "S" => TrackProperty::Scale,
                "DeformPercent" => TrackProperty::Morph,
                _ => continue,
            };
            let Some(curve_id) = curve_node.object_id() else {
                continue;
            };
            let target = links
                .iter()
                .filter(|l| l.child == curve_id && l.property.is_some())
                .find_map(|l| by_id.get(&l.parent))
                .map(|node| node.object_name());
            if let Some(target) = target {
                clip.tracks.push(Track::new(target, property));
            }
        }
    }
    clip
}
