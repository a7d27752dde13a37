//! PMX 2.0 / 2.1 reader.
//!
//! Only names are kept: materials become meshes, morphs form the index
//! dictionary used by the morph mouth, and the presence of rigid bodies marks
//! the model as physics-enabled. Geometry is walked over, not decoded.

use super::{normalize_reference, push_unique, reader::ByteReader, MeshDesc, ModelAsset};
use crate::{CompanionError, Result};

const FORMAT: &str = "pmx";

const BONE_TAIL_IS_BONE: u16 = 0x0001;
const BONE_IK: u16 = 0x0020;
const BONE_INHERIT_ROTATION: u16 = 0x0100;
const BONE_INHERIT_TRANSLATION: u16 = 0x0200;
const BONE_FIXED_AXIS: u16 = 0x0400;
const BONE_LOCAL_AXES: u16 = 0x0800;
const BONE_EXTERNAL_PARENT: u16 = 0x2000;

#[derive(Debug, Clone, Copy)]
struct Globals {
    utf16: bool,
    additional_uv: usize,
    vertex: usize,
    texture: usize,
    material: usize,
    bone: usize,
    morph: usize,
    rigid: usize,
}

struct PmxReader<'a> {
    inner: ByteReader<'a>,
    globals: Globals,
}

impl<'a> PmxReader<'a> {
    fn text(&mut self) -> Result<String> {
        let len = self.inner.count()?;
        let bytes = self.inner.take(len)?;
        if self.globals.utf16 {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Ok(String::from_utf16_lossy(&units))
        } else {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    fn skip_text(&mut self) -> Result<()> {
        let len = self.inner.count()?;
        self.inner.skip(len)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.inner.skip(len)
    }
}

fn index_size(value: u8, what: &str) -> Result<usize> {
    match value {
        1 | 2 | 4 => Ok(value as usize),
        other => Err(CompanionError::invalid(
            FORMAT,
            format!("invalid {what} index size {other}"),
        )),
    }
}

pub fn parse(bytes: &[u8]) -> Result<ModelAsset> {
    let mut inner = ByteReader::new(bytes, FORMAT);
    if inner.take(4)? != b"PMX " {
        return Err(CompanionError::invalid(FORMAT, "missing PMX signature"));
    }
    let version = inner.f32()?;
    if !(2.0..=2.1).contains(&version) {
        return Err(CompanionError::invalid(
            FORMAT,
            format!("unsupported version {version}"),
        ));
    }
    let count = inner.u8()? as usize;
    if count < 8 {
        return Err(CompanionError::invalid(FORMAT, "header globals are incomplete"));
    }
    let raw = inner.take(count)?;
    let globals = Globals {
        utf16: raw[0] == 0,
        additional_uv: raw[1].min(4) as usize,
        vertex: index_size(raw[2], "vertex")?,
        texture: index_size(raw[3], "texture")?,
        material: index_size(raw[4], "material")?,
        bone: index_size(raw[5], "bone")?,
        morph: index_size(raw[6], "morph")?,
        rigid: index_size(raw[7], "rigid body")?,
    };
    let mut r = PmxReader { inner, globals };

    let local_name = r.text()?;
    let universal_name = r.text()?;
    r.skip_text()?;
    r.skip_text()?;

    let mut asset = ModelAsset {
        name: if local_name.is_empty() {
            universal_name
        } else {
            local_name
        },
        ..Default::default()
    };

    skip_vertices(&mut r)?;

    let face_indices = r.inner.count()?;
    r.skip(face_indices * globals.vertex)?;

    let textures = r.inner.count()?;
    for _ in 0..textures {
        let path = r.text()?;
        asset.textures.push(normalize_reference(&path));
    }

    let materials = r.inner.count()?;
    for _ in 0..materials {
        let name = r.text()?;
        r.skip_text()?;
        r.skip(16 + 12 + 4 + 12 + 1 + 16 + 4)?;
        r.skip(globals.texture * 2 + 1)?;
        let shared_toon = r.inner.u8()?;
        r.skip(if shared_toon == 0 { globals.texture } else { 1 })?;
        r.skip_text()?;
        r.skip(4)?;
        let mut mesh = MeshDesc::new(name.clone());
        mesh.material = Some(name);
        asset.meshes.push(mesh);
    }

    let bones = r.inner.count()?;
    for _ in 0..bones {
        let name = r.text()?;
        r.skip_text()?;
        r.skip(12 + globals.bone + 4)?;
        let flags = r.inner.u16()?;
        r.skip(if flags & BONE_TAIL_IS_BONE != 0 {
            globals.bone
        } else {
            12
        })?;
        if flags & (BONE_INHERIT_ROTATION | BONE_INHERIT_TRANSLATION) != 0 {
            r.skip(globals.bone + 4)?;
        }
        if flags & BONE_FIXED_AXIS != 0 {
            r.skip(12)?;
        }
        if flags & BONE_LOCAL_AXES != 0 {
            r.skip(24)?;
        }
        if flags & BONE_EXTERNAL_PARENT != 0 {
            r.skip(4)?;
        }
        if flags & BONE_IK != 0 {
            r.skip(globals.bone + 4 + 4)?;
            let links = r.inner.count()?;
            for _ in 0..links {
                r.skip(globals.bone)?;
                if r.inner.u8()? == 1 {
                    r.skip(24)?;
                }
            }
        }
        push_unique(&mut asset.bones, &name);
    }

    let morphs = r.inner.count()?;
    for _ in 0..morphs {
        let name = r.text()?;
        r.skip_text()?;
        r.skip(1)?;
        let kind = r.inner.u8()?;
        let offsets = r.inner.count()?;
        let stride = match kind {
            0 | 9 => globals.morph + 4,
            1 => globals.vertex + 12,
            2 => globals.bone + 12 + 16,
            3..=7 => globals.vertex + 16,
            8 => globals.material + 113,
            10 => globals.rigid + 1 + 24,
            other => {
                return Err(CompanionError::invalid(
                    FORMAT,
                    format!("unknown morph type {other}"),
                ))
            }
        };
        r.skip(offsets * stride)?;
        // Index dictionary: duplicates keep their slot.
        asset.morphs.push(name.clone());
        push_unique(&mut asset.expressions, &name);
    }

    let frames = r.inner.count()?;
    for _ in 0..frames {
        r.skip_text()?;
        r.skip_text()?;
        r.skip(1)?;
        let elements = r.inner.count()?;
        for _ in 0..elements {
            let target = r.inner.u8()?;
            r.skip(if target == 0 { globals.bone } else { globals.morph })?;
        }
    }

    let rigid_bodies = r.inner.count()?;
    asset.has_physics = rigid_bodies > 0;

    Ok(asset)
}

fn skip_vertices(r: &mut PmxReader<'_>) -> Result<()> {
    let globals = r.globals;
    let vertices = r.inner.count()?;
    for _ in 0..vertices {
        r.skip(12 + 12 + 8 + 16 * globals.additional_uv)?;
        let weights = match r.inner.u8()? {
            0 => globals.bone,
            1 => globals.bone * 2 + 4,
            2 | 4 => globals.bone * 4 + 16,
            3 => globals.bone * 2 + 4 + 36,
            other => {
                return Err(CompanionError::invalid(
                    FORMAT,
                    format!("unknown weight deform {other}"),
                ))
            }
        };
        r.skip(weights + 4)?;
    }
    Ok(())
}
