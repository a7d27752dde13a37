//! VMD (Vocaloid Motion Data) reader.
//!
//! Bone and morph names are fixed-width Shift-JIS fields; keyframes run at
//! 30 frames per second.

use std::collections::BTreeSet;

use encoding_rs::SHIFT_JIS;

use super::reader::ByteReader;
use crate::{
    timeline::{AnimationClip, Track, TrackProperty},
    CompanionError, Result,
};

const FORMAT: &str = "vmd";
const SIGNATURE: &[u8] = b"Vocaloid Motion Data 0002";
const FRAMES_PER_SECOND: f64 = 30.0;

const BONE_NAME_LEN: usize = 15;
const MORPH_NAME_LEN: usize = 15;
/// Position, rotation quaternion and interpolation table.
const BONE_PAYLOAD_LEN: usize = 12 + 16 + 64;

/// Decodes a NUL-padded Shift-JIS field.
fn sjis(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let (text, _, _) = SHIFT_JIS.decode(&field[..end]);
    text.into_owned()
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmdMotion {
    pub model_name: String,
    pub clip: AnimationClip,
}

pub fn parse(name: &str, bytes: &[u8]) -> Result<VmdMotion> {
    let mut reader = ByteReader::new(bytes, FORMAT);
    let header = reader.take(30)?;
    if !header.starts_with(SIGNATURE) {
        return Err(CompanionError::invalid(FORMAT, "missing VMD signature"));
    }
    let model_name = sjis(reader.take(20)?);

    let mut last_frame = 0u32;
    let mut bones = BTreeSet::new();
    let bone_frames = reader.u32()?;
    for _ in 0..bone_frames {
        let bone = sjis(reader.take(BONE_NAME_LEN)?);
        last_frame = last_frame.max(reader.u32()?);
        reader.skip(BONE_PAYLOAD_LEN)?;
        bones.insert(bone);
    }

    let mut morphs = BTreeSet::new();
    // Camera-only files end after the bone section.
    if reader.remaining() >= 4 {
        let morph_frames = reader.u32()?;
        for _ in 0..morph_frames {
            let morph = sjis(reader.take(MORPH_NAME_LEN)?);
            last_frame = last_frame.max(reader.u32()?);
            reader.skip(4)?;
            morphs.insert(morph);
        }
    }

    let mut clip = AnimationClip::new(name, last_frame as f64 / FRAMES_PER_SECOND * 1000.0);
    for bone in bones {
        clip.tracks.push(Track::new(bone.clone(), TrackProperty::Rotation));
        clip.tracks.push(Track::new(bone, TrackProperty::Translation));
    }
    for morph in morphs {
        clip.tracks.push(Track::new(morph, TrackProperty::Morph));
    }

    Ok(VmdMotion { model_name, clip })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn field(out: &mut Vec<u8>, text: &str, len: usize) {
        let (bytes, _, _) = SHIFT_JIS.encode(text);
        let mut padded = bytes.into_owned();
        padded.resize(len, 0);
        out.extend_from_slice(&padded);
    }

    pub(crate) fn sample_vmd() -> Vec<u8> {
        let mut out = Vec::new();
        field(&mut out, "Vocaloid Motion Data 0002", 30);
        field(&mut out, "初音ミク", 20);

        out.extend_from_slice(&2u32.to_le_bytes());
        for (bone, frame) in [("センター", 0u32), ("頭", 60)] {
            field(&mut out, bone, BONE_NAME_LEN);
            out.extend_from_slice(&frame.to_le_bytes());
            out.extend_from_slice(&[0u8; BONE_PAYLOAD_LEN]);
        }

        out.extend_from_slice(&1u32.to_le_bytes());
        field(&mut out, "あ", MORPH_NAME_LEN);
        out.extend_from_slice(&90u32.to_le_bytes());
        out.extend_from_slice(&1.0f32.to_le_bytes());
        out
    }

    #[test]
    fn reads_keyframe_names() {
        let motion = parse("dance", &sample_vmd()).unwrap();

        assert_eq!(motion.model_name, "初音ミク");
        assert_eq!(motion.clip.name, "dance");
        assert!((motion.clip.duration_ms - 3000.0).abs() < 1e-9);
        assert!(motion
            .clip
            .tracks
            .contains(&Track::new("頭", TrackProperty::Rotation)));
        assert!(motion
            .clip
            .tracks
            .contains(&Track::new("あ", TrackProperty::Morph)));
        assert_eq!(motion.clip.tracks.len(), 5);
    }

    #[test]
    fn rejects_old_signature() {
        let mut bytes = Vec::new();
        field(&mut bytes, "Vocaloid Motion Data file", 30);
        bytes.resize(60, 0);
        assert!(parse("x", &bytes).is_err());
    }
}
