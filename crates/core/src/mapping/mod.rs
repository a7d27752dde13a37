//! Name tables that route abstract inputs (phonemes, emotions, humanoid bones)
//! onto whatever a concrete model happens to call them.
//!
//! Everything here is data plus best-effort string matching, so the tables can
//! be replaced or extended without touching the scheduler or the adapters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    formats::ModelAsset,
    model::{Emotion, ModelType},
    phoneme::Phoneme,
    timeline::{AnimationClip, TrackProperty},
};

/// Per-phoneme candidate name fragments, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouthCandidates {
    entries: Vec<(Phoneme, Vec<String>)>,
}

fn table(entries: &[(Phoneme, &[&str])]) -> Vec<(Phoneme, Vec<String>)> {
    entries
        .iter()
        .map(|(phoneme, names)| (*phoneme, names.iter().map(|n| n.to_string()).collect()))
        .collect()
}

impl MouthCandidates {
    pub fn new(entries: Vec<(Phoneme, Vec<String>)>) -> Self {
        Self { entries }
    }

    /// Blend shape names seen on VRM, VRChat and VRoid exports. Also used for
    /// plain glTF and FBX morph targets.
    pub fn blend_shapes() -> Self {
        Self::new(table(&[
            (Phoneme::A, &["aa", "a", "mouth_a", "vrc.v_aa", "fcl_mth_a"]),
            (Phoneme::I, &["ih", "i", "mouth_i", "vrc.v_ih", "fcl_mth_i"]),
            (Phoneme::U, &["ou", "u", "mouth_u", "vrc.v_ou", "fcl_mth_u"]),
            (Phoneme::E, &["ee", "e", "mouth_e", "vrc.v_e", "fcl_mth_e"]),
            (Phoneme::O, &["oh", "o", "mouth_o", "vrc.v_oh", "fcl_mth_o"]),
            (Phoneme::N, &["nn", "n", "vrc.v_nn"]),
        ]))
    }

    /// Japanese morph names with their usual English counterparts.
    pub fn mmd_morphs() -> Self {
        Self::new(table(&[
            (Phoneme::A, &["あ", "a"]),
            (Phoneme::I, &["い", "i"]),
            (Phoneme::U, &["う", "u"]),
            (Phoneme::E, &["え", "e"]),
            (Phoneme::O, &["お", "o"]),
            (Phoneme::N, &["ん", "n"]),
        ]))
    }

    pub fn candidates(&self, phoneme: Phoneme) -> &[String] {
        self.entries
            .iter()
            .find(|(p, _)| *p == phoneme)
            .map(|(_, names)| names.as_slice())
            .unwrap_or(&[])
    }

    /// Resolves every phoneme against `available`: a case-insensitive exact
    /// pass over all candidates first, then a substring pass over the
    /// multi-character ones.
    pub fn resolve(&self, available: &[String]) -> HashMap<Phoneme, String> {
        let lowered: Vec<String> = available.iter().map(|n| n.to_lowercase()).collect();
        let mut resolved = HashMap::new();
        for (phoneme, candidates) in &self.entries {
            let candidates: Vec<String> = candidates.iter().map(|c| c.to_lowercase()).collect();
            let exact = candidates
                .iter()
                .find_map(|c| lowered.iter().position(|name| name == c));
            // Single letters only ever match exactly; "o" would otherwise
            // claim "joy" or "sorrow".
            let found = exact.or_else(|| {
                candidates
                    .iter()
                    .filter(|c| c.chars().count() > 1)
                    .find_map(|c| lowered.iter().position(|name| name.contains(c.as_str())))
            });
            if let Some(index) = found {
                resolved.insert(*phoneme, available[index].clone());
            }
        }
        resolved
    }

    /// Like [`resolve`](Self::resolve) but without the substring pass: exact
    /// names first, then case-insensitive equality. Used for morph
    /// dictionaries, where short English fragments would match unrelated
    /// morphs.
    pub fn resolve_exact(&self, available: &[String]) -> HashMap<Phoneme, String> {
        let mut resolved = HashMap::new();
        for (phoneme, candidates) in &self.entries {
            let found = candidates
                .iter()
                .find_map(|c| available.iter().find(|name| *name == c))
                .or_else(|| {
                    candidates.iter().find_map(|c| {
                        let c = c.to_lowercase();
                        available.iter().find(|name| name.to_lowercase() == c)
                    })
                });
            if let Some(name) = found {
                resolved.insert(*phoneme, name.clone());
            }
        }
        resolved
    }
}

const GENERIC_EMOTIONS: &[(Emotion, &[&str])] = &[
    (Emotion::Neutral, &["neutral", "normal", "default"]),
    (Emotion::Happy, &["happy", "smile", "joy", "fun"]),
    (Emotion::Sad, &["sad", "sorrow", "cry"]),
    (Emotion::Angry, &["angry", "anger", "mad"]),
    (Emotion::Surprised, &["surprised", "surprise", "shock"]),
    (Emotion::Thinking, &["thinking", "think", "serious"]),
];

const VRM_EMOTIONS: &[(Emotion, &[&str])] = &[
    (Emotion::Neutral, &["neutral"]),
    (Emotion::Happy, &["happy", "joy", "fun"]),
    (Emotion::Sad, &["sad", "sorrow"]),
    (Emotion::Angry, &["angry"]),
    (Emotion::Surprised, &["surprised"]),
    (Emotion::Thinking, &["relaxed"]),
];

const LIVE2D_EMOTIONS: &[(Emotion, &[&str])] = &[
    (Emotion::Neutral, &["normal", "default"]),
    (Emotion::Happy, &["smile", "happy"]),
    (Emotion::Sad, &["sad", "cry"]),
    (Emotion::Angry, &["angry", "anger"]),
    (Emotion::Surprised, &["surprise", "shock"]),
    (Emotion::Thinking, &["think", "trouble"]),
];

const MMD_EMOTIONS: &[(Emotion, &[&str])] = &[
    (Emotion::Neutral, &["真面目"]),
    (Emotion::Happy, &["笑い", "にこり", "smile"]),
    (Emotion::Sad, &["困る", "悲しい"]),
    (Emotion::Angry, &["怒り"]),
    (Emotion::Surprised, &["びっくり", "驚き"]),
    (Emotion::Thinking, &["考え", "困る"]),
];

const MORPH_EMOTIONS: &[(Emotion, &[&str])] = &[
    (Emotion::Happy, &["smile", "mouthsmile"]),
    (Emotion::Sad, &["frown", "mouthfrown"]),
    (Emotion::Angry, &["browdown"]),
    (Emotion::Surprised, &["browinnerup", "eyewide"]),
];

fn lookup(table: &'static [(Emotion, &'static [&'static str])], emotion: Emotion) -> &'static [&'static str] {
    table
        .iter()
        .find(|(e, _)| *e == emotion)
        .map(|(_, names)| *names)
        .unwrap_or(&[])
}

/// Emotion candidates specific to one format.
pub fn emotion_candidates(model_type: ModelType, emotion: Emotion) -> &'static [&'static str] {
    let table = match model_type {
        ModelType::Vrm => VRM_EMOTIONS,
        ModelType::Live2d => LIVE2D_EMOTIONS,
        ModelType::Mmd => MMD_EMOTIONS,
        ModelType::Gltf | ModelType::Fbx => MORPH_EMOTIONS,
    };
    lookup(table, emotion)
}

pub fn generic_emotion_candidates(emotion: Emotion) -> &'static [&'static str] {
    lookup(GENERIC_EMOTIONS, emotion)
}

fn find_fragment(fragments: &[&str], available: &[String]) -> Option<String> {
    fragments.iter().find_map(|fragment| {
        let fragment = fragment.to_lowercase();
        available
            .iter()
            .find(|name| name.to_lowercase().contains(&fragment))
            .cloned()
    })
}

/// Picks the expression that best expresses `emotion`: the format table
/// first, then the generic one.
pub fn resolve_emotion(model_type: ModelType, emotion: Emotion, available: &[String]) -> Option<String> {
    find_fragment(emotion_candidates(model_type, emotion), available)
        .or_else(|| find_fragment(generic_emotion_candidates(emotion), available))
}

const IDLE_MARKERS: &[&str] = &["idle", "stand", "wait", "待機"];

pub fn is_idle_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    IDLE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Group name for a loose clip: `Idle` for idle-looking clips, the prefix
/// before `|` or `_` when there is one, `Default` otherwise.
pub fn clip_group(name: &str) -> String {
    if is_idle_name(name) {
        return "Idle".to_string();
    }
    match name.split(['|', '_']).next() {
        Some(prefix) if !prefix.is_empty() && prefix.len() < name.len() => prefix.to_string(),
        _ => "Default".to_string(),
    }
}

/// Source bone name to humanoid bone name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoneMap {
    bones: HashMap<String, String>,
}

const MIXAMO_TO_VRM: &[(&str, &str)] = &[
    ("Hips", "hips"),
    ("Spine", "spine"),
    ("Spine1", "chest"),
    ("Spine2", "upperChest"),
    ("Neck", "neck"),
    ("Head", "head"),
    ("LeftShoulder", "leftShoulder"),
    ("LeftArm", "leftUpperArm"),
    ("LeftForeArm", "leftLowerArm"),
    ("LeftHand", "leftHand"),
    ("RightShoulder", "rightShoulder"),
    ("RightArm", "rightUpperArm"),
    ("RightForeArm", "rightLowerArm"),
    ("RightHand", "rightHand"),
    ("LeftUpLeg", "leftUpperLeg"),
    ("LeftLeg", "leftLowerLeg"),
    ("LeftFoot", "leftFoot"),
    ("LeftToeBase", "leftToes"),
    ("RightUpLeg", "rightUpperLeg"),
    ("RightLeg", "rightLowerLeg"),
    ("RightFoot", "rightFoot"),
    ("RightToeBase", "rightToes"),
];

impl BoneMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mixamo_to_vrm() -> Self {
        let mut map = Self::new();
        for (source, humanoid) in MIXAMO_TO_VRM {
            map.insert(*source, *humanoid);
        }
        map
    }

    pub fn insert(&mut self, source: impl Into<String>, humanoid: impl Into<String>) {
        self.bones.insert(source.into(), humanoid.into());
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    /// Humanoid name for a source bone; namespace prefixes such as
    /// `mixamorig:` are ignored.
    pub fn humanoid(&self, source: &str) -> Option<&str> {
        let bare = source.rsplit(':').next().unwrap_or(source);
        self.bones
            .get(source)
            .or_else(|| self.bones.get(bare))
            .map(String::as_str)
    }

    /// Renames the bone tracks of an external clip onto `model`'s bones.
    /// Morph and parameter tracks pass through untouched.
    pub fn retarget(&self, clip: &AnimationClip, model: &ModelAsset) -> AnimationClip {
        let mut out = AnimationClip {
            tracks: Vec::with_capacity(clip.tracks.len()),
            ..clip.clone()
        };
        let has_bone = |name: &str| model.bones.iter().any(|bone| bone == name);

        for track in &clip.tracks {
            if matches!(track.property, TrackProperty::Morph | TrackProperty::Parameter) {
                out.tracks.push(track.clone());
                continue;
            }
            let renamed = self
                .humanoid(&track.target)
                .and_then(|humanoid| {
                    model
                        .humanoid
                        .get(humanoid)
                        .cloned()
                        .or_else(|| has_bone(humanoid).then(|| humanoid.to_string()))
                })
                .or_else(|| has_bone(&track.target).then(|| track.target.clone()));
            match renamed {
                Some(target) => {
                    let mut track = track.clone();
                    track.target = target;
                    out.tracks.push(track);
                }
                None => debug!(
                    clip = %clip.name,
                    bone = %track.target,
                    "dropping track without a matching bone"
                ),
            }
        }
        out
    }
}
