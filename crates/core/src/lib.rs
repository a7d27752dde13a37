//! Core library for the desktop companion's avatar viewer.
//!
//! The crate turns streamed assistant replies into mouth movement and drives
//! whichever avatar format is loaded. Each module owns one subsystem: phoneme
//! extraction and frame scheduling, mouth adapters, format decoding, scene
//! resources, and the renderers that sit on top of them. `viewer` wires the
//! pieces together for a host application.

pub mod assets;
pub mod config;
pub mod error;
pub mod events;
pub mod formats;
pub mod lipsync;
pub mod mapping;
pub mod model;
pub mod mouth;
pub mod phoneme;
pub mod render;
pub mod scene;
pub mod timeline;
pub mod viewer;

pub use assets::{AssetFetcher, AssetResolver, FileFetcher, LoadSequencer, LoadTicket, MemoryFetcher};
pub use config::{AppConfig, LipSyncConfig, LipSyncConfigPatch, TargetHandoff, ViewerConfig};
pub use error::{CompanionError, Result};
pub use events::{EventKind, RendererEvent, SubscriptionId};
pub use lipsync::{LipFrame, LipSyncController, LipSyncTarget, TargetRef, TickStatus};
pub use mapping::{BoneMap, MouthCandidates};
pub use model::{Emotion, ModelMetadata, ModelType, MotionGroup, OutfitPart, RendererCapabilities};
pub use phoneme::{HeuristicPhonemes, Phoneme, PhonemeSource, PinyinPhonemes};
pub use render::{
    LoadOutcome, LoadState, LookAt, ModelProbe, ModelRenderer, Outfit, Physics, RendererRegistry,
};
pub use timeline::{Clock, ManualClock, SystemClock};
pub use viewer::{ModelViewer, OpenOutcome, StreamEvent};
