//! Renderer capability contract and the registry that picks an adapter for a
//! model file.

mod adapter;

use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

use async_trait::async_trait;
use tracing::{debug, warn};

pub use adapter::{
    Adapter, FbxFormat, FbxRenderer, FormatDriver, GltfFormat, GltfRenderer, Live2dFormat,
    Live2dRenderer, MmdFormat, MmdRenderer, MouthKind, VrmFormat, VrmRenderer,
};

use crate::{
    assets::{AssetFetcher, AssetResolver, LoadContext, LoadTicket},
    config::ViewerConfig,
    events::{EventHandler, EventKind, SubscriptionId},
    formats::gltf,
    lipsync::TargetRef,
    model::{Emotion, ModelMetadata, ModelType, MotionGroup, OutfitPart, RendererCapabilities},
    scene::{Gaze, ResourcePool},
    Result,
};

/// Viewport and placement shared by everything a renderer draws. Survives
/// `unload_model`; `dispose` tears it down.
#[derive(Debug)]
pub struct RenderSurface {
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub position: (f32, f32),
    pool: ResourcePool,
}

impl RenderSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scale: 1.0,
            position: (0.0, 0.0),
            pool: ResourcePool::new(),
        }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ResourcePool {
        &mut self.pool
    }

    pub fn reset_view(&mut self) {
        self.scale = 1.0;
        self.position = (0.0, 0.0);
    }

    /// Drops the pool. Returns how many resources were still live.
    pub fn teardown(&mut self) -> usize {
        let leaked = self.pool.live_count();
        if leaked > 0 {
            warn!(leaked, "surface torn down with live resources");
        }
        self.pool = ResourcePool::new();
        leaked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Error,
    Disposed,
}

/// Result of a load that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(ModelMetadata),
    /// A newer load started first. Nothing was kept and no `error` event was
    /// emitted.
    Cancelled,
}

pub trait LookAt {
    fn look_at_point(&mut self, x: f32, y: f32) -> Gaze;
    fn set_auto_track(&mut self, enabled: bool);
    fn auto_track(&self) -> bool;
    /// Pointer movement; only moves the gaze while auto-tracking.
    fn track_pointer(&mut self, x: f32, y: f32) -> Option<Gaze>;
    fn reset_gaze(&mut self);
    fn gaze(&self) -> Gaze;
}

pub trait Physics {
    fn set_physics_enabled(&mut self, enabled: bool);
    fn physics_enabled(&self) -> bool;
}

#[async_trait(?Send)]
pub trait Outfit {
    fn outfit_parts(&self) -> Vec<OutfitPart>;
    fn set_part_visible(&mut self, part: &str, visible: bool) -> Result<()>;
    fn set_all_parts_visible(&mut self, visible: bool);
    /// Merges the meshes of another model file into the scene as one part.
    async fn load_mesh_file(&mut self, path: &Path) -> Result<OutfitPart>;
    fn unload_mesh_file(&mut self, part: &str) -> Result<()>;
}

/// Everything the viewer can ask of a model renderer.
#[async_trait(?Send)]
pub trait ModelRenderer {
    fn model_type(&self) -> ModelType;

    fn capabilities(&self) -> RendererCapabilities {
        self.model_type().capabilities()
    }

    fn state(&self) -> LoadState;
    fn metadata(&self) -> Option<&ModelMetadata>;
    fn surface(&self) -> &RenderSurface;

    /// Loads `path`, unloading any current model first. A stale `ticket`
    /// yields [`LoadOutcome::Cancelled`].
    async fn load(&mut self, path: &Path, ticket: LoadTicket) -> Result<LoadOutcome>;
    fn unload_model(&mut self);
    fn dispose(&mut self);

    fn resize(&mut self, width: u32, height: u32);
    fn set_scale(&mut self, scale: f32);
    fn set_position(&mut self, x: f32, y: f32);
    fn reset_view(&mut self);
    /// Advances motions by `delta_ms`.
    fn update(&mut self, delta_ms: f64);

    /// Mouth of the loaded model. The renderer keeps the only strong handle.
    fn lip_sync_target(&self) -> Option<TargetRef>;

    fn set_expression(&mut self, name: &str, weight: f32) -> Result<()>;
    fn available_expressions(&self) -> Vec<String>;
    fn reset_expression(&mut self);
    /// Shows the expression that best matches `emotion`. Returns its name.
    fn set_from_emotion(&mut self, emotion: Emotion) -> Option<String>;

    fn play_motion(&mut self, group: &str, index: Option<usize>) -> Result<()>;
    fn stop_motion(&mut self);
    fn available_motions(&self) -> Vec<MotionGroup>;
    fn play_idle_motion(&mut self) -> Result<()>;
    /// Adds the clips of an external animation file. Returns the first clip
    /// name.
    async fn load_animation(&mut self, path: &Path) -> Result<String>;
    fn unload_animation(&mut self, name: &str) -> Result<()>;

    fn look_at(&mut self) -> Option<&mut dyn LookAt> {
        None
    }

    fn physics(&mut self) -> Option<&mut dyn Physics> {
        None
    }

    fn outfit(&mut self) -> Option<&mut dyn Outfit> {
        None
    }

    fn on(&mut self, kind: EventKind, handler: EventHandler) -> SubscriptionId;
    fn off(&mut self, id: SubscriptionId) -> bool;
}

/// What the registry knows about a file before choosing an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProbe {
    path: PathBuf,
    file_name: String,
    vrm_markers: bool,
}

impl ModelProbe {
    /// Probe from the path alone.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Self {
            path,
            file_name,
            vrm_markers: false,
        }
    }

    /// Probe with a content sniff of `bytes`.
    pub fn with_bytes(path: impl Into<PathBuf>, bytes: &[u8]) -> Self {
        let mut probe = Self::from_path(path);
        probe.vrm_markers = gltf::has_vrm_markers(bytes);
        probe
    }

    /// Reads the file through `fetcher` when the extension alone cannot decide
    /// the format (`.glb` and `.gltf` may hold a VRM). The read is bounded by
    /// `timeout_ms` and abandoned once `ticket` is superseded.
    pub async fn inspect(
        path: &Path,
        fetcher: Rc<dyn AssetFetcher>,
        ticket: LoadTicket,
        timeout_ms: u64,
    ) -> Result<Self> {
        let probe = Self::from_path(path);
        if !probe.has_extension("glb") && !probe.has_extension("gltf") {
            return Ok(probe);
        }
        let resolver = AssetResolver::for_path(path)?;
        let context = LoadContext::new(fetcher, resolver, ticket, timeout_ms);
        let bytes = context.fetch_model().await?;
        Ok(Self::with_bytes(path, &bytes))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercased file name.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn has_extension(&self, extension: &str) -> bool {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext == extension)
            .unwrap_or(false)
    }

    pub fn has_vrm_markers(&self) -> bool {
        self.vrm_markers
    }
}

/// What a factory needs to build a renderer.
#[derive(Clone)]
pub struct RendererContext {
    pub fetcher: Rc<dyn AssetFetcher>,
    pub config: ViewerConfig,
}

pub type ProbePredicate = Box<dyn Fn(&ModelProbe) -> bool>;
pub type RendererFactory = Box<dyn Fn(&RendererContext) -> Box<dyn ModelRenderer>>;

struct RegistryEntry {
    name: String,
    predicate: ProbePredicate,
    factory: RendererFactory,
}

/// Ordered `(predicate, factory)` list; the first matching entry wins.
#[derive(Default)]
pub struct RendererRegistry {
    entries: Vec<RegistryEntry>,
}

impl std::fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.name))
            .finish()
    }
}

fn boxed<F: FormatDriver + 'static>(context: &RendererContext) -> Box<dyn ModelRenderer> {
    Box::new(Adapter::<F>::new(context.fetcher.clone(), context.config.clone()))
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live2D, VRM, glTF, FBX, MMD, in that order.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "live2d",
            Box::new(|probe| probe.file_name().ends_with(".model3.json")),
            Box::new(boxed::<Live2dFormat>),
        );
        registry.register(
            "vrm",
            Box::new(|probe| {
                probe.has_extension("vrm")
                    || ((probe.has_extension("glb") || probe.has_extension("gltf"))
                        && probe.has_vrm_markers())
            }),
            Box::new(boxed::<VrmFormat>),
        );
        registry.register(
            "gltf",
            Box::new(|probe| probe.has_extension("glb") || probe.has_extension("gltf")),
            Box::new(boxed::<GltfFormat>),
        );
        registry.register(
            "fbx",
            Box::new(|probe| probe.has_extension("fbx")),
            Box::new(boxed::<FbxFormat>),
        );
        registry.register(
            "mmd",
            Box::new(|probe| probe.has_extension("pmx")),
            Box::new(boxed::<MmdFormat>),
        );
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        predicate: ProbePredicate,
        factory: RendererFactory,
    ) {
        self.entries.push(RegistryEntry {
            name: name.into(),
            predicate,
            factory,
        });
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    /// Name of the entry that would handle `probe`.
    pub fn select(&self, probe: &ModelProbe) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| (entry.predicate)(probe))
            .map(|entry| entry.name.as_str())
    }

    /// Builds the renderer for `probe`, or `None` when nothing matches.
    pub fn create(
        &self,
        probe: &ModelProbe,
        context: &RendererContext,
    ) -> Option<Box<dyn ModelRenderer>> {
        let entry = self.entries.iter().find(|entry| (entry.predicate)(probe));
        match entry {
            Some(entry) => {
                debug!(renderer = %entry.name, path = %probe.path().display(), "selected renderer");
                Some((entry.factory)(context))
            }
            None => {
                debug!(path = %probe.path().display(), "no renderer accepts file");
                None
            }
        }
    }
}
