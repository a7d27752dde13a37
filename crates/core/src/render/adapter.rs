//! One renderer implementation shared by every format. A [`FormatDriver`]
//! supplies the decode step and a few static traits; everything else
//! (lifecycle, expressions, motions, outfit, gaze) is format-neutral.

use std::{cell::RefCell, fmt, path::Path, rc::Rc};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{LoadOutcome, LoadState, LookAt, ModelRenderer, Outfit, Physics, RenderSurface};
use crate::{
    assets::{AssetFetcher, AssetResolver, LoadContext, LoadTicket},
    config::ViewerConfig,
    events::{EventHandler, EventHub, EventKind, RendererEvent, SubscriptionId},
    formats::{fbx, gltf, live2d, pmx, vmd, ModelAsset},
    lipsync::{SharedTarget, TargetRef},
    mapping::{clip_group, is_idle_name, resolve_emotion, BoneMap, MouthCandidates},
    model::{infer_parts, Emotion, ModelMetadata, ModelType, MotionGroup, OutfitPart},
    mouth::{
        ExpressionMouth, ExpressionSet, MorphInfluences, MorphMouth, ParameterMouth,
        ParameterSet, SharedExpressions, SharedInfluences, SharedParameters,
    },
    scene::{Gaze, GazeController, NodeKind, ResourceKind, Scene, SceneNode},
    timeline::{AnimationClip, AnimationMixer},
    CompanionError, Result,
};

/// How a format exposes its mouth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouthKind {
    /// Live2D parameters.
    Parameters,
    /// Named blend shapes or expressions.
    Expressions,
    /// Index-addressed morph influences.
    Morphs,
}

/// The format-specific half of a renderer.
#[async_trait(?Send)]
pub trait FormatDriver: Default + 'static {
    const MODEL_TYPE: ModelType;
    const MOUTH: MouthKind;
    /// Whether meshes can be grouped into parts and extra mesh files merged.
    const OUTFIT: bool = true;
    /// Whether external animation files can be added at runtime.
    const EXTERNAL_ANIMATIONS: bool = true;

    async fn decode(&self, context: &LoadContext) -> Result<ModelAsset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Live2dFormat;

#[async_trait(?Send)]
impl FormatDriver for Live2dFormat {
    const MODEL_TYPE: ModelType = ModelType::Live2d;
    const MOUTH: MouthKind = MouthKind::Parameters;
    const OUTFIT: bool = false;
    // Motions are baked into the model settings.
    const EXTERNAL_ANIMATIONS: bool = false;

    async fn decode(&self, context: &LoadContext) -> Result<ModelAsset> {
        let settings = live2d::parse_model3(&context.fetch_model().await?)?;
        context.fetch(&settings.moc).await?;

        let mut asset = settings.asset;
        for motion in &settings.motion_files {
            let clip = match context.fetch(&motion.file).await {
                Ok(bytes) => live2d::parse_motion3(&motion.name, &bytes).unwrap_or_else(|err| {
                    warn!(file = %motion.file, %err, "unreadable motion file");
                    AnimationClip::new(motion.name.as_str(), 0.0)
                }),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    warn!(file = %motion.file, %err, "motion file unavailable");
                    AnimationClip::new(motion.name.as_str(), 0.0)
                }
            };
            asset.clips.push(clip);
        }
        Ok(asset)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VrmFormat;

#[async_trait(?Send)]
impl FormatDriver for VrmFormat {
    const MODEL_TYPE: ModelType = ModelType::Vrm;
    const MOUTH: MouthKind = MouthKind::Expressions;

    async fn decode(&self, context: &LoadContext) -> Result<ModelAsset> {
        let document = gltf::parse(&context.fetch_model().await?)?;
        if document.vrm.is_none() {
            return Err(CompanionError::invalid("vrm", "document has no VRM extension"));
        }
        Ok(document.asset)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GltfFormat;

#[async_trait(?Send)]
impl FormatDriver for GltfFormat {
    const MODEL_TYPE: ModelType = ModelType::Gltf;
    const MOUTH: MouthKind = MouthKind::Expressions;

    async fn decode(&self, context: &LoadContext) -> Result<ModelAsset> {
        Ok(gltf::parse(&context.fetch_model().await?)?.asset)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FbxFormat;

#[async_trait(?Send)]
impl FormatDriver for FbxFormat {
    const MODEL_TYPE: ModelType = ModelType::Fbx;
    const MOUTH: MouthKind = MouthKind::Expressions;

    async fn decode(&self, context: &LoadContext) -> Result<ModelAsset> {
        fbx::parse(&context.fetch_model().await?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MmdFormat;

#[async_trait(?Send)]
impl FormatDriver for MmdFormat {
    const MODEL_TYPE: ModelType = ModelType::Mmd;
    const MOUTH: MouthKind = MouthKind::Morphs;

    async fn decode(&self, context: &LoadContext) -> Result<ModelAsset> {
        pmx::parse(&context.fetch_model().await?)
    }
}

pub type Live2dRenderer = Adapter<Live2dFormat>;
pub type VrmRenderer = Adapter<VrmFormat>;
pub type GltfRenderer = Adapter<GltfFormat>;
pub type FbxRenderer = Adapter<FbxFormat>;
pub type MmdRenderer = Adapter<MmdFormat>;

/// Display name for a model file; `hiyori.model3.json` is `hiyori`.
fn model_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(stem) = file.strip_suffix(".model3.json") {
        return stem.to_string();
    }
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or(file)
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn decode_animation(path: &Path, bytes: &[u8]) -> Result<Vec<AnimationClip>> {
    match extension(path).as_str() {
        "vmd" => Ok(vec![vmd::parse(&model_name(path), bytes)?.clip]),
        "fbx" => Ok(fbx::parse(bytes)?.clips),
        "glb" | "gltf" | "vrma" => Ok(gltf::parse(bytes)?.asset.clips),
        _ => Err(CompanionError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn decode_mesh_file(path: &Path, bytes: &[u8]) -> Result<ModelAsset> {
    match extension(path).as_str() {
        "glb" | "gltf" | "vrm" => Ok(gltf::parse(bytes)?.asset),
        "fbx" => fbx::parse(bytes),
        "pmx" => pmx::parse(bytes),
        _ => Err(CompanionError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Motion groups declared by the file, or derived from clip names.
fn motion_groups(asset: &ModelAsset) -> Vec<MotionGroup> {
    if !asset.motion_groups.is_empty() {
        return asset.motion_groups.clone();
    }
    let mut groups: Vec<MotionGroup> = Vec::new();
    for clip in &asset.clips {
        let group = clip_group(&clip.name);
        match groups.iter_mut().find(|g| g.name == group) {
            Some(existing) => existing.motions.push(clip.name.clone()),
            None => {
                let mut created = MotionGroup::new(group);
                created.motions.push(clip.name.clone());
                groups.push(created);
            }
        }
    }
    groups
}

fn animation_source(name: &str) -> String {
    format!("anim:{name}")
}

struct LoadedModel {
    asset: ModelAsset,
    metadata: ModelMetadata,
    scene: Scene,
    expressions: SharedExpressions,
    parameters: SharedParameters,
    influences: SharedInfluences,
    mouth: SharedTarget,
    mixer: AnimationMixer,
    gaze: GazeController,
    physics_enabled: bool,
    /// Parts merged from extra mesh files; each is also its scene source.
    mesh_files: Vec<String>,
    /// Clips added through `load_animation`.
    external_clips: Vec<String>,
}

/// Renderer for any format with a [`FormatDriver`].
pub struct Adapter<F: FormatDriver> {
    driver: F,
    fetcher: Rc<dyn AssetFetcher>,
    config: ViewerConfig,
    bone_map: BoneMap,
    surface: RenderSurface,
    state: LoadState,
    model: Option<LoadedModel>,
    events: EventHub,
}

impl<F: FormatDriver> fmt::Debug for Adapter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("format", &F::MODEL_TYPE)
            .field("state", &self.state)
            .field("model", &self.model.as_ref().map(|m| &m.metadata.name))
            .field("surface", &self.surface)
            .finish()
    }
}

impl<F: FormatDriver> Adapter<F> {
    pub fn new(fetcher: Rc<dyn AssetFetcher>, config: ViewerConfig) -> Self {
        Self {
            driver: F::default(),
            surface: RenderSurface::new(config.width, config.height),
            fetcher,
            config,
            bone_map: BoneMap::mixamo_to_vrm(),
            state: LoadState::Unloaded,
            model: None,
            events: EventHub::new(),
        }
    }

    /// Replaces the table used to retarget external animations.
    pub fn set_bone_map(&mut self, bone_map: BoneMap) {
        self.bone_map = bone_map;
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.model.as_ref().map(|model| &model.scene)
    }

    pub fn expressions(&self) -> Option<SharedExpressions> {
        self.model.as_ref().map(|model| model.expressions.clone())
    }

    pub fn parameters(&self) -> Option<SharedParameters> {
        self.model.as_ref().map(|model| model.parameters.clone())
    }

    pub fn morph_influences(&self) -> Option<SharedInfluences> {
        self.model.as_ref().map(|model| model.influences.clone())
    }

    pub fn mixer(&self) -> Option<&AnimationMixer> {
        self.model.as_ref().map(|model| &model.mixer)
    }

    fn loaded_mut(&mut self) -> Result<&mut LoadedModel> {
        self.model.as_mut().ok_or(CompanionError::NotLoaded)
    }

    fn emit(&mut self, event: RendererEvent) {
        self.events.emit(&event);
    }

    fn build(&mut self, path: &Path, mut asset: ModelAsset) -> LoadedModel {
        if asset.name.is_empty() {
            asset.name = model_name(path);
        }
        let scene = Scene::build(&asset, self.surface.pool_mut(), None);
        let expressions = ExpressionSet::shared(&asset.expressions);
        let parameters = ParameterSet::shared();
        let influences = MorphInfluences::shared(asset.morphs.clone());

        let mouth: SharedTarget = match F::MOUTH {
            MouthKind::Parameters => Rc::new(RefCell::new(ParameterMouth::new(
                parameters.clone(),
                asset.lip_sync_parameters.clone(),
            ))),
            MouthKind::Expressions => Rc::new(RefCell::new(ExpressionMouth::new(
                expressions.clone(),
                &MouthCandidates::blend_shapes(),
            ))),
            MouthKind::Morphs => {
                let candidates = MouthCandidates::mmd_morphs();
                // Mouth morphs double as expressions; keep them out of the
                // exclusive set.
                let mut set = expressions.borrow_mut();
                for name in candidates.resolve_exact(&asset.morphs).values() {
                    set.reserve(name);
                }
                drop(set);
                Rc::new(RefCell::new(MorphMouth::new(influences.clone(), &candidates)))
            }
        };

        let metadata = ModelMetadata {
            model_type: F::MODEL_TYPE,
            name: asset.name.clone(),
            path: path.to_path_buf(),
            expressions: expressions.borrow().selectable(),
            motions: motion_groups(&asset),
        };
        let physics_enabled = asset.has_physics && F::MODEL_TYPE.capabilities().has_physics;

        LoadedModel {
            metadata,
            scene,
            expressions,
            parameters,
            influences,
            mouth,
            mixer: AnimationMixer::new(),
            gaze: GazeController::new(self.surface.width, self.surface.height),
            physics_enabled,
            mesh_files: Vec::new(),
            external_clips: Vec::new(),
            asset,
        }
    }

    /// Fetches a file that is not part of the model currently loading.
    async fn fetch_external(&self, path: &Path) -> Result<Vec<u8>> {
        let context = LoadContext::new(
            self.fetcher.clone(),
            AssetResolver::for_path(path)?,
            LoadTicket::detached(),
            self.config.load_timeout_ms,
        );
        context.fetch_model().await
    }

    fn write_gaze(&mut self, gaze: Gaze) {
        if F::MODEL_TYPE != ModelType::Live2d {
            return;
        }
        if let Some(model) = &self.model {
            let mut params = model.parameters.borrow_mut();
            params.set("ParamAngleX", gaze.yaw);
            params.set("ParamAngleY", gaze.pitch);
            params.set("ParamEyeBallX", gaze.yaw / 30.0);
            params.set("ParamEyeBallY", gaze.pitch / 20.0);
        }
    }
}

#[async_trait(?Send)]
impl<F: FormatDriver> ModelRenderer for Adapter<F> {
    fn model_type(&self) -> ModelType {
        F::MODEL_TYPE
    }

    fn state(&self) -> LoadState {
        self.state
    }

    fn metadata(&self) -> Option<&ModelMetadata> {
        self.model.as_ref().map(|model| &model.metadata)
    }

    fn surface(&self) -> &RenderSurface {
        &self.surface
    }

    async fn load(&mut self, path: &Path, ticket: LoadTicket) -> Result<LoadOutcome> {
        if self.state == LoadState::Disposed {
            return Err(CompanionError::Disposed);
        }
        if self.model.is_some() {
            self.unload_model();
        }
        self.state = LoadState::Loading;
        info!(path = %path.display(), format = F::MODEL_TYPE.as_str(), "loading model");

        let decoded = match AssetResolver::for_path(path) {
            Ok(resolver) => {
                let context = LoadContext::new(
                    self.fetcher.clone(),
                    resolver,
                    ticket,
                    self.config.load_timeout_ms,
                );
                match self.driver.decode(&context).await {
                    Ok(asset) => context.ensure_current().map(|_| asset),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        match decoded {
            Ok(asset) => {
                let model = self.build(path, asset);
                let metadata = model.metadata.clone();
                info!(
                    model = %metadata.name,
                    meshes = model.asset.meshes.len(),
                    expressions = metadata.expressions.len(),
                    "model loaded"
                );
                self.model = Some(model);
                self.state = LoadState::Loaded;
                self.emit(RendererEvent::Loaded(metadata.clone()));
                Ok(LoadOutcome::Loaded(metadata))
            }
            Err(err) if err.is_cancellation() => {
                debug!(path = %path.display(), "load superseded");
                self.state = LoadState::Unloaded;
                Ok(LoadOutcome::Cancelled)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "model load failed");
                self.state = LoadState::Error;
                self.emit(RendererEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    fn unload_model(&mut self) {
        let Some(model) = self.model.take() else {
            return;
        };
        let LoadedModel {
            metadata,
            mouth,
            mut scene,
            mut mixer,
            ..
        } = model;
        mixer.stop();
        mouth.borrow_mut().reset_mouth();
        // The lip-sync controller only holds a weak handle; dropping ours
        // detaches it before any resource goes away.
        drop(mouth);
        let failures = scene.release_all(self.surface.pool_mut());
        if self.state != LoadState::Disposed {
            self.state = LoadState::Unloaded;
        }
        debug!(model = %metadata.name, failures, "model unloaded");
    }

    fn dispose(&mut self) {
        if self.state == LoadState::Disposed {
            return;
        }
        self.unload_model();
        self.surface.teardown();
        self.state = LoadState::Disposed;
        self.emit(RendererEvent::Disposed);
        self.events.clear();
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.surface.width = width;
        self.surface.height = height;
        if let Some(model) = self.model.as_mut() {
            model.gaze.resize(width, height);
        }
    }

    fn set_scale(&mut self, scale: f32) {
        self.surface.scale = scale;
    }

    fn set_position(&mut self, x: f32, y: f32) {
        self.surface.position = (x, y);
    }

    fn reset_view(&mut self) {
        self.surface.reset_view();
    }

    fn update(&mut self, delta_ms: f64) {
        let finished = match self.model.as_mut() {
            Some(model) => model.mixer.update(delta_ms),
            None => return,
        };
        for done in finished {
            self.emit(RendererEvent::MotionEnded {
                group: done.group,
                name: done.clip,
            });
        }
    }

    fn lip_sync_target(&self) -> Option<TargetRef> {
        self.model.as_ref().map(|model| Rc::downgrade(&model.mouth))
    }

    fn set_expression(&mut self, name: &str, weight: f32) -> Result<()> {
        self.loaded_mut()?
            .expressions
            .borrow_mut()
            .set_exclusive(name, weight)?;
        self.emit(RendererEvent::ExpressionChanged {
            name: name.to_string(),
            weight: weight.clamp(0.0, 1.0),
        });
        Ok(())
    }

    fn available_expressions(&self) -> Vec<String> {
        self.model
            .as_ref()
            .map(|model| model.expressions.borrow().selectable())
            .unwrap_or_default()
    }

    fn reset_expression(&mut self) {
        if let Some(model) = &self.model {
            model.expressions.borrow_mut().reset();
        }
    }

    fn set_from_emotion(&mut self, emotion: Emotion) -> Option<String> {
        let available = self.available_expressions();
        match resolve_emotion(F::MODEL_TYPE, emotion, &available) {
            Some(name) => match self.set_expression(&name, 1.0) {
                Ok(()) => Some(name),
                Err(err) => {
                    warn!(%err, %emotion, "could not apply emotion");
                    None
                }
            },
            None => {
                if emotion == Emotion::Neutral {
                    self.reset_expression();
                }
                debug!(%emotion, "no expression matches emotion");
                None
            }
        }
    }

    fn play_motion(&mut self, group: &str, index: Option<usize>) -> Result<()> {
        let fade_ms = self.config.cross_fade_ms;
        let model = self.loaded_mut()?;
        let index = index.unwrap_or(0);
        let name = motion_groups(&model.asset)
            .into_iter()
            .find(|g| g.name == group)
            .and_then(|g| g.motions.get(index).cloned())
            .ok_or_else(|| CompanionError::UnknownMotion {
                group: group.to_string(),
                index,
            })?;
        let clip = model
            .asset
            .clips
            .iter()
            .find(|clip| clip.name == name)
            .cloned()
            .unwrap_or_else(|| AnimationClip::new(name.as_str(), 0.0));
        model.mixer.play(group, &clip, fade_ms);
        self.emit(RendererEvent::MotionStarted {
            group: group.to_string(),
            name,
        });
        Ok(())
    }

    fn stop_motion(&mut self) {
        if let Some(model) = self.model.as_mut() {
            model.mixer.stop();
        }
    }

    fn available_motions(&self) -> Vec<MotionGroup> {
        self.model
            .as_ref()
            .map(|model| motion_groups(&model.asset))
            .unwrap_or_default()
    }

    fn play_idle_motion(&mut self) -> Result<()> {
        if self.model.is_none() {
            return Err(CompanionError::NotLoaded);
        }
        let groups = self.available_motions();
        let idle = groups.iter().find_map(|g| {
            if is_idle_name(&g.name) && !g.motions.is_empty() {
                Some((g.name.clone(), 0))
            } else {
                g.motions
                    .iter()
                    .position(|m| is_idle_name(m))
                    .map(|i| (g.name.clone(), i))
            }
        });
        let pick = idle.or_else(|| {
            groups
                .iter()
                .find(|g| !g.motions.is_empty())
                .map(|g| (g.name.clone(), 0))
        });
        match pick {
            Some((group, index)) => self.play_motion(&group, Some(index)),
            None => {
                debug!("model has no motions to idle on");
                Ok(())
            }
        }
    }

    async fn load_animation(&mut self, path: &Path) -> Result<String> {
        if !F::EXTERNAL_ANIMATIONS {
            return Err(CompanionError::Unsupported("external animations"));
        }
        if self.model.is_none() {
            return Err(CompanionError::NotLoaded);
        }
        let bytes = self.fetch_external(path).await?;
        let clips = decode_animation(path, &bytes)?;

        let model = self.model.as_mut().ok_or(CompanionError::NotLoaded)?;
        let pool = self.surface.pool_mut();
        let mut first = None;
        for clip in clips {
            let mut clip = self.bone_map.retarget(&clip, &model.asset);
            if clip.name.is_empty() {
                clip.name = model_name(path);
            }
            if clip.tracks.is_empty() {
                warn!(clip = %clip.name, "animation has no tracks for this model");
            }
            let name = clip.name.clone();
            let source = animation_source(&name);
            model.mixer.remove_clip(&name);
            model.asset.clips.retain(|existing| existing.name != name);
            model.scene.remove_source(&source, pool);

            let mut cache = SceneNode::new(source.clone(), NodeKind::Group);
            cache.resources.push(pool.allocate(ResourceKind::AnimationCache));
            cache.source = Some(source);
            model.scene.push(cache);

            model.asset.clips.push(clip);
            if !model.external_clips.contains(&name) {
                model.external_clips.push(name.clone());
            }
            first.get_or_insert(name);
        }
        model.metadata.motions = motion_groups(&model.asset);

        let name = first.ok_or_else(|| CompanionError::invalid("animation", "file has no clips"))?;
        info!(animation = %name, path = %path.display(), "animation loaded");
        Ok(name)
    }

    fn unload_animation(&mut self, name: &str) -> Result<()> {
        let model = self.model.as_mut().ok_or(CompanionError::NotLoaded)?;
        if !model.external_clips.iter().any(|clip| clip == name) {
            return Err(CompanionError::UnknownAnimation(name.to_string()));
        }
        model.mixer.remove_clip(name);
        model.asset.clips.retain(|clip| clip.name != name);
        model.external_clips.retain(|clip| clip != name);
        model
            .scene
            .remove_source(&animation_source(name), self.surface.pool_mut());
        model.metadata.motions = motion_groups(&model.asset);
        Ok(())
    }

    fn look_at(&mut self) -> Option<&mut dyn LookAt> {
        if self.model.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn physics(&mut self) -> Option<&mut dyn Physics> {
        if F::MODEL_TYPE.capabilities().has_physics && self.model.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn outfit(&mut self) -> Option<&mut dyn Outfit> {
        if F::OUTFIT && self.model.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn on(&mut self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.events.on(kind, handler)
    }

    fn off(&mut self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }
}

impl<F: FormatDriver> LookAt for Adapter<F> {
    fn look_at_point(&mut self, x: f32, y: f32) -> Gaze {
        let gaze = match self.model.as_mut() {
            Some(model) => model.gaze.look_at(x, y),
            None => return Gaze::default(),
        };
        self.write_gaze(gaze);
        gaze
    }

    fn set_auto_track(&mut self, enabled: bool) {
        if let Some(model) = self.model.as_mut() {
            model.gaze.set_auto_track(enabled);
        }
    }

    fn auto_track(&self) -> bool {
        self.model
            .as_ref()
            .map(|model| model.gaze.auto_track())
            .unwrap_or(false)
    }

    fn track_pointer(&mut self, x: f32, y: f32) -> Option<Gaze> {
        let gaze = self.model.as_mut()?.gaze.track_pointer(x, y)?;
        self.write_gaze(gaze);
        Some(gaze)
    }

    fn reset_gaze(&mut self) {
        if let Some(model) = self.model.as_mut() {
            model.gaze.reset();
        }
        self.write_gaze(Gaze::default());
    }

    fn gaze(&self) -> Gaze {
        self.model
            .as_ref()
            .map(|model| model.gaze.gaze())
            .unwrap_or_default()
    }
}

impl<F: FormatDriver> Physics for Adapter<F> {
    fn set_physics_enabled(&mut self, enabled: bool) {
        if let Some(model) = self.model.as_mut() {
            model.physics_enabled = enabled;
        }
    }

    fn physics_enabled(&self) -> bool {
        self.model
            .as_ref()
            .map(|model| model.physics_enabled)
            .unwrap_or(false)
    }
}

fn base_parts(scene: &Scene) -> Vec<OutfitPart> {
    let base = scene.meshes_from(None);
    let mut parts = infer_parts(base.iter().map(String::as_str));
    for part in &mut parts {
        part.visible = scene
            .nodes()
            .iter()
            .filter(|node| {
                node.kind == NodeKind::Mesh
                    && node.source.is_none()
                    && part.mesh_names.contains(&node.name)
            })
            .all(|node| node.visible);
    }
    parts
}

#[async_trait(?Send)]
impl<F: FormatDriver> Outfit for Adapter<F> {
    fn outfit_parts(&self) -> Vec<OutfitPart> {
        let Some(model) = &self.model else {
            return Vec::new();
        };
        let mut parts = base_parts(&model.scene);
        for file in &model.mesh_files {
            let visible = model
                .scene
                .nodes()
                .iter()
                .filter(|node| node.kind == NodeKind::Mesh && node.source.as_deref() == Some(file))
                .all(|node| node.visible);
            parts.push(OutfitPart {
                name: file.clone(),
                visible,
                mesh_names: model.scene.meshes_from(Some(file)),
            });
        }
        parts
    }

    fn set_part_visible(&mut self, part: &str, visible: bool) -> Result<()> {
        let model = self.loaded_mut()?;
        if model.mesh_files.iter().any(|file| file == part) {
            model.scene.set_source_visible(Some(part), visible);
            return Ok(());
        }
        let meshes = base_parts(&model.scene)
            .into_iter()
            .find(|p| p.name == part)
            .map(|p| p.mesh_names)
            .ok_or_else(|| CompanionError::msg(format!("unknown outfit part `{part}`")))?;
        for mesh in &meshes {
            model.scene.set_mesh_visible(None, mesh, visible);
        }
        Ok(())
    }

    fn set_all_parts_visible(&mut self, visible: bool) {
        if let Some(model) = self.model.as_mut() {
            model.scene.set_source_visible(None, visible);
            for file in &model.mesh_files {
                model.scene.set_source_visible(Some(file), visible);
            }
        }
    }

    async fn load_mesh_file(&mut self, path: &Path) -> Result<OutfitPart> {
        if self.model.is_none() {
            return Err(CompanionError::NotLoaded);
        }
        let bytes = self.fetch_external(path).await?;
        let mut asset = decode_mesh_file(path, &bytes)?;
        let part = model_name(path);
        asset.name = part.clone();

        let model = self.model.as_mut().ok_or(CompanionError::NotLoaded)?;
        let pool = self.surface.pool_mut();
        if model.mesh_files.contains(&part) {
            model.scene.remove_source(&part, pool);
        } else {
            model.mesh_files.push(part.clone());
        }
        model.scene.merge(&asset, pool, Some(&part));
        info!(part = %part, meshes = asset.meshes.len(), "mesh file merged");

        Ok(OutfitPart {
            mesh_names: model.scene.meshes_from(Some(&part)),
            name: part,
            visible: true,
        })
    }

    fn unload_mesh_file(&mut self, part: &str) -> Result<()> {
        let model = self.model.as_mut().ok_or(CompanionError::NotLoaded)?;
        if !model.mesh_files.iter().any(|file| file == part) {
            return Err(CompanionError::msg(format!("unknown outfit part `{part}`")));
        }
        model.mesh_files.retain(|file| file != part);
        model.scene.remove_source(part, self.surface.pool_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        assets::{LoadSequencer, MemoryFetcher},
        formats::{
            fbx::tests::sample_fbx,
            gltf::tests::{glb, plain_document, vrm0_document},
            live2d::tests::{MODEL3, MOTION3},
            pmx::tests::sample_pmx,
        },
        lipsync::LipSyncTarget,
        Phoneme,
    };

    fn recorder<F: FormatDriver>(adapter: &mut Adapter<F>) -> Rc<RefCell<Vec<RendererEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [
            EventKind::Loaded,
            EventKind::Error,
            EventKind::ExpressionChanged,
            EventKind::MotionStarted,
            EventKind::MotionEnded,
            EventKind::Disposed,
        ] {
            let log = seen.clone();
            adapter.on(kind, Box::new(move |event| log.borrow_mut().push(event.clone())));
        }
        seen
    }

    fn mmd(fetcher: &Rc<MemoryFetcher>) -> MmdRenderer {
        fetcher
            .insert_path("/models/miku/miku.pmx", sample_pmx(2))
            .unwrap();
        Adapter::new(fetcher.clone(), ViewerConfig::default())
    }

    fn live2d_fetcher() -> Rc<MemoryFetcher> {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/models/hiyori/hiyori.model3.json", MODEL3)
            .unwrap();
        fetcher
            .insert_path("/models/hiyori/hiyori.moc3", b"MOC3".to_vec())
            .unwrap();
        fetcher
            .insert_path("/models/hiyori/motions/hiyori_m01.motion3.json", MOTION3)
            .unwrap();
        fetcher
    }

    #[tokio::test]
    async fn load_unload_cycles_release_everything() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let mut renderer = mmd(&fetcher);
        let path = Path::new("/models/miku/miku.pmx");

        for _ in 0..3 {
            let outcome = renderer.load(path, LoadTicket::detached()).await.unwrap();
            let LoadOutcome::Loaded(metadata) = outcome else {
                panic!("expected a loaded model");
            };
            assert_eq!(metadata.model_type, ModelType::Mmd);
            assert_eq!(metadata.name, "ミク");
            assert!(renderer.surface().pool().live_count() > 0);

            renderer.unload_model();
            assert_eq!(renderer.state(), LoadState::Unloaded);
            assert_eq!(renderer.surface().pool().live_count(), 0);
        }
    }

    #[tokio::test]
    async fn loading_twice_unloads_first() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let mut renderer = mmd(&fetcher);
        let path = Path::new("/models/miku/miku.pmx");

        renderer.load(path, LoadTicket::detached()).await.unwrap();
        let live = renderer.surface().pool().live_count();
        renderer.load(path, LoadTicket::detached()).await.unwrap();
        assert_eq!(renderer.surface().pool().live_count(), live);
    }

    #[tokio::test]
    async fn dispose_is_terminal() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let mut renderer = mmd(&fetcher);
        let events = recorder(&mut renderer);
        let path = Path::new("/models/miku/miku.pmx");
        renderer.load(path, LoadTicket::detached()).await.unwrap();

        renderer.dispose();
        renderer.dispose();
        assert_eq!(renderer.state(), LoadState::Disposed);
        assert_eq!(renderer.surface().pool().live_count(), 0);
        assert_eq!(
            events
                .borrow()
                .iter()
                .filter(|e| **e == RendererEvent::Disposed)
                .count(),
            1
        );
        assert!(matches!(
            renderer.load(path, LoadTicket::detached()).await,
            Err(CompanionError::Disposed)
        ));
    }

    #[tokio::test]
    async fn mmd_mouth_writes_morph_influences() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let mut renderer = mmd(&fetcher);
        renderer
            .load(Path::new("/models/miku/miku.pmx"), LoadTicket::detached())
            .await
            .unwrap();

        let target = renderer.lip_sync_target().unwrap().upgrade().unwrap();
        target.borrow_mut().set_mouth_shape(Phoneme::A, 0.7);
        let influences = renderer.morph_influences().unwrap();
        assert_eq!(influences.borrow().get(0), 0.7);

        assert_eq!(renderer.available_expressions(), vec!["笑い"]);
        assert_eq!(
            renderer.set_from_emotion(Emotion::Happy).as_deref(),
            Some("笑い")
        );
        assert!(renderer.physics().unwrap().physics_enabled());
    }

    #[tokio::test]
    async fn vmd_motions_attach_to_mmd_models() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/motions/dance.vmd", crate::formats::vmd::tests::sample_vmd())
            .unwrap();
        let mut renderer = mmd(&fetcher);
        renderer
            .load(Path::new("/models/miku/miku.pmx"), LoadTicket::detached())
            .await
            .unwrap();

        let name = renderer
            .load_animation(Path::new("/motions/dance.vmd"))
            .await
            .unwrap();
        assert_eq!(name, "dance");
        renderer.play_motion("Default", None).unwrap();
        assert_eq!(renderer.mixer().unwrap().current().unwrap().clip, "dance");
        assert!(matches!(
            renderer.load_animation(Path::new("/motions/dance.bvh")).await,
            Err(CompanionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn unloading_drops_the_lip_sync_target() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let mut renderer = mmd(&fetcher);
        renderer
            .load(Path::new("/models/miku/miku.pmx"), LoadTicket::detached())
            .await
            .unwrap();
        let weak = renderer.lip_sync_target().unwrap();

        renderer.unload_model();
        assert!(weak.upgrade().is_none());
        assert!(renderer.lip_sync_target().is_none());
    }

    #[tokio::test]
    async fn live2d_loads_settings_and_motions() {
        let fetcher = live2d_fetcher();
        let mut renderer = Live2dRenderer::new(fetcher, ViewerConfig::default());
        let events = recorder(&mut renderer);

        let outcome = renderer
            .load(
                Path::new("/models/hiyori/hiyori.model3.json"),
                LoadTicket::detached(),
            )
            .await
            .unwrap();
        let LoadOutcome::Loaded(metadata) = outcome else {
            panic!("expected a loaded model");
        };
        assert_eq!(metadata.name, "hiyori");
        assert_eq!(metadata.expressions, vec!["f01", "smile"]);
        assert_eq!(metadata.motions[0].motions, vec!["hiyori_m01", "hiyori_m02"]);

        renderer.play_idle_motion().unwrap();
        let current = renderer.mixer().unwrap().current().unwrap();
        assert_eq!(current.clip, "hiyori_m01");
        assert!(events.borrow().contains(&RendererEvent::MotionStarted {
            group: "Idle".into(),
            name: "hiyori_m01".into(),
        }));

        let target = renderer.lip_sync_target().unwrap().upgrade().unwrap();
        target.borrow_mut().set_mouth_shape(Phoneme::A, 0.7);
        assert_eq!(
            renderer.parameters().unwrap().borrow().get("ParamMouthOpenY"),
            0.7
        );

        assert!(renderer.outfit().is_none());
        assert!(matches!(
            renderer.load_animation(Path::new("/models/dance.vmd")).await,
            Err(CompanionError::Unsupported(_))
        ));

        let gaze = renderer.look_at().unwrap().look_at_point(800.0, 300.0);
        assert_eq!(gaze.yaw, 30.0);
        assert_eq!(renderer.parameters().unwrap().borrow().get("ParamAngleX"), 30.0);
    }

    #[tokio::test]
    async fn failed_load_reports_error_and_allows_retry() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/models/hiyori/hiyori.model3.json", MODEL3)
            .unwrap();
        let mut renderer = Live2dRenderer::new(fetcher.clone(), ViewerConfig::default());
        let events = recorder(&mut renderer);
        let path = Path::new("/models/hiyori/hiyori.model3.json");

        assert!(renderer.load(path, LoadTicket::detached()).await.is_err());
        assert_eq!(renderer.state(), LoadState::Error);
        assert!(matches!(events.borrow()[0], RendererEvent::Error(_)));

        fetcher
            .insert_path("/models/hiyori/hiyori.moc3", b"MOC3".to_vec())
            .unwrap();
        renderer.load(path, LoadTicket::detached()).await.unwrap();
        assert_eq!(renderer.state(), LoadState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_times_out() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let url = fetcher
            .insert_path("/models/miku/miku.pmx", sample_pmx(0))
            .unwrap();
        fetcher.set_delay(&url, Duration::from_secs(120));
        let config = ViewerConfig {
            load_timeout_ms: 1_000,
            ..ViewerConfig::default()
        };
        let mut renderer = MmdRenderer::new(fetcher, config);
        let events = recorder(&mut renderer);

        let err = renderer
            .load(Path::new("/models/miku/miku.pmx"), LoadTicket::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, CompanionError::LoadTimeout { .. }));
        assert_eq!(renderer.state(), LoadState::Error);
        assert_eq!(events.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_load_is_cancelled_quietly() {
        let fetcher = Rc::new(MemoryFetcher::new());
        let url = fetcher
            .insert_path("/models/miku/miku.pmx", sample_pmx(0))
            .unwrap();
        fetcher.set_delay(&url, Duration::from_millis(100));
        let mut renderer = MmdRenderer::new(fetcher, ViewerConfig::default());
        let events = recorder(&mut renderer);
        let sequencer = LoadSequencer::new();
        let ticket = sequencer.issue();

        let (outcome, _) = tokio::join!(
            renderer.load(Path::new("/models/miku/miku.pmx"), ticket),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sequencer.issue();
            }
        );

        assert_eq!(outcome.unwrap(), LoadOutcome::Cancelled);
        assert_eq!(renderer.state(), LoadState::Unloaded);
        assert!(events.borrow().is_empty());
        assert_eq!(renderer.surface().pool().live_count(), 0);
    }

    #[tokio::test]
    async fn vrm_expressions_are_exclusive() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/models/alicia/alicia.vrm", glb(&vrm0_document()))
            .unwrap();
        let mut renderer = VrmRenderer::new(fetcher, ViewerConfig::default());
        renderer
            .load(Path::new("/models/alicia/alicia.vrm"), LoadTicket::detached())
            .await
            .unwrap();

        assert_eq!(renderer.available_expressions(), vec!["joy", "sorrow", "Smirk"]);
        renderer.set_expression("joy", 1.0).unwrap();
        renderer.set_expression("sorrow", 0.8).unwrap();
        let expressions = renderer.expressions().unwrap();
        assert_eq!(expressions.borrow().weight("joy"), Some(0.0));
        assert_eq!(expressions.borrow().weight("sorrow"), Some(0.8));

        assert_eq!(renderer.set_from_emotion(Emotion::Happy).as_deref(), Some("joy"));
        assert!(matches!(
            renderer.set_expression("wink", 1.0),
            Err(CompanionError::UnknownExpression(_))
        ));
    }

    #[tokio::test]
    async fn vrm_driver_rejects_plain_gltf() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/models/plain.vrm", glb(&plain_document()))
            .unwrap();
        let mut renderer = VrmRenderer::new(fetcher, ViewerConfig::default());
        let err = renderer
            .load(Path::new("/models/plain.vrm"), LoadTicket::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, CompanionError::InvalidAsset { format: "vrm", .. }));
    }

    #[tokio::test]
    async fn motions_cross_fade_and_report_their_end() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/models/scene.glb", glb(&plain_document()))
            .unwrap();
        let mut renderer = GltfRenderer::new(fetcher, ViewerConfig::default());
        let events = recorder(&mut renderer);
        renderer
            .load(Path::new("/models/scene.glb"), LoadTicket::detached())
            .await
            .unwrap();

        renderer.play_idle_motion().unwrap();
        renderer.update(150.0);
        let weight = renderer.mixer().unwrap().current().unwrap().weight;
        assert!((weight - 0.5).abs() < 1e-6);

        renderer.update(2_000.0);
        assert!(events.borrow().contains(&RendererEvent::MotionEnded {
            group: "Idle".into(),
            name: "Idle".into(),
        }));
        assert!(matches!(
            renderer.play_motion("Dance", None),
            Err(CompanionError::UnknownMotion { .. })
        ));
    }

    #[tokio::test]
    async fn external_animations_come_and_go() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher
            .insert_path("/models/scene.glb", glb(&plain_document()))
            .unwrap();
        fetcher
            .insert_path("/motions/walk.fbx", sample_fbx())
            .unwrap();
        let mut renderer = GltfRenderer::new(fetcher, ViewerConfig::default());
        renderer
            .load(Path::new("/models/scene.glb"), LoadTicket::detached())
            .await
            .unwrap();
        let live = renderer.surface().pool().live_count();

        let name = renderer
            .load_animation(Path::new("/motions/walk.fbx"))
            .await
            .unwrap();
        assert_eq!(name, "Walk");
        assert!(renderer
            .available_motions()
            .iter()
            .any(|g| g.motions.contains(&"Walk".to_string())));
        assert_eq!(renderer.surface().pool().live_count(), live + 1);
        renderer.play_motion("Default", None).unwrap();

        renderer.unload_animation("Walk").unwrap();
        assert_eq!(renderer.surface().pool().live_count(), live);
        assert!(renderer.mixer().unwrap().actions().iter().all(|a| a.clip != "Walk"));
        assert!(matches!(
            renderer.unload_animation("Walk"),
            Err(CompanionError::UnknownAnimation(_))
        ));
    }

    #[tokio::test]
    async fn outfit_parts_toggle_and_merge() {
        let fetcher = Rc::new(MemoryFetcher::new());
        fetcher.insert_path("/models/rig/rig.fbx", sample_fbx()).unwrap();
        fetcher
            .insert_path("/models/rig/jacket.fbx", sample_fbx())
            .unwrap();
        let mut renderer = FbxRenderer::new(fetcher, ViewerConfig::default());
        renderer
            .load(Path::new("/models/rig/rig.fbx"), LoadTicket::detached())
            .await
            .unwrap();
        let live = renderer.surface().pool().live_count();
        let outfit = renderer.outfit().unwrap();

        let names: Vec<String> = outfit.outfit_parts().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["body", "accessories"]);

        outfit.set_part_visible("accessories", false).unwrap();
        let parts = outfit.outfit_parts();
        assert!(!parts[1].visible);
        assert!(parts[0].visible);

        let jacket = outfit
            .load_mesh_file(Path::new("/models/rig/jacket.fbx"))
            .await
            .unwrap();
        assert_eq!(jacket.name, "jacket");
        assert_eq!(jacket.mesh_names, vec!["Body", "Hat"]);
        assert_eq!(outfit.outfit_parts().len(), 3);

        outfit.set_all_parts_visible(true);
        assert!(outfit.outfit_parts().iter().all(|p| p.visible));

        outfit.unload_mesh_file("jacket").unwrap();
        assert!(outfit.unload_mesh_file("jacket").is_err());
        assert_eq!(renderer.surface().pool().live_count(), live);
    }
}
