use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{formats::ModelAsset, CompanionError, Result};

pub type ResourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Geometry,
    Material,
    Texture,
    AnimationCache,
}

/// Book-keeping for everything a renderer has handed to the GPU. Each id is
/// owned by exactly one scene node.
#[derive(Debug, Default)]
pub struct ResourcePool {
    next_id: ResourceId,
    live: HashMap<ResourceId, ResourceKind>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, kind: ResourceKind) -> ResourceId {
        self.next_id += 1;
        self.live.insert(self.next_id, kind);
        self.next_id
    }

    pub fn release(&mut self, id: ResourceId) -> Result<()> {
        self.live
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CompanionError::Resource(format!("resource {id} was already released")))
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_of(&self, kind: ResourceKind) -> usize {
        self.live.values().filter(|k| **k == kind).count()
    }

    pub fn is_live(&self, id: ResourceId) -> bool {
        self.live.contains_key(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Mesh,
    Bone,
    /// Holder for resources shared by several meshes (texture cache, clips).
    Group,
}

#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub kind: NodeKind,
    pub visible: bool,
    pub resources: Vec<ResourceId>,
    /// Supplementary file this node was merged from.
    pub source: Option<String>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            visible: true,
            resources: Vec::new(),
            source: None,
        }
    }
}

/// Scene graph of one loaded model.
#[derive(Debug, Default)]
pub struct Scene {
    nodes: Vec<SceneNode>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds nodes for every mesh, bone and texture in `asset`, allocating
    /// their resources from `pool`.
    pub fn build(asset: &ModelAsset, pool: &mut ResourcePool, source: Option<&str>) -> Self {
        let mut scene = Scene::new();
        scene.merge(asset, pool, source);
        scene
    }

    /// Adds `asset`'s nodes to this scene.
    pub fn merge(&mut self, asset: &ModelAsset, pool: &mut ResourcePool, source: Option<&str>) {
        let mut textures = SceneNode::new(format!("{}:textures", asset.name), NodeKind::Group);
        let mut seen = HashSet::new();

        for mesh in &asset.meshes {
            let mut node = SceneNode::new(mesh.name.clone(), NodeKind::Mesh);
            node.resources.push(pool.allocate(ResourceKind::Geometry));
            node.resources.push(pool.allocate(ResourceKind::Material));
            node.source = source.map(str::to_string);
            self.nodes.push(node);
        }
        for texture in &asset.textures {
            if seen.insert(texture.as_str()) {
                textures.resources.push(pool.allocate(ResourceKind::Texture));
            }
        }
        if !textures.resources.is_empty() {
            textures.source = source.map(str::to_string);
            self.nodes.push(textures);
        }
        for bone in &asset.bones {
            let mut node = SceneNode::new(bone.clone(), NodeKind::Bone);
            node.source = source.map(str::to_string);
            self.nodes.push(node);
        }
    }

    pub fn nodes(&self) -> &[SceneNode] {
        &self.nodes
    }

    pub fn push(&mut self, node: SceneNode) {
        self.nodes.push(node);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn mesh_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Mesh)
            .map(|node| node.name.clone())
            .collect()
    }

    pub fn has_bone(&self, name: &str) -> bool {
        self.nodes
            .iter()
            .any(|node| node.kind == NodeKind::Bone && node.name == name)
    }

    pub fn is_visible(&self, mesh: &str) -> Option<bool> {
        self.nodes
            .iter()
            .find(|node| node.kind == NodeKind::Mesh && node.name == mesh)
            .map(|node| node.visible)
    }

    /// Sets visibility on every mesh called `mesh`. Returns whether any matched.
    pub fn set_visible(&mut self, mesh: &str, visible: bool) -> bool {
        let mut found = false;
        for node in &mut self.nodes {
            if node.kind == NodeKind::Mesh && node.name == mesh {
                node.visible = visible;
                found = true;
            }
        }
        found
    }

    /// Mesh names merged from `source`; `None` selects the base model.
    pub fn meshes_from(&self, source: Option<&str>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Mesh && node.source.as_deref() == source)
            .map(|node| node.name.clone())
            .collect()
    }

    /// Sets visibility on every mesh merged from `source`.
    pub fn set_source_visible(&mut self, source: Option<&str>, visible: bool) -> bool {
        let mut found = false;
        for node in &mut self.nodes {
            if node.kind == NodeKind::Mesh && node.source.as_deref() == source {
                node.visible = visible;
                found = true;
            }
        }
        found
    }

    /// Like [`Scene::set_visible`], restricted to meshes merged from `source`.
    pub fn set_mesh_visible(&mut self, source: Option<&str>, mesh: &str, visible: bool) -> bool {
        let mut found = false;
        for node in &mut self.nodes {
            if node.kind == NodeKind::Mesh && node.name == mesh && node.source.as_deref() == source
            {
                node.visible = visible;
                found = true;
            }
        }
        found
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.nodes
            .iter()
            .any(|node| node.source.as_deref() == Some(source))
    }

    /// Removes the nodes merged from `source` and releases their resources.
    pub fn remove_source(&mut self, source: &str, pool: &mut ResourcePool) -> usize {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|node| node.source.as_deref() == Some(source));
        self.nodes = kept;
        release_nodes(removed, pool)
    }

    /// Walks the whole graph releasing every resource. A failing release is
    /// logged and the walk continues; the number of failures is returned.
    pub fn release_all(&mut self, pool: &mut ResourcePool) -> usize {
        release_nodes(std::mem::take(&mut self.nodes), pool)
    }
}

fn release_nodes(nodes: Vec<SceneNode>, pool: &mut ResourcePool) -> usize {
    let mut failures = 0;
    for node in nodes {
        for id in node.resources {
            if let Err(err) = pool.release(id) {
                failures += 1;
                tracing::warn!(node = %node.name, %err, "failed to release scene resource");
            }
        }
    }
    failures
}

/// Gaze direction in degrees derived from a viewport coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Gaze {
    pub yaw: f32,
    pub pitch: f32,
}

const MAX_YAW_DEG: f32 = 30.0;
const MAX_PITCH_DEG: f32 = 20.0;

#[derive(Debug, Clone, Default)]
pub struct GazeController {
    gaze: Gaze,
    auto_track: bool,
    viewport: (f32, f32),
}

impl GazeController {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: (width.max(1) as f32, height.max(1) as f32),
            ..Default::default()
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport = (width.max(1) as f32, height.max(1) as f32);
    }

    /// Points the gaze at a pixel position. The viewport centre is straight
    /// ahead; the edges map to the maximum yaw and pitch.
    pub fn look_at(&mut self, x: f32, y: f32) -> Gaze {
        let (width, height) = self.viewport;
        let nx = ((x / width) * 2.0 - 1.0).clamp(-1.0, 1.0);
        let ny = ((y / height) * 2.0 - 1.0).clamp(-1.0, 1.0);
        self.gaze = Gaze {
            yaw: nx * MAX_YAW_DEG,
            pitch: -ny * MAX_PITCH_DEG,
        };
        self.gaze
    }

    /// Pointer movement only moves the gaze while auto-tracking is on.
    pub fn track_pointer(&mut self, x: f32, y: f32) -> Option<Gaze> {
        self.auto_track.then(|| self.look_at(x, y))
    }

    pub fn set_auto_track(&mut self, enabled: bool) {
        self.auto_track = enabled;
    }

    pub fn auto_track(&self) -> bool {
        self.auto_track
    }

    pub fn reset(&mut self) {
        self.gaze = Gaze::default();
    }

    pub fn gaze(&self) -> Gaze {
        self.gaze
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::MeshDesc;

    fn asset() -> ModelAsset {
        ModelAsset {
            name: "girl".into(),
            meshes: vec![MeshDesc::new("Hair"), MeshDesc::new("Body")],
            textures: vec!["tex/a.png".into(), "tex/a.png".into(), "tex/b.png".into()],
            bones: vec!["hips".into()],
            ..Default::default()
        }
    }

    #[test]
    fn builds_and_releases_everything() {
        let mut pool = ResourcePool::new();
        let mut scene = Scene::build(&asset(), &mut pool, None);

        assert_eq!(pool.live_of(ResourceKind::Geometry), 2);
        assert_eq!(pool.live_of(ResourceKind::Texture), 2);
        assert_eq!(scene.mesh_names(), vec!["Hair", "Body"]);
        assert!(scene.has_bone("hips"));

        assert_eq!(scene.release_all(&mut pool), 0);
        assert_eq!(pool.live_count(), 0);
        assert!(scene.is_empty());
    }

    #[test]
    fn release_continues_past_failures() {
        let mut pool = ResourcePool::new();
        let mut scene = Scene::build(&asset(), &mut pool, None);
        let first = scene.nodes()[0].resources[0];
        pool.release(first).unwrap();

        assert_eq!(scene.release_all(&mut pool), 1);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn removes_merged_sources_only() {
        let mut pool = ResourcePool::new();
        let mut scene = Scene::build(&asset(), &mut pool, None);
        let extra = ModelAsset {
            name: "hat".into(),
            meshes: vec![MeshDesc::new("Hat")],
            ..Default::default()
        };
        scene.merge(&extra, &mut pool, Some("hat"));
        let before = pool.live_count();

        assert_eq!(scene.remove_source("hat", &mut pool), 0);
        assert_eq!(pool.live_count(), before - 2);
        assert_eq!(scene.mesh_names(), vec!["Hair", "Body"]);
    }

    #[test]
    fn gaze_maps_viewport_edges() {
        let mut gaze = GazeController::new(200, 100);
        let centre = gaze.look_at(100.0, 50.0);
        assert_eq!(centre, Gaze::default());

        let corner = gaze.look_at(200.0, 0.0);
        assert_eq!(corner.yaw, MAX_YAW_DEG);
        assert_eq!(corner.pitch, MAX_PITCH_DEG);

        assert!(gaze.track_pointer(0.0, 0.0).is_none());
        gaze.set_auto_track(true);
        assert!(gaze.track_pointer(0.0, 0.0).is_some());
        gaze.reset();
        assert_eq!(gaze.gaze(), Gaze::default());
    }
}
