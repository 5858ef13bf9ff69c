use std::collections::HashMap;

use crate::{
    mapping::{ParameterUpdate, PropertyTarget},
    scene::{ContainerId, ImageRef, SceneRenderer, SpriteHandle},
    EffectSet, Result,
};

/// Headless rendering backend. It keeps track of containers, sprites, the
/// effect set each container shows and the latest value of every property,
/// without drawing anything.
#[derive(Debug)]
pub struct RenderGraph {
    width: f32,
    height: f32,
    containers: Vec<ContainerId>,
    names: HashMap<ContainerId, String>,
    sprites: HashMap<SpriteHandle, ImageRef>,
    children: HashMap<ContainerId, Vec<SpriteHandle>>,
    active: HashMap<ContainerId, EffectSet>,
    history: Vec<(ContainerId, EffectSet)>,
    properties: HashMap<PropertyTarget, f64>,
    last_updates: Vec<ParameterUpdate>,
    next_sprite: u32,
    frames: u64,
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::with_size(1280.0, 720.0)
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            containers: Vec::new(),
            names: HashMap::new(),
            sprites: HashMap::new(),
            children: HashMap::new(),
            active: HashMap::new(),
            history: Vec::new(),
            properties: HashMap::new(),
            last_updates: Vec::new(),
            next_sprite: 0,
            frames: 0,
        }
    }

    pub fn containers(&self) -> &[ContainerId] {
        &self.containers
    }

    pub fn container_name(&self, container: ContainerId) -> Option<&str> {
        self.names.get(&container).map(String::as_str)
    }

    pub fn active_set(&self, container: ContainerId) -> Option<&EffectSet> {
        self.active.get(&container)
    }

    /// Every effect set assignment, oldest first.
    pub fn history(&self) -> &[(ContainerId, EffectSet)] {
        &self.history
    }

    pub fn property(&self, target: &PropertyTarget) -> Option<f64> {
        self.properties.get(target).copied()
    }

    pub fn children(&self, container: ContainerId) -> &[SpriteHandle] {
        self.children
            .get(&container)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn sprite_image(&self, sprite: SpriteHandle) -> Option<&ImageRef> {
        self.sprites.get(&sprite)
    }

    pub fn last_updates(&self) -> &[ParameterUpdate] {
        &self.last_updates
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn draw(&mut self) -> Result<()> {
        // Nothing to rasterise; the frame counter lets callers check the loop
        // is alive.
        self.frames += 1;
        tracing::trace!(
            frame = self.frames,
            updates = self.last_updates.len(),
            "headless frame"
        );
        Ok(())
    }
}

impl SceneRenderer for RenderGraph {
    fn create_container(&mut self, name: &str) -> ContainerId {
        let id = ContainerId(self.containers.len() as u32);
        self.containers.push(id);
        self.names.insert(id, name.to_string());
        id
    }

    fn set_active_effect_set(&mut self, container: ContainerId, set: &EffectSet) {
        self.active.insert(container, set.clone());
        self.history.push((container, set.clone()));
    }

    fn container_dimensions(&self, _container: ContainerId) -> (f32, f32) {
        // Every container fills the stage.
        (self.width, self.height)
    }

    fn create_sprite(&mut self, image: &ImageRef) -> SpriteHandle {
        let sprite = SpriteHandle(self.next_sprite);
        self.next_sprite += 1;
        self.sprites.insert(sprite, image.clone());
        sprite
    }

    fn add_child(&mut self, container: ContainerId, child: SpriteHandle) {
        self.children.entry(container).or_default().push(child);
    }

    fn apply_updates(&mut self, updates: &[ParameterUpdate]) {
        self.last_updates = updates.to_vec();
        for update in updates {
            self.properties.insert(update.target.clone(), update.value);
        }
    }
}
