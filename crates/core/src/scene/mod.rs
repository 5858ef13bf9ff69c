//! The renderer seam and the default stage layout.

use std::fmt;

use crate::{
    EffectHandle, EffectPool, EffectSet, LiveEffect, ParameterUpdate, PropertyTarget, Result,
    SceneConfig, TimeUniform,
};

/// Identifies a drawable container owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u32);

/// Identifies a sprite owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpriteHandle(pub u32);

/// Key of an image the renderer knows how to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the core needs from a rendering surface.
///
/// The core only pushes state through these calls; whatever the renderer
/// draws each frame is read from what it was last told.
pub trait SceneRenderer {
    fn create_container(&mut self, name: &str) -> ContainerId;

    fn set_active_effect_set(&mut self, container: ContainerId, set: &EffectSet);

    /// Width and height in pixels.
    fn container_dimensions(&self, container: ContainerId) -> (f32, f32);

    fn create_sprite(&mut self, image: &ImageRef) -> SpriteHandle;

    fn add_child(&mut self, container: ContainerId, child: SpriteHandle);

    fn apply_updates(&mut self, updates: &[ParameterUpdate]);
}

/// A container whose effects follow the beat.
#[derive(Debug, Clone)]
pub struct BeatTarget {
    pub container: ContainerId,
    pub pool: EffectPool,
}

/// Per-frame animation bindings.
#[derive(Debug, Clone, Default)]
pub struct Animations {
    /// Sprites turned by `rotation_speed_per_frame` every frame.
    pub rotating: Vec<SpriteHandle>,
    pub uniforms: Vec<TimeUniform>,
    pub live_effects: Vec<LiveEffect>,
}

/// Everything the scheduler drives once the scene has been built.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    pub targets: Vec<BeatTarget>,
    pub animations: Animations,
}

/// Builds the default two-layer scene.
///
/// The background carries the starfield shader and a pulsing bloom and never
/// changes its effect set. The logo sits centred on top and takes a transient
/// effect set on every beat.
pub fn build_stage<R: SceneRenderer>(renderer: &mut R, config: &SceneConfig) -> Result<Stage> {
    let starfield = EffectHandle::new("starfield");
    let alpha = EffectHandle::new("alpha");
    let bloom = EffectHandle::new("advanced-bloom");
    let kawase = EffectHandle::new("kawase-blur");

    let background = renderer.create_container("background");
    let (width, height) = renderer.container_dimensions(background);
    let backdrop = renderer.create_sprite(&ImageRef::new(&config.background_image));
    renderer.apply_updates(&[
        ParameterUpdate::new(PropertyTarget::PositionX(backdrop), 0.0),
        ParameterUpdate::new(PropertyTarget::PositionY(backdrop), 0.0),
        ParameterUpdate::new(PropertyTarget::Width(backdrop), f64::from(width)),
        ParameterUpdate::new(PropertyTarget::Height(backdrop), f64::from(height)),
        ParameterUpdate::effect_param(&alpha, "alpha", 0.5),
        ParameterUpdate::effect_param(&kawase, "blur", 0.2),
        ParameterUpdate::effect_param(&kawase, "quality", 3.0),
        ParameterUpdate::effect_param(&bloom, "threshold", 0.5),
        ParameterUpdate::effect_param(&bloom, "bloom_scale", 2.0),
    ]);
    renderer.add_child(background, backdrop);
    renderer.set_active_effect_set(
        background,
        &EffectSet::new([starfield.clone(), alpha, bloom.clone(), kawase]),
    );

    let outline = EffectHandle::new("outline");
    let motion_blur = EffectHandle::new("motion-blur");
    let rgb_split = EffectHandle::new("rgb-split");
    let glow = EffectHandle::new("glow");
    let color_shift = EffectHandle::new("color-shift");

    let logo_layer = renderer.create_container("logo");
    let (logo_width, logo_height) = renderer.container_dimensions(logo_layer);
    let logo = renderer.create_sprite(&ImageRef::new(&config.logo_image));
    let size = f64::from(logo_width * config.logo_size_ratio);
    renderer.apply_updates(&[
        ParameterUpdate::new(PropertyTarget::PositionX(logo), f64::from(logo_width) / 2.0),
        ParameterUpdate::new(PropertyTarget::PositionY(logo), f64::from(logo_height) / 2.0),
        ParameterUpdate::new(PropertyTarget::Width(logo), size),
        ParameterUpdate::new(PropertyTarget::Height(logo), size),
        ParameterUpdate::effect_param(&outline, "thickness", 2.0),
        ParameterUpdate::effect_param(&motion_blur, "kernel_size", 15.0),
    ]);
    renderer.add_child(logo_layer, logo);

    let pool = EffectPool::new(
        EffectSet::new([outline]),
        vec![
            EffectSet::new([motion_blur, rgb_split]),
            EffectSet::new([glow]),
            EffectSet::new([color_shift]),
        ],
    )?;
    renderer.set_active_effect_set(logo_layer, pool.base());

    tracing::debug!(width, height, logo_size = size, "stage built");

    Ok(Stage {
        targets: vec![BeatTarget {
            container: logo_layer,
            pool,
        }],
        animations: Animations {
            rotating: vec![logo],
            uniforms: vec![TimeUniform::new(
                starfield,
                "iTime",
                f64::from(config.starfield_speed),
            )],
            live_effects: vec![LiveEffect::pulsing_bloom(bloom)?],
        },
    })
}
