//! Core library for the beat visualiser.
//!
//! A short stretch of microphone input is captured and analysed for tempo,
//! which then drives a beat clock that flashes transient effect sets onto the
//! scene. Each module owns one subsystem (capture, analysis, clocks, effects,
//! scene construction, scheduling) and the scheduler ties them together behind
//! the [`SceneRenderer`] seam. The crate is intentionally synchronous apart
//! from the capture and estimation pipeline.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod effects;
pub mod error;
pub mod mapping;
pub mod render;
pub mod scene;
pub mod scheduler;
pub mod timeline;

pub use analysis::{
    resolve_tempo, BpmValue, SpectralFluxEstimator, TempoEstimator, TempoResolution, TempoSource,
};
#[cfg(feature = "live-input")]
pub use audio::CpalInput;
pub use audio::{
    click_track, AudioCaptureService, CaptureCancel, CaptureSession, FrameSink, InputBackend,
    NoInputDevice, SampleBuffer, SyntheticInput,
};
pub use config::{
    AppConfig, AudioConfig, CompositionMode, RetriggerPolicy, SceneConfig, SchedulerConfig,
};
pub use effects::{
    EffectHandle, EffectPool, EffectSet, LiveEffect, ParamSweep, TimeUniform, TriangleSweep,
};
pub use error::{BeatVizError, Result};
pub use mapping::{MappingMatrix, ParameterUpdate, PropertyTarget};
pub use render::RenderGraph;
pub use scene::{
    build_stage, Animations, BeatTarget, ContainerId, ImageRef, SceneRenderer, SpriteHandle, Stage,
};
pub use scheduler::{EffectScheduler, FrameReport, SchedulerState};
pub use timeline::{Clock, ClockTick, RenderTick, TimerHandle, TimerQueue, REFERENCE_FPS};
