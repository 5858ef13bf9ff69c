//! Beat-synchronised effect scheduling.
//!
//! Two clocks drive the scheduler. The render clock fires once per frame and
//! advances continuous animation. The beat clock fires at the tempo and swaps a
//! transient effect set onto each target container, with a one-shot timer
//! reverting it to the base set after a fixed duration.
//!
//! The host calls [`EffectScheduler::advance`] once per frame. Within one call
//! every due revert and beat is handled in timestamp order, each to
//! completion, followed by exactly one render tick.

use std::{f64::consts::TAU, time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    mapping::{MappingMatrix, ParameterUpdate, PropertyTarget},
    scene::{Animations, ContainerId, SceneRenderer, Stage},
    BeatVizError, BpmValue, Clock, EffectPool, EffectSet, RenderTick, Result, RetriggerPolicy,
    SchedulerConfig, TimerHandle, TimerQueue,
};

/// Effect state of one target container.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    /// Only the base set is shown.
    Idle,
    /// A transient set is shown until `revert_at`.
    TransientActive {
        /// Index into the pool's transient candidates.
        candidate: usize,
        active: EffectSet,
        revert_at: Duration,
    },
}

/// What happened during one [`EffectScheduler::advance`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub beats: u32,
    /// Overdue beats folded into a later one because the host stalled.
    pub missed_beats: u64,
    pub reverts: u32,
    pub render: Option<RenderTick>,
}

#[derive(Debug)]
struct ManagedContainer {
    container: ContainerId,
    pool: EffectPool,
    state: SchedulerState,
    pending_revert: Option<TimerHandle>,
}

/// Owns both clocks, the per-container state, and the renderer it pushes
/// effect assignments to.
pub struct EffectScheduler<R> {
    config: SchedulerConfig,
    renderer: R,
    targets: Vec<ManagedContainer>,
    animations: Animations,
    render_clock: Clock,
    beat_clock: Clock,
    timers: TimerQueue<usize>,
    rng: SmallRng,
    tempo: BpmValue,
    rotation: f64,
    updates: MappingMatrix,
    running: bool,
}

impl<R: SceneRenderer> EffectScheduler<R> {
    /// Validates the configuration. No clock runs until [`start`](Self::start).
    pub fn new(config: SchedulerConfig, renderer: R, stage: Stage) -> Result<Self> {
        if stage.targets.is_empty() || stage.targets.iter().any(|target| target.pool.is_empty()) {
            return Err(BeatVizError::EmptyEffectPool);
        }
        let tempo = BpmValue::new(config.base_bpm)?;
        if config.transient_duration_ms == 0 {
            return Err(BeatVizError::InvalidConfig(
                "transient duration must be greater than zero".to_string(),
            ));
        }

        let targets = stage
            .targets
            .into_iter()
            .map(|target| ManagedContainer {
                container: target.container,
                pool: target.pool,
                state: SchedulerState::Idle,
                pending_revert: None,
            })
            .collect();

        Ok(Self {
            config,
            renderer,
            targets,
            animations: stage.animations,
            render_clock: Clock::render(),
            beat_clock: Clock::beat(tempo),
            timers: TimerQueue::new(),
            rng: SmallRng::from_os_rng(),
            tempo,
            rotation: 0.0,
            updates: MappingMatrix::new(),
            running: false,
        })
    }

    /// Makes effect selection reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Shows the base sets and starts both clocks. The first beat is due at
    /// `now`.
    pub fn start(&mut self, now: Duration) {
        if self.running {
            return;
        }
        for target in &mut self.targets {
            target.state = SchedulerState::Idle;
            self.renderer
                .set_active_effect_set(target.container, target.pool.base());
        }
        self.render_clock.start(now);
        self.beat_clock.start(now);
        self.running = true;
        tracing::info!(
            bpm = %self.tempo,
            targets = self.targets.len(),
            transient_ms = self.config.transient_duration_ms,
            mode = ?self.config.composition_mode,
            "effect scheduler started"
        );
    }

    /// Stops both clocks and drops every pending revert. The renderer is not
    /// touched again.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.render_clock.stop();
        self.beat_clock.stop();
        self.timers.clear();
        for target in &mut self.targets {
            target.pending_revert = None;
        }
        tracing::info!("effect scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Handles everything due up to `now`, then renders one frame.
    pub fn advance(&mut self, now: Duration) -> FrameReport {
        let mut report = FrameReport::default();
        if !self.running {
            return report;
        }

        loop {
            // Overdue beats are coalesced, so the beat to order against is the
            // one `poll` will deliver, not the earliest one missed.
            let beat_at = self.beat_clock.peek(now);
            let revert_at = self.timers.next_deadline().filter(|due| *due <= now);
            match (revert_at, beat_at) {
                // A revert due at the same instant as a beat goes first, so the
                // beat's transient is not cut short.
                (Some(revert), Some(beat)) if revert <= beat => self.fire_revert(now, &mut report),
                (Some(_), None) => self.fire_revert(now, &mut report),
                (_, Some(_)) => {
                    if let Some(tick) = self.beat_clock.poll(now) {
                        if tick.missed > 0 {
                            tracing::debug!(missed = tick.missed, "folded overdue beats");
                        }
                        report.missed_beats += tick.missed;
                        report.beats += 1;
                        self.on_beat(tick.at);
                    }
                }
                (None, None) => break,
            }
        }

        if let Some(tick) = self.render_clock.tick(now) {
            self.on_render_tick(tick);
            report.render = Some(tick);
        }
        report
    }

    fn fire_revert(&mut self, now: Duration, report: &mut FrameReport) {
        if let Some((_, handle, index)) = self.timers.pop_due(now) {
            report.reverts += 1;
            self.on_revert(index, handle);
        }
    }

    /// Beat handler: picks a transient set for every target and arms its
    /// revert for `at + transient_duration`.
    pub fn on_beat(&mut self, at: Duration) {
        if !self.running {
            return;
        }
        let revert_at = at + self.config.transient_duration();
        for index in 0..self.targets.len() {
            let count = self.targets[index].pool.len();
            let candidate = select_index(&mut self.rng, count);

            let target = &mut self.targets[index];
            let Some(transient) = target.pool.candidate(candidate) else {
                continue;
            };
            let active = EffectSet::compose(
                target.pool.base(),
                transient,
                self.config.composition_mode,
            );

            if self.config.retrigger == RetriggerPolicy::CancelPending {
                if let Some(stale) = target.pending_revert.take() {
                    if self.timers.cancel(stale) {
                        tracing::trace!(container = ?target.container, "cancelled pending revert");
                    }
                }
            }
            target.pending_revert = Some(self.timers.arm(revert_at, index));

            self.renderer.set_active_effect_set(target.container, &active);
            tracing::debug!(
                container = ?target.container,
                candidate,
                effects = ?active,
                at_ms = at.as_millis() as u64,
                "beat applied transient effects"
            );
            target.state = SchedulerState::TransientActive {
                candidate,
                active,
                revert_at,
            };
        }
    }

    /// Revert handler. Resets the container to its base set whatever transient
    /// it currently shows.
    fn on_revert(&mut self, index: usize, handle: TimerHandle) {
        let Some(target) = self.targets.get_mut(index) else {
            return;
        };
        if target.pending_revert == Some(handle) {
            target.pending_revert = None;
        }
        target.state = SchedulerState::Idle;
        self.renderer
            .set_active_effect_set(target.container, target.pool.base());
        tracing::trace!(container = ?target.container, "reverted to base effects");
    }

    /// Render handler: rotation, time uniforms and live sweeps. Deltas are
    /// applied as given, whatever their size.
    pub fn on_render_tick(&mut self, tick: RenderTick) {
        if !self.running {
            return;
        }
        self.updates.clear();

        self.rotation =
            (self.rotation + tick.delta * self.config.rotation_speed_per_frame).rem_euclid(TAU);
        for sprite in &self.animations.rotating {
            self.updates.push(ParameterUpdate::new(
                PropertyTarget::Rotation(*sprite),
                self.rotation,
            ));
        }

        let elapsed = tick.elapsed.as_secs_f64();
        for uniform in &mut self.animations.uniforms {
            let value = uniform.advance(elapsed);
            self.updates
                .push(ParameterUpdate::effect_param(&uniform.effect, uniform.name, value));
        }

        for live in &mut self.animations.live_effects {
            for param in &mut live.sweeps {
                let value = param.sweep.advance(tick.delta);
                self.updates
                    .push(ParameterUpdate::effect_param(&live.effect, param.param, value));
            }
        }

        if !self.updates.is_empty() {
            self.renderer.apply_updates(self.updates.updates());
        }
    }

    /// Retimes the beat clock. Pending reverts keep their deadlines.
    pub fn set_tempo(&mut self, bpm: BpmValue) -> Result<()> {
        self.beat_clock.set_rate(bpm.ticks_per_second())?;
        tracing::info!(from = %self.tempo, to = %bpm, "beat clock retimed");
        self.tempo = bpm;
        Ok(())
    }

    pub fn tempo(&self) -> BpmValue {
        self.tempo
    }

    /// Current subject rotation in radians, in `[0, 2π)`.
    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn containers(&self) -> impl Iterator<Item = ContainerId> + '_ {
        self.targets.iter().map(|target| target.container)
    }

    pub fn state(&self, container: ContainerId) -> Option<&SchedulerState> {
        self.target(container).map(|target| &target.state)
    }

    /// The set the container shows right now.
    pub fn active_set(&self, container: ContainerId) -> Option<&EffectSet> {
        self.target(container).map(|target| match &target.state {
            SchedulerState::Idle => target.pool.base(),
            SchedulerState::TransientActive { active, .. } => active,
        })
    }

    pub fn pool(&self, container: ContainerId) -> Option<&EffectPool> {
        self.target(container).map(|target| &target.pool)
    }

    pub fn pending_reverts(&self) -> usize {
        self.timers.len()
    }

    pub fn beat_clock(&self) -> &Clock {
        &self.beat_clock
    }

    pub fn render_clock(&self) -> &Clock {
        &self.render_clock
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn into_renderer(self) -> R {
        self.renderer
    }

    fn target(&self, container: ContainerId) -> Option<&ManagedContainer> {
        self.targets
            .iter()
            .find(|target| target.container == container)
    }
}

/// `floor(random() * count)`, kept below `count` against rounding.
fn select_index(rng: &mut SmallRng, count: usize) -> usize {
    let scaled = (rng.random::<f64>() * count as f64).floor() as usize;
    scaled.min(count.saturating_sub(1))
}

impl<R> std::fmt::Debug for EffectScheduler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectScheduler")
            .field("config", &self.config)
            .field("targets", &self.targets)
            .field("tempo", &self.tempo)
            .field("rotation", &self.rotation)
            .field("pending_reverts", &self.timers.len())
            .field("running", &self.running)
            .finish()
    }
}
