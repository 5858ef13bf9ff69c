use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use beat_visualiser_core::{
    build_stage, click_track, resolve_tempo, AudioCaptureService, AudioConfig, BeatTarget, BeatVizError,
    BpmValue, CaptureSession, ContainerId, EffectHandle, EffectPool, EffectScheduler, EffectSet,
    FrameSink, InputBackend, NoInputDevice, RenderGraph, RenderTick, SceneConfig, SceneRenderer,
    SchedulerConfig, SchedulerState, SpectralFluxEstimator, Stage, TempoSource,
};

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn two_candidate_stage(renderer: &mut RenderGraph) -> (Stage, ContainerId, EffectPool) {
    let container = renderer.create_container("logo");
    let pool = EffectPool::new(
        EffectSet::new([EffectHandle::new("outline")]),
        vec![
            EffectSet::new([EffectHandle::new("a")]),
            EffectSet::new([EffectHandle::new("b")]),
        ],
    )
    .unwrap();
    let stage = Stage {
        targets: vec![BeatTarget {
            container,
            pool: pool.clone(),
        }],
        ..Stage::default()
    };
    (stage, container, pool)
}

fn is_base_or_single_transient(active: &EffectSet, pool: &EffectPool) -> bool {
    if active == pool.base() {
        return true;
    }
    let matching = pool
        .candidates()
        .iter()
        .filter(|candidate| {
            active.len() == pool.base().len() + candidate.len()
                && active.effects()[..pool.base().len()] == *pool.base().effects()
                && active.effects()[pool.base().len()..] == *candidate.effects()
        })
        .count();
    matching == 1
}

#[test]
fn eighty_bpm_beat_reverts_after_two_hundred_ms() {
    let mut renderer = RenderGraph::new();
    let (stage, logo, pool) = two_candidate_stage(&mut renderer);
    let config = SchedulerConfig {
        base_bpm: 80.0,
        transient_duration_ms: 200,
        ..SchedulerConfig::default()
    };
    let mut scheduler = EffectScheduler::new(config, renderer, stage)
        .unwrap()
        .with_seed(42);
    scheduler.start(ms(0));

    let report = scheduler.advance(ms(0));
    assert_eq!(report.beats, 1);
    assert!(matches!(
        scheduler.state(logo),
        Some(SchedulerState::TransientActive { .. })
    ));

    let report = scheduler.advance(ms(200));
    assert_eq!(report.reverts, 1);
    assert_eq!(scheduler.state(logo), Some(&SchedulerState::Idle));
    assert_eq!(scheduler.renderer().active_set(logo), Some(pool.base()));

    scheduler.advance(ms(749));
    assert_eq!(scheduler.state(logo), Some(&SchedulerState::Idle));

    let report = scheduler.advance(ms(750));
    assert_eq!(report.beats, 1);
    let active = scheduler.active_set(logo).unwrap();
    assert!(active != pool.base());
    assert!(is_base_or_single_transient(active, &pool));
}

#[test]
fn beat_interval_matches_tempo() {
    for bpm in [60.0, 80.0, 128.0, 174.0] {
        let mut renderer = RenderGraph::new();
        let (stage, _, _) = two_candidate_stage(&mut renderer);
        let config = SchedulerConfig {
            base_bpm: bpm,
            ..SchedulerConfig::default()
        };
        let mut scheduler = EffectScheduler::new(config, renderer, stage).unwrap();
        scheduler.start(ms(0));

        // 1 ms frames: every beat lands within one frame of its due time.
        let mut beat_frames = Vec::new();
        for frame in 0..5_000_u64 {
            if scheduler.advance(ms(frame)).beats > 0 {
                beat_frames.push(frame);
            }
        }
        let expected_ms = 60_000.0 / bpm;
        for (n, frame) in beat_frames.iter().enumerate() {
            let due = n as f64 * expected_ms;
            assert!((*frame as f64 - due).abs() <= 1.0, "{bpm} bpm: {beat_frames:?}");
        }
    }
}

#[test]
fn empty_pool_fails_before_any_clock_starts() {
    assert!(matches!(
        EffectPool::new(EffectSet::empty(), Vec::new()),
        Err(BeatVizError::EmptyEffectPool)
    ));

    let mut renderer = RenderGraph::new();
    renderer.create_container("logo");
    let err =
        EffectScheduler::new(SchedulerConfig::default(), renderer, Stage::default()).unwrap_err();
    assert!(matches!(err, BeatVizError::EmptyEffectPool));
}

#[test]
fn active_set_is_always_base_or_one_candidate() {
    let mut renderer = RenderGraph::new();
    let (stage, logo, pool) = two_candidate_stage(&mut renderer);
    let config = SchedulerConfig {
        base_bpm: 173.0,
        transient_duration_ms: 250,
        ..SchedulerConfig::default()
    };
    let mut scheduler = EffectScheduler::new(config, renderer, stage)
        .unwrap()
        .with_seed(3);
    scheduler.start(ms(0));

    // Irregular frame spacing, including stalls.
    let mut now = 0;
    for frame in 0..4_000_u64 {
        now += match frame % 7 {
            0 => 1,
            3 => 95,
            5 => 400,
            _ => 16,
        };
        scheduler.advance(ms(now));
        let active = scheduler.active_set(logo).unwrap();
        assert!(is_base_or_single_transient(active, &pool), "{active:?}");
        assert_eq!(scheduler.renderer().active_set(logo), Some(active));
        assert!(!active.is_empty());
    }
}

#[test]
fn every_candidate_gets_picked() {
    let mut renderer = RenderGraph::new();
    let container = renderer.create_container("logo");
    let candidates: Vec<EffectSet> = (0..4)
        .map(|index| EffectSet::new([EffectHandle::new(format!("fx-{index}"))]))
        .collect();
    let stage = Stage {
        targets: vec![BeatTarget {
            container,
            pool: EffectPool::new(EffectSet::empty(), candidates).unwrap(),
        }],
        ..Stage::default()
    };
    let mut scheduler = EffectScheduler::new(SchedulerConfig::default(), renderer, stage)
        .unwrap()
        .with_seed(11);
    scheduler.start(ms(0));

    let mut counts = [0_u32; 4];
    for beat in 0..4_000_u64 {
        scheduler.on_beat(ms(beat * 750));
        if let Some(SchedulerState::TransientActive { candidate, .. }) = scheduler.state(container)
        {
            counts[*candidate] += 1;
        }
    }
    // Expected 1000 each; the bound is far outside sampling noise.
    for count in counts {
        assert!((850..=1_150).contains(&count), "{counts:?}");
    }
}

#[test]
fn rotation_is_k_times_r_times_d() {
    let mut renderer = RenderGraph::new();
    let stage = build_stage(&mut renderer, &SceneConfig::default()).unwrap();
    let config = SchedulerConfig {
        rotation_speed_per_frame: 0.0005,
        ..SchedulerConfig::default()
    };
    let mut scheduler = EffectScheduler::new(config, renderer, stage).unwrap();
    scheduler.start(ms(0));

    for (k, d) in [(1_000_u32, 1.0), (50_000, 0.73)] {
        let before = scheduler.rotation();
        for frame in 0..k {
            scheduler.on_render_tick(RenderTick::from_delta(ms(u64::from(frame)), d));
        }
        let expected = (before + f64::from(k) * 0.0005 * d).rem_euclid(std::f64::consts::TAU);
        assert!(
            (scheduler.rotation() - expected).abs() < 1e-6,
            "{} vs {expected}",
            scheduler.rotation()
        );
    }
}

/// Hands over a full buffer of silence as soon as it is opened.
struct SilentInput {
    len: usize,
}

struct SilentSession;

impl CaptureSession for SilentSession {
    fn sample_rate(&self) -> u32 {
        22_050
    }

    fn stop(&mut self) -> beat_visualiser_core::Result<()> {
        Ok(())
    }
}

impl InputBackend for SilentInput {
    fn open(&self, sink: FrameSink) -> beat_visualiser_core::Result<Box<dyn CaptureSession>> {
        sink.prepare(22_050)?;
        sink.push(&vec![0.0; self.len]);
        Ok(Box::new(SilentSession))
    }
}

fn small_capture() -> AudioConfig {
    AudioConfig {
        buffer_len: 22_050 * 4,
        capture_duration_ms: 5_000,
        preferred_sample_rate: 22_050,
        ..AudioConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn failed_estimation_still_starts_the_beat_clock() {
    let config = small_capture();
    let mut capture = AudioCaptureService::new(
        SilentInput {
            len: config.buffer_len,
        },
        config,
    );
    let scheduler_config = SchedulerConfig::default();
    let fallback = BpmValue::new(scheduler_config.base_bpm).unwrap();

    let resolution = resolve_tempo(&mut capture, &SpectralFluxEstimator::new(), fallback)
        .await
        .unwrap();
    assert_eq!(resolution.bpm, fallback);
    assert!(matches!(resolution.source, TempoSource::Fallback(_)));

    let mut renderer = RenderGraph::new();
    let (stage, logo, _) = two_candidate_stage(&mut renderer);
    let mut scheduler = EffectScheduler::new(scheduler_config, renderer, stage).unwrap();
    scheduler.start(ms(0));
    scheduler.set_tempo(resolution.bpm).unwrap();

    assert!(scheduler.beat_clock().is_running());
    assert_eq!(scheduler.tempo().get(), 80.0);
    assert_eq!(scheduler.advance(ms(0)).beats, 1);
    assert!(matches!(
        scheduler.state(logo),
        Some(SchedulerState::TransientActive { .. })
    ));
    assert_eq!(scheduler.advance(ms(750)).beats, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_device_falls_back_to_the_configured_tempo() {
    let mut capture =
        AudioCaptureService::new(NoInputDevice::new("no microphone"), small_capture());
    let fallback = BpmValue::new(95.0).unwrap();

    let resolution = resolve_tempo(&mut capture, &SpectralFluxEstimator::new(), fallback)
        .await
        .unwrap();
    assert_eq!(resolution.bpm, fallback);
    match resolution.source {
        TempoSource::Fallback(reason) => assert!(reason.contains("no microphone"), "{reason}"),
        TempoSource::Detected => panic!("nothing was captured"),
    }
}

/// Device that is fed from the test, one callback's worth at a time.
#[derive(Clone, Default)]
struct FedInput {
    sink: Rc<RefCell<Option<FrameSink>>>,
    released: Rc<Cell<bool>>,
}

struct FedSession {
    released: Rc<Cell<bool>>,
}

impl CaptureSession for FedSession {
    fn sample_rate(&self) -> u32 {
        44_100
    }

    fn stop(&mut self) -> beat_visualiser_core::Result<()> {
        self.released.set(true);
        Ok(())
    }
}

impl InputBackend for FedInput {
    fn open(&self, sink: FrameSink) -> beat_visualiser_core::Result<Box<dyn CaptureSession>> {
        sink.prepare(44_100)?;
        *self.sink.borrow_mut() = Some(sink);
        Ok(Box::new(FedSession {
            released: self.released.clone(),
        }))
    }
}

impl FedInput {
    fn push(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.borrow().as_ref() {
            sink.push(samples);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn real_time_click_track_is_detected_with_default_settings() {
    let input = FedInput::default();
    let mut capture = AudioCaptureService::new(input.clone(), AudioConfig::default());
    let fallback = BpmValue::new(80.0).unwrap();
    let track = click_track(120.0, 44_100, 6.0);
    let mut chunks = track.chunks(441);

    let resolution = {
        let estimator = SpectralFluxEstimator::new();
        let pending = resolve_tempo(&mut capture, &estimator, fallback);
        tokio::pin!(pending);
        loop {
            tokio::select! {
                biased;
                result = &mut pending => break result,
                _ = tokio::time::sleep(ms(10)) => {
                    if let Some(chunk) = chunks.next() {
                        input.push(chunk);
                    }
                }
            }
        }
    }
    .unwrap();

    assert_eq!(resolution.source, TempoSource::Detected);
    assert!((resolution.bpm.get() - 120.0).abs() < 3.0, "{}", resolution.bpm);
    assert!(!capture.is_capturing());
    assert!(input.released.get());
}
