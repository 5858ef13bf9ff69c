use std::{path::PathBuf, pin::pin, time::Duration};

use beat_visualiser_core::{
    build_stage, resolve_tempo, AppConfig, AudioCaptureService, AudioConfig, BeatVizError,
    BpmValue, CaptureSession, EffectScheduler, FrameSink, InputBackend, NoInputDevice, RenderGraph,
    SpectralFluxEstimator, SyntheticInput,
};
use clap::{Args, Parser, Subcommand};
use tokio::time::{Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

fn main() -> beat_visualiser_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    match cli.command {
        Commands::Live(args) => runtime.block_on(run_live(args)),
        Commands::Tempo(input) => runtime.block_on(run_tempo(input)),
    }
}

async fn run_live(args: LiveArgs) -> beat_visualiser_core::Result<()> {
    if !(args.fps.is_finite() && args.fps > 0.0) {
        return Err(BeatVizError::InvalidConfig(format!(
            "frame rate must be positive, got {}",
            args.fps
        )));
    }
    if !(args.seconds.is_finite() && args.seconds >= 0.0) {
        return Err(BeatVizError::InvalidConfig(format!(
            "run time must be non-negative, got {}",
            args.seconds
        )));
    }

    let config = load_config(args.input.config.as_deref())?;
    tracing::info!(fps = args.fps, seconds = args.seconds, "starting live mode");

    let mut renderer = RenderGraph::new();
    let stage = build_stage(&mut renderer, &config.scene)?;
    let mut scheduler = EffectScheduler::new(config.scheduler.clone(), renderer, stage)?;
    if let Some(seed) = args.seed {
        scheduler = scheduler.with_seed(seed);
    }
    let fallback = scheduler.tempo();

    let input = select_input(&args.input, &config.audio)?;
    let mut capture = AudioCaptureService::new(input, config.audio.clone());
    let estimator = SpectralFluxEstimator::new();

    let origin = Instant::now();
    let end = origin + Duration::from_secs_f64(args.seconds);
    scheduler.start(Duration::ZERO);

    let mut frames = tokio::time::interval(Duration::from_secs_f64(1.0 / args.fps));
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tempo = pin!(resolve_tempo(&mut capture, &estimator, fallback));
    let mut tempo_pending = true;
    let mut beats = 0_u64;

    loop {
        tokio::select! {
            resolution = &mut tempo, if tempo_pending => {
                tempo_pending = false;
                let resolution = resolution?;
                tracing::info!(bpm = %resolution.bpm, source = ?resolution.source, "tempo resolved");
                scheduler.set_tempo(resolution.bpm)?;
            }
            at = frames.tick() => {
                if at >= end {
                    break;
                }
                let report = scheduler.advance(at - origin);
                scheduler.renderer_mut().draw()?;
                beats += u64::from(report.beats);
                if report.missed_beats > 0 {
                    tracing::debug!(missed = report.missed_beats, "frame loop fell behind the beat");
                }
            }
        }
    }

    scheduler.stop();
    tracing::info!(
        frames = scheduler.renderer().frames(),
        beats,
        bpm = %scheduler.tempo(),
        "live mode finished"
    );
    Ok(())
}

async fn run_tempo(args: InputArgs) -> beat_visualiser_core::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let fallback = BpmValue::new(config.scheduler.base_bpm)?;
    let input = select_input(&args, &config.audio)?;
    let mut capture = AudioCaptureService::new(input, config.audio.clone());

    let resolution = resolve_tempo(&mut capture, &SpectralFluxEstimator::new(), fallback).await?;
    capture.stop();
    println!("{} ({:?})", resolution.bpm, resolution.source);
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> beat_visualiser_core::Result<AppConfig> {
    let config = match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Picks the capture backend: a synthetic click track when asked for, the
/// default input device otherwise.
fn select_input(args: &InputArgs, audio: &AudioConfig) -> beat_visualiser_core::Result<Input> {
    if let Some(bpm) = args.synthetic_bpm {
        let bpm = BpmValue::new(bpm)?;
        return Ok(Input::Synthetic(SyntheticInput::new(
            bpm,
            audio.preferred_sample_rate,
        )));
    }

    #[cfg(feature = "live-input")]
    let input = Input::Device(beat_visualiser_core::CpalInput::new());
    #[cfg(not(feature = "live-input"))]
    let input = Input::Missing(NoInputDevice::new(
        "built without the live-input feature",
    ));
    Ok(input)
}

enum Input {
    Synthetic(SyntheticInput),
    #[cfg(feature = "live-input")]
    Device(beat_visualiser_core::CpalInput),
    #[allow(dead_code)]
    Missing(NoInputDevice),
}

impl InputBackend for Input {
    fn open(&self, sink: FrameSink) -> beat_visualiser_core::Result<Box<dyn CaptureSession>> {
        match self {
            Input::Synthetic(input) => input.open(sink),
            #[cfg(feature = "live-input")]
            Input::Device(input) => input.open(sink),
            Input::Missing(input) => input.open(sink),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised effect visualiser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler headlessly while the tempo is detected.
    Live(LiveArgs),
    /// Capture a few seconds of audio and print the detected tempo.
    Tempo(InputArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// JSON configuration file. Missing fields take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listen to a synthetic click track at this tempo instead of a device.
    #[arg(long)]
    synthetic_bpm: Option<f64>,
}

#[derive(Args, Debug)]
struct LiveArgs {
    #[command(flatten)]
    input: InputArgs,
    /// Frames per second of the render loop.
    #[arg(long, default_value_t = 60.0)]
    fps: f64,
    /// How long to run before exiting.
    #[arg(long, default_value_t = 10.0)]
    seconds: f64,
    /// Seed for effect selection.
    #[arg(long)]
    seed: Option<u64>,
}
