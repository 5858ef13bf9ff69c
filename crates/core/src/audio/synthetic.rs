use std::{
    f32::consts::PI,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{BeatVizError, BpmValue, Result};

use super::{CaptureSession, FrameSink, InputBackend};

const CLICK_HZ: f32 = 880.0;
const CLICK_DECAY_SECONDS: f32 = 0.008;
const CLICK_LENGTH_SECONDS: f32 = 0.03;
const CLICK_GAIN: f32 = 0.8;

/// Sample `index` of an endless click track with one click per
/// `period_samples`.
fn click_sample(index: u64, period_samples: f64, sample_rate: u32) -> f32 {
    let offset = (index as f64 % period_samples) as f32 / sample_rate as f32;
    if offset >= CLICK_LENGTH_SECONDS {
        return 0.0;
    }
    (2.0 * PI * CLICK_HZ * offset).sin() * (-offset / CLICK_DECAY_SECONDS).exp() * CLICK_GAIN
}

/// Renders `seconds` of a metronome click at `bpm`.
pub fn click_track(bpm: f64, sample_rate: u32, seconds: f32) -> Vec<f32> {
    let period_samples = sample_rate as f64 * 60.0 / bpm;
    let len = (seconds * sample_rate as f32) as u64;
    (0..len)
        .map(|index| click_sample(index, period_samples, sample_rate))
        .collect()
}

/// Input that plays a click track in real time on a worker thread.
///
/// Stands in for a microphone on machines without one.
#[derive(Debug, Clone)]
pub struct SyntheticInput {
    bpm: BpmValue,
    sample_rate: u32,
    block_len: usize,
}

impl SyntheticInput {
    pub fn new(bpm: BpmValue, sample_rate: u32) -> Self {
        Self {
            bpm,
            sample_rate,
            block_len: 1024,
        }
    }
}

impl InputBackend for SyntheticInput {
    fn open(&self, sink: FrameSink) -> Result<Box<dyn CaptureSession>> {
        if self.sample_rate == 0 {
            return Err(BeatVizError::DeviceUnavailable(
                "synthetic input needs a sample rate".to_string(),
            ));
        }
        sink.prepare(self.sample_rate)?;
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let period_samples = self.sample_rate as f64 * 60.0 / self.bpm.get();
        let sample_rate = self.sample_rate;
        let block_len = self.block_len;
        let block_time = Duration::from_secs_f64(block_len as f64 / sample_rate as f64);

        let worker = thread::Builder::new()
            .name("synthetic-input".to_string())
            .spawn(move || {
                let mut block = vec![0.0_f32; block_len];
                let mut index = 0_u64;
                while worker_running.load(Ordering::Acquire) && sink.is_open() {
                    for slot in block.iter_mut() {
                        *slot = click_sample(index, period_samples, sample_rate);
                        index += 1;
                    }
                    sink.push(&block);
                    thread::sleep(block_time);
                }
            })
            .map_err(|err| BeatVizError::DeviceUnavailable(err.to_string()))?;

        tracing::debug!(bpm = %self.bpm, sample_rate, "synthetic input started");
        Ok(Box::new(SyntheticSession {
            running,
            worker: Some(worker),
            sample_rate,
        }))
    }
}

struct SyntheticSession {
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    sample_rate: u32,
}

impl CaptureSession for SyntheticSession {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| BeatVizError::msg("synthetic input thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
