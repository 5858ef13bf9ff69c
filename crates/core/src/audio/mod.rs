use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::{sync::watch, time::Instant};

use crate::{AudioConfig, BeatVizError, Result};

#[cfg(feature = "live-input")]
mod cpal_input;
mod synthetic;

#[cfg(feature = "live-input")]
pub use cpal_input::CpalInput;
pub use synthetic::{click_track, SyntheticInput};

/// Fixed-capacity block of mono samples.
///
/// The length is set at construction; writes only ever fill existing slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    samples: Box<[f32]>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Creates a zeroed buffer holding `len` samples.
    pub fn new(len: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; len].into_boxed_slice(),
            sample_rate,
        }
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// Copies as much of `data` as fits starting at `offset` and returns the
    /// number of samples written.
    pub fn write(&mut self, offset: usize, data: &[f32]) -> usize {
        let Some(free) = self.samples.get_mut(offset..) else {
            return 0;
        };
        let count = free.len().min(data.len());
        free[..count].copy_from_slice(&data[..count]);
        count
    }

    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }
}

/// Opens capture sessions on some audio input.
pub trait InputBackend {
    /// Starts delivering samples into `sink`. Failure to reach a device must be
    /// reported as [`BeatVizError::DeviceUnavailable`].
    fn open(&self, sink: FrameSink) -> Result<Box<dyn CaptureSession>>;
}

/// A live hardware (or simulated) capture session. Dropping it releases the
/// device as well.
pub trait CaptureSession {
    fn sample_rate(&self) -> u32;

    fn stop(&mut self) -> Result<()>;
}

/// Backend for hosts without any input device.
#[derive(Debug, Clone, Default)]
pub struct NoInputDevice {
    reason: Option<String>,
}

impl NoInputDevice {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

impl InputBackend for NoInputDevice {
    fn open(&self, _sink: FrameSink) -> Result<Box<dyn CaptureSession>> {
        Err(BeatVizError::DeviceUnavailable(
            self.reason
                .clone()
                .unwrap_or_else(|| "no audio input device".to_string()),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CapturePhase {
    Idle,
    Capturing,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
struct CaptureStatus {
    phase: CapturePhase,
    /// Number of times the buffer has been filled end to end.
    cycles: u64,
}

#[derive(Debug)]
struct CaptureRing {
    buffer: SampleBuffer,
    cursor: usize,
}

impl CaptureRing {
    /// Writes `samples`, wrapping at the end of the buffer. Returns how many
    /// times the buffer was completed.
    fn write(&mut self, mut samples: &[f32]) -> u64 {
        let capacity = self.buffer.len();
        if capacity == 0 {
            return 0;
        }
        let mut completed = 0;
        while !samples.is_empty() {
            let written = self.buffer.write(self.cursor, samples);
            self.cursor += written;
            samples = &samples[written..];
            if self.cursor == capacity {
                self.cursor = 0;
                completed += 1;
            }
        }
        completed
    }

    /// Copy of the buffer with the oldest sample first.
    fn snapshot(&self) -> SampleBuffer {
        let samples = self.buffer.as_slice();
        let mut ordered = Vec::with_capacity(samples.len());
        ordered.extend_from_slice(&samples[self.cursor..]);
        ordered.extend_from_slice(&samples[..self.cursor]);
        SampleBuffer::from_samples(ordered, self.buffer.sample_rate())
    }
}

#[derive(Debug)]
struct CaptureShared {
    config: AudioConfig,
    /// End of the capture window, set once the device is open.
    deadline: OnceLock<Instant>,
    ring: Mutex<CaptureRing>,
    status: watch::Sender<CaptureStatus>,
}

impl CaptureShared {
    fn lock_ring(&self) -> Result<MutexGuard<'_, CaptureRing>> {
        self.ring
            .lock()
            .map_err(|_| BeatVizError::msg("capture buffer has been poisoned"))
    }

    /// Sizes the buffer for a device running at `sample_rate`. Once samples
    /// have been written only the recorded rate changes.
    fn prepare(&self, sample_rate: u32) -> Result<()> {
        let mut ring = self.lock_ring()?;
        let untouched = ring.cursor == 0 && self.status.borrow().cycles == 0;
        if untouched {
            ring.buffer = SampleBuffer::new(self.config.window_len(sample_rate), sample_rate);
        } else if ring.buffer.sample_rate() != sample_rate {
            tracing::warn!(
                recorded = ring.buffer.sample_rate(),
                device = sample_rate,
                "sample rate changed after capture began"
            );
            ring.buffer.set_sample_rate(sample_rate);
        }
        Ok(())
    }

    fn phase(&self) -> CapturePhase {
        self.status.borrow().phase.clone()
    }

    fn past_deadline(&self) -> bool {
        self.deadline
            .get()
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }

    /// Moves to `Stopped` unless the session already ended.
    fn mark_stopped(&self) -> bool {
        self.status.send_if_modified(|status| match status.phase {
            CapturePhase::Idle | CapturePhase::Capturing => {
                status.phase = CapturePhase::Stopped;
                true
            }
            _ => false,
        })
    }
}

/// Write end of a capture session, handed to the [`InputBackend`].
///
/// Safe to call from the device's own thread. Samples pushed once the session
/// is no longer capturing are dropped. The first push past the time bound ends
/// the session; the device itself is released by the owning service.
#[derive(Debug, Clone)]
pub struct FrameSink {
    shared: Arc<CaptureShared>,
}

impl FrameSink {
    /// Sizes the capture buffer for the device's actual rate. Backends call
    /// this before their first [`push`](Self::push).
    pub fn prepare(&self, sample_rate: u32) -> Result<()> {
        self.shared.prepare(sample_rate)
    }

    /// Appends mono samples to the capture buffer, overwriting the oldest.
    pub fn push(&self, samples: &[f32]) {
        if !self.is_open() || samples.is_empty() {
            return;
        }
        if self.shared.past_deadline() {
            if self.shared.mark_stopped() {
                tracing::info!("audio capture time bound reached on the input thread");
            }
            return;
        }
        let completed = match self.shared.lock_ring() {
            Ok(mut ring) => ring.write(samples),
            Err(err) => {
                self.fail(err.to_string());
                return;
            }
        };
        if completed > 0 {
            self.shared
                .status
                .send_modify(|status| status.cycles += completed);
        }
    }

    /// Ends the session with a device error.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let failed = self.shared.status.send_if_modified(|status| {
            if status.phase == CapturePhase::Capturing {
                status.phase = CapturePhase::Failed(reason.clone());
                true
            } else {
                false
            }
        });
        if failed {
            tracing::error!(%reason, "audio capture failed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.phase() == CapturePhase::Capturing
    }
}

/// Stops a capture session from outside the task that owns it.
///
/// The owning [`AudioCaptureService`] releases the device as soon as it
/// observes the cancellation, or when it is dropped.
#[derive(Debug, Clone)]
pub struct CaptureCancel {
    shared: Arc<CaptureShared>,
}

impl CaptureCancel {
    pub fn cancel(&self) {
        if self.shared.mark_stopped() {
            tracing::debug!("audio capture cancelled");
        }
    }
}

/// Records a single reusable buffer from an input device.
///
/// Incoming samples overwrite the oldest ones; there is no queueing. Capture
/// ends on [`stop`](Self::stop), on cancellation, on a device error, or once
/// the configured duration has elapsed since [`initialize`](Self::initialize).
pub struct AudioCaptureService<B> {
    backend: B,
    config: AudioConfig,
    shared: Arc<CaptureShared>,
    session: Option<Box<dyn CaptureSession>>,
    deadline: Option<Instant>,
}

impl<B: InputBackend> AudioCaptureService<B> {
    pub fn new(backend: B, config: AudioConfig) -> Self {
        let ring = CaptureRing {
            buffer: SampleBuffer::new(
                config.window_len(config.preferred_sample_rate),
                config.preferred_sample_rate,
            ),
            cursor: 0,
        };
        let (status, _) = watch::channel(CaptureStatus {
            phase: CapturePhase::Idle,
            cycles: 0,
        });
        let shared = Arc::new(CaptureShared {
            config: config.clone(),
            deadline: OnceLock::new(),
            ring: Mutex::new(ring),
            status,
        });
        Self {
            backend,
            config,
            shared,
            session: None,
            deadline: None,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.deadline.is_some()
    }

    /// `true` while the device is delivering samples.
    pub fn is_capturing(&self) -> bool {
        self.session.is_some() && self.shared.phase() == CapturePhase::Capturing
    }

    pub fn cancel_handle(&self) -> CaptureCancel {
        CaptureCancel {
            shared: self.shared.clone(),
        }
    }

    /// Opens the input device and starts filling the buffer.
    ///
    /// Initialising twice is a no-op. A session that has already ended cannot
    /// be restarted.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.shared.phase() {
            CapturePhase::Idle => {}
            CapturePhase::Capturing => return Ok(()),
            CapturePhase::Stopped => {
                return Err(BeatVizError::DeviceUnavailable(
                    "capture session has already ended".to_string(),
                ))
            }
            CapturePhase::Failed(reason) => return Err(BeatVizError::DeviceUnavailable(reason)),
        }

        self.shared
            .status
            .send_modify(|status| status.phase = CapturePhase::Capturing);
        let sink = FrameSink {
            shared: self.shared.clone(),
        };
        let session = match self.backend.open(sink) {
            Ok(session) => session,
            Err(err) => {
                let err = match err {
                    BeatVizError::DeviceUnavailable(_) => err,
                    other => BeatVizError::DeviceUnavailable(other.to_string()),
                };
                self.shared
                    .status
                    .send_modify(|status| status.phase = CapturePhase::Failed(err.to_string()));
                return Err(err);
            }
        };

        let sample_rate = session.sample_rate();
        self.shared.prepare(sample_rate)?;
        self.session = Some(session);
        let deadline = Instant::now() + self.config.capture_duration();
        let _ = self.shared.deadline.set(deadline);
        self.deadline = Some(deadline);
        tracing::info!(
            sample_rate,
            window_len = self.config.window_len(sample_rate),
            duration_ms = self.config.capture_duration_ms,
            "audio capture started"
        );
        Ok(())
    }

    /// Resolves with the buffer once it has been filled end to end at least
    /// once. Later calls return the latest contents immediately, even after
    /// capture has ended.
    pub async fn get_buffer(&mut self) -> Result<SampleBuffer> {
        let deadline = self
            .deadline
            .ok_or_else(|| BeatVizError::msg("audio capture has not been initialised"))?;
        let mut status = self.shared.status.subscribe();

        loop {
            if Instant::now() >= deadline {
                self.stop();
            }

            let current = status.borrow_and_update().clone();
            if current.cycles > 0 {
                if current.phase != CapturePhase::Capturing {
                    self.release();
                }
                return Ok(self.shared.lock_ring()?.snapshot());
            }
            match current.phase {
                CapturePhase::Failed(reason) => {
                    self.release();
                    return Err(BeatVizError::DeviceUnavailable(reason));
                }
                CapturePhase::Stopped => {
                    self.release();
                    return Err(BeatVizError::CaptureStopped);
                }
                CapturePhase::Idle | CapturePhase::Capturing => {}
            }

            tokio::select! {
                changed = status.changed() => {
                    changed.map_err(|_| BeatVizError::msg("capture status channel closed"))?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("audio capture time bound reached");
                    self.stop();
                }
            }
        }
    }

    /// Ends capture and releases the device. The buffer keeps its contents.
    pub fn stop(&mut self) {
        if self.shared.mark_stopped() {
            tracing::info!("audio capture stopped");
        }
        self.release();
    }
}

impl<B> AudioCaptureService<B> {
    fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.stop() {
                tracing::warn!(error = %err, "failed to release audio input");
            }
        }
    }
}

impl<B> Drop for AudioCaptureService<B> {
    fn drop(&mut self) {
        self.shared.mark_stopped();
        self.release();
    }
}

impl<B> std::fmt::Debug for AudioCaptureService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureService")
            .field("config", &self.config)
            .field("phase", &self.shared.phase())
            .field("session", &self.session.is_some())
            .finish()
    }
}
