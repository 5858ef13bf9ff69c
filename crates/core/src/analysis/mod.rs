//! Tempo detection: from a captured [`SampleBuffer`] to a [`BpmValue`].

mod spectral;

use std::{fmt, future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    audio::{AudioCaptureService, InputBackend},
    BeatVizError, Result, SampleBuffer,
};

pub use spectral::SpectralFluxEstimator;

/// A tempo in beats per minute. Always strictly positive and finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct BpmValue(f64);

impl BpmValue {
    pub fn new(bpm: f64) -> Result<Self> {
        if bpm.is_finite() && bpm > 0.0 {
            Ok(Self(bpm))
        } else {
            Err(BeatVizError::InvalidTempo(bpm))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Beats per second, the rate a beat clock runs at.
    pub fn ticks_per_second(self) -> f64 {
        self.0 / 60.0
    }

    /// Time between two beats.
    pub fn period(self) -> Duration {
        Duration::from_secs_f64(60.0 / self.0)
    }
}

impl TryFrom<f64> for BpmValue {
    type Error = BeatVizError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BpmValue> for f64 {
    fn from(value: BpmValue) -> Self {
        value.0
    }
}

impl fmt::Display for BpmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} bpm", self.0)
    }
}

/// Turns a buffer of audio into a tempo. Implementations may fail with
/// [`BeatVizError::EstimationFailed`].
pub trait TempoEstimator {
    fn estimate(&self, buffer: SampleBuffer) -> impl Future<Output = Result<BpmValue>>;
}

/// Where the tempo handed to the beat clock came from.
#[derive(Debug, Clone, PartialEq)]
pub enum TempoSource {
    Detected,
    /// The live pipeline failed; the message says why.
    Fallback(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempoResolution {
    pub bpm: BpmValue,
    pub source: TempoSource,
}

/// Runs capture and estimation once, degrading to `fallback` on any audio or
/// estimation failure. Other errors (poisoned state, misuse) are returned.
/// Capture is stopped once the buffer has been taken.
pub async fn resolve_tempo<B, E>(
    capture: &mut AudioCaptureService<B>,
    estimator: &E,
    fallback: BpmValue,
) -> Result<TempoResolution>
where
    B: InputBackend,
    E: TempoEstimator,
{
    match detect_tempo(capture, estimator).await {
        Ok(bpm) => {
            tracing::info!(%bpm, "detected tempo");
            Ok(TempoResolution {
                bpm,
                source: TempoSource::Detected,
            })
        }
        Err(err) if err.falls_back_to_default_tempo() => {
            tracing::warn!(error = %err, %fallback, "live tempo unavailable, using default");
            Ok(TempoResolution {
                bpm: fallback,
                source: TempoSource::Fallback(err.to_string()),
            })
        }
        Err(err) => Err(err),
    }
}

async fn detect_tempo<B, E>(capture: &mut AudioCaptureService<B>, estimator: &E) -> Result<BpmValue>
where
    B: InputBackend,
    E: TempoEstimator,
{
    if !capture.is_initialized() {
        capture.initialize().await?;
    }
    // One buffer is all the pipeline needs; the device is released as soon as
    // it is in hand.
    let buffer = capture.get_buffer().await;
    capture.stop();
    estimator.estimate(buffer?).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{audio::tests::ManualInput, AudioConfig};

    #[test]
    fn rejects_non_positive_tempo() {
        for value in [0.0, -1.0, -120.0, f64::NAN, f64::INFINITY] {
            let err = BpmValue::new(value).unwrap_err();
            assert!(matches!(err, BeatVizError::InvalidTempo(_)));
        }
    }

    #[test]
    fn converts_to_clock_rate() {
        let bpm = BpmValue::new(80.0).unwrap();
        assert!((bpm.ticks_per_second() - 80.0 / 60.0).abs() < 1e-12);
        assert_eq!(bpm.period(), Duration::from_millis(750));
    }

    #[test]
    fn period_matches_sixty_over_bpm() {
        for value in [1.0, 47.5, 90.0, 128.0, 174.0, 300.0] {
            let bpm = BpmValue::new(value).unwrap();
            let expected = 60.0 / value;
            assert!((bpm.period().as_secs_f64() - expected).abs() < 1e-9);
        }
    }

    struct FixedEstimate(f64);

    impl TempoEstimator for FixedEstimate {
        async fn estimate(&self, buffer: SampleBuffer) -> Result<BpmValue> {
            assert!(!buffer.is_empty());
            BpmValue::new(self.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_releases_the_device_once_it_has_a_buffer() {
        let input = ManualInput::default();
        let config = AudioConfig {
            buffer_len: 4,
            ..AudioConfig::default()
        };
        let mut capture = AudioCaptureService::new(input.clone(), config);
        capture.initialize().await.unwrap();
        input.push(&[0.1, 0.2, 0.3, 0.4]);

        let fallback = BpmValue::new(80.0).unwrap();
        let resolution = resolve_tempo(&mut capture, &FixedEstimate(126.0), fallback)
            .await
            .unwrap();
        assert_eq!(resolution.bpm.get(), 126.0);
        assert_eq!(resolution.source, TempoSource::Detected);
        assert!(!capture.is_capturing());
        assert!(input.released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_estimate_falls_back() {
        let input = ManualInput::default();
        let config = AudioConfig {
            buffer_len: 2,
            ..AudioConfig::default()
        };
        let mut capture = AudioCaptureService::new(input.clone(), config);
        capture.initialize().await.unwrap();
        input.push(&[0.5, 0.5]);

        let fallback = BpmValue::new(80.0).unwrap();
        let resolution = resolve_tempo(&mut capture, &FixedEstimate(-3.0), fallback)
            .await
            .unwrap();
        assert_eq!(resolution.bpm, fallback);
        assert!(matches!(resolution.source, TempoSource::Fallback(_)));
    }

    #[test]
    fn deserialisation_enforces_positive_tempo() {
        let ok: BpmValue = serde_json::from_str("96.0").unwrap();
        assert_eq!(ok.get(), 96.0);
        assert!(serde_json::from_str::<BpmValue>("0.0").is_err());
    }
}
