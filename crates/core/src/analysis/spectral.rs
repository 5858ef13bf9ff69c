use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{BeatVizError, BpmValue, Result, SampleBuffer, TempoEstimator};

const FRAME_SIZE: usize = 1024;
const HOP_SIZE: usize = 512;
const SILENCE_RMS: f32 = 1e-4;
const PEAK_RADIUS: usize = 3;
const THRESHOLD_RADIUS: usize = 8;
const THRESHOLD_GAIN: f32 = 1.5;
/// Peaks below this fraction of the strongest novelty value are ignored.
const PEAK_FLOOR: f32 = 0.2;
const MIN_ONSET_GAP_SECONDS: f32 = 0.1;
const MIN_ONSETS: usize = 4;
/// Intervals further than this from the median are treated as outliers.
const INTERVAL_TOLERANCE: f32 = 0.15;

/// Onset-based tempo estimator.
///
/// Computes a spectral flux novelty curve over overlapping Hann-windowed
/// frames, picks onsets above a local adaptive threshold, and converts the
/// typical inter-onset interval to beats per minute, folded by octaves into
/// the configured range.
#[derive(Clone)]
pub struct SpectralFluxEstimator {
    min_bpm: f64,
    max_bpm: f64,
}

impl Default for SpectralFluxEstimator {
    fn default() -> Self {
        Self {
            min_bpm: 60.0,
            max_bpm: 180.0,
        }
    }
}

impl SpectralFluxEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts results to `min_bpm..=max_bpm`. The range has to span at
    /// least one octave for folding to always land inside it.
    pub fn with_range(min_bpm: f64, max_bpm: f64) -> Result<Self> {
        let min = BpmValue::new(min_bpm)?.get();
        let max = BpmValue::new(max_bpm)?.get();
        if max < min * 2.0 {
            return Err(BeatVizError::InvalidConfig(format!(
                "tempo range {min}..={max} must span at least one octave"
            )));
        }
        Ok(Self {
            min_bpm: min,
            max_bpm: max,
        })
    }

    /// Synchronous core of [`TempoEstimator::estimate`].
    pub fn analyse(&self, samples: &[f32], sample_rate: u32) -> Result<BpmValue> {
        if sample_rate == 0 {
            return Err(failed("buffer has no sample rate"));
        }
        if samples.len() < FRAME_SIZE * 8 {
            return Err(failed("buffer is too short to contain a beat"));
        }
        if compute_rms(samples) < SILENCE_RMS {
            return Err(failed("buffer is silent"));
        }

        let novelty = NoveltyCurve::new(FRAME_SIZE).compute(samples)?;
        let hop_seconds = HOP_SIZE as f32 / sample_rate as f32;
        let onsets = pick_onsets(&novelty, hop_seconds);
        if onsets.len() < MIN_ONSETS {
            return Err(failed(format!(
                "found {} onsets, need at least {MIN_ONSETS}",
                onsets.len()
            )));
        }

        let intervals: Vec<f32> = onsets
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) as f32 * hop_seconds)
            .collect();
        let interval = typical_interval(&intervals)
            .ok_or_else(|| failed("onsets do not form a regular pulse"))?;

        let bpm = self.fold(60.0 / interval as f64);
        tracing::debug!(onsets = onsets.len(), interval, bpm, "estimated tempo");
        BpmValue::new(bpm)
    }

    fn fold(&self, mut bpm: f64) -> f64 {
        while bpm < self.min_bpm {
            bpm *= 2.0;
        }
        while bpm > self.max_bpm {
            bpm /= 2.0;
        }
        bpm
    }
}

impl TempoEstimator for SpectralFluxEstimator {
    async fn estimate(&self, buffer: SampleBuffer) -> Result<BpmValue> {
        self.analyse(buffer.as_slice(), buffer.sample_rate())
    }
}

impl fmt::Debug for SpectralFluxEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralFluxEstimator")
            .field("min_bpm", &self.min_bpm)
            .field("max_bpm", &self.max_bpm)
            .finish()
    }
}

struct NoveltyCurve {
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    window: Vec<f32>,
}

impl NoveltyCurve {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        Self {
            input: plan.make_input_vec(),
            spectrum: plan.make_output_vec(),
            scratch: plan.make_scratch_vec(),
            window: (0..size).map(|index| hann_value(index, size)).collect(),
            plan,
        }
    }

    /// Half-wave rectified spectral flux, one value per hop.
    fn compute(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let size = self.window.len();
        let mut previous = vec![0.0_f32; self.spectrum.len()];
        let mut novelty = Vec::with_capacity(samples.len() / HOP_SIZE);

        for start in (0..=samples.len() - size).step_by(HOP_SIZE) {
            let frame = &samples[start..start + size];
            for ((slot, sample), weight) in self.input.iter_mut().zip(frame).zip(&self.window) {
                *slot = sample * weight;
            }
            self.plan
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
                .map_err(|err| failed(format!("fft failed: {err}")))?;

            let mut flux = 0.0;
            for (bin, last) in self.spectrum.iter().zip(previous.iter_mut()) {
                let magnitude = bin.norm();
                flux += (magnitude - *last).max(0.0);
                *last = magnitude;
            }
            novelty.push(flux);
        }

        // The first frame rises from an all-zero spectrum.
        if let Some(first) = novelty.first_mut() {
            *first = 0.0;
        }
        Ok(novelty)
    }
}

/// Returns frame indices of novelty peaks.
fn pick_onsets(novelty: &[f32], hop_seconds: f32) -> Vec<usize> {
    let strongest = novelty.iter().copied().fold(0.0_f32, f32::max);
    if strongest <= f32::EPSILON {
        return Vec::new();
    }
    let floor = strongest * PEAK_FLOOR;
    let min_gap = (MIN_ONSET_GAP_SECONDS / hop_seconds).ceil() as usize;

    let mut onsets: Vec<usize> = Vec::new();
    for (index, &value) in novelty.iter().enumerate() {
        if value < floor {
            continue;
        }
        let local = &novelty[index.saturating_sub(THRESHOLD_RADIUS)
            ..(index + THRESHOLD_RADIUS + 1).min(novelty.len())];
        let mean = local.iter().sum::<f32>() / local.len() as f32;
        if value < mean * THRESHOLD_GAIN {
            continue;
        }
        let neighbourhood = &novelty
            [index.saturating_sub(PEAK_RADIUS)..(index + PEAK_RADIUS + 1).min(novelty.len())];
        if neighbourhood.iter().any(|&other| other > value) {
            continue;
        }
        if onsets.last().is_some_and(|&last| index - last < min_gap) {
            continue;
        }
        onsets.push(index);
    }
    onsets
}

/// Mean of the intervals close to the median interval.
fn typical_interval(intervals: &[f32]) -> Option<f32> {
    let mut sorted = intervals.to_vec();
    sorted.sort_by(f32::total_cmp);
    let median = *sorted.get(sorted.len() / 2)?;
    if median <= 0.0 {
        return None;
    }

    let inliers: Vec<f32> = sorted
        .into_iter()
        .filter(|interval| ((interval - median) / median).abs() <= INTERVAL_TOLERANCE)
        .collect();
    if inliers.len() < MIN_ONSETS - 1 {
        return None;
    }
    Some(inliers.iter().sum::<f32>() / inliers.len() as f32)
}

fn failed(reason: impl Into<String>) -> BeatVizError {
    BeatVizError::EstimationFailed(reason.into())
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::click_track;

    const RATE: u32 = 22_050;

    fn estimate(bpm: f64, seconds: f32) -> Result<BpmValue> {
        let samples = click_track(bpm, RATE, seconds);
        SpectralFluxEstimator::new().analyse(&samples, RATE)
    }

    #[test]
    fn detects_click_track_tempo() {
        let bpm = estimate(120.0, 10.0).unwrap();
        assert!((bpm.get() - 120.0).abs() < 3.0, "got {bpm}");
    }

    #[test]
    fn detects_slower_tempo() {
        let bpm = estimate(90.0, 12.0).unwrap();
        assert!((bpm.get() - 90.0).abs() < 3.0, "got {bpm}");
    }

    #[test]
    fn folds_fast_pulses_into_range() {
        let bpm = estimate(240.0, 8.0).unwrap();
        assert!((bpm.get() - 120.0).abs() < 3.0, "got {bpm}");
    }

    #[test]
    fn silence_fails() {
        let err = SpectralFluxEstimator::new()
            .analyse(&vec![0.0; RATE as usize * 5], RATE)
            .unwrap_err();
        assert!(matches!(err, BeatVizError::EstimationFailed(_)));
    }

    #[test]
    fn short_buffer_fails() {
        let err = SpectralFluxEstimator::new()
            .analyse(&[0.5; 2048], RATE)
            .unwrap_err();
        assert!(matches!(err, BeatVizError::EstimationFailed(_)));
    }

    #[test]
    fn too_few_onsets_fail() {
        let mut samples = click_track(120.0, RATE, 6.0);
        // Keep roughly two clicks.
        for sample in samples.iter_mut().skip(RATE as usize) {
            *sample = 0.0;
        }
        let err = SpectralFluxEstimator::new().analyse(&samples, RATE).unwrap_err();
        assert!(matches!(err, BeatVizError::EstimationFailed(_)));
    }

    #[test]
    fn range_must_span_an_octave() {
        assert!(SpectralFluxEstimator::with_range(90.0, 120.0).is_err());
        assert!(SpectralFluxEstimator::with_range(-1.0, 120.0).is_err());
        assert!(SpectralFluxEstimator::with_range(70.0, 140.0).is_ok());
    }
}
