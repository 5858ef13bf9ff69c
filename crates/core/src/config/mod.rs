use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{BeatVizError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub scheduler: SchedulerConfig,
    pub scene: SceneConfig,
}

impl AppConfig {
    /// Parses a (possibly partial) JSON document. Missing fields keep their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects values that can never produce a working pipeline.
    ///
    /// `base_bpm` is left alone here; it is checked when it is turned into a
    /// [`crate::BpmValue`].
    pub fn validate(&self) -> Result<()> {
        if self.audio.buffer_len == 0 {
            return Err(invalid("audio.buffer_len must be greater than zero"));
        }
        if self.audio.capture_duration_ms == 0 {
            return Err(invalid("audio.capture_duration_ms must be greater than zero"));
        }
        if self.audio.analysis_window_ms == 0
            || self.audio.analysis_window_ms >= self.audio.capture_duration_ms
        {
            return Err(invalid(
                "audio.analysis_window_ms must be non-zero and shorter than audio.capture_duration_ms",
            ));
        }
        if self.scheduler.transient_duration_ms == 0 {
            return Err(invalid("scheduler.transient_duration_ms must be greater than zero"));
        }
        if !self.scheduler.rotation_speed_per_frame.is_finite() {
            return Err(invalid("scheduler.rotation_speed_per_frame must be finite"));
        }
        if !self.scene.starfield_speed.is_finite() {
            return Err(invalid("scene.starfield_speed must be finite"));
        }
        let ratio = self.scene.logo_size_ratio;
        let ratio_in_range = ratio > 0.0 && ratio <= 1.0;
        if !ratio_in_range {
            return Err(invalid("scene.logo_size_ratio must lie in (0, 1]"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> BeatVizError {
    BeatVizError::InvalidConfig(reason.to_string())
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Upper bound on the number of mono samples held by the capture buffer.
    pub buffer_len: usize,
    /// Capture is stopped once this much time has passed since initialisation.
    pub capture_duration_ms: u64,
    /// Length of audio handed to the tempo estimator. The buffer is sized from
    /// this and the device's actual rate, so it fills before the time bound.
    pub analysis_window_ms: u64,
    /// Rate requested from backends that let the caller choose.
    pub preferred_sample_rate: u32,
}

impl AudioConfig {
    pub fn capture_duration(&self) -> Duration {
        Duration::from_millis(self.capture_duration_ms)
    }

    /// Capture buffer length for a device running at `sample_rate`.
    pub fn window_len(&self, sample_rate: u32) -> usize {
        let window = self.analysis_window_ms.saturating_mul(u64::from(sample_rate)) / 1_000;
        usize::try_from(window)
            .unwrap_or(usize::MAX)
            .min(self.buffer_len)
            .max(1)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            buffer_len: 240_000,
            capture_duration_ms: 5_000,
            analysis_window_ms: 4_000,
            preferred_sample_rate: 48_000,
        }
    }
}

/// How a transient effect set is combined with the base set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    /// The transient effects run after the base effects.
    #[default]
    Append,
    /// The transient effects are shown without the base effects.
    Replace,
}

/// What happens to a pending revert when the next beat lands before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetriggerPolicy {
    /// Cancel the pending revert and arm a fresh one.
    #[default]
    CancelPending,
    /// Leave every revert armed. The earliest one reverts the newer transient.
    Stack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tempo used until (or instead of) a detected one.
    pub base_bpm: f64,
    pub transient_duration_ms: u64,
    /// Radians added to the subject rotation per 60 Hz frame.
    pub rotation_speed_per_frame: f64,
    pub composition_mode: CompositionMode,
    pub retrigger: RetriggerPolicy,
}

impl SchedulerConfig {
    pub fn transient_duration(&self) -> Duration {
        Duration::from_millis(self.transient_duration_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_bpm: 80.0,
            transient_duration_ms: 200,
            rotation_speed_per_frame: 0.0005,
            composition_mode: CompositionMode::Append,
            retrigger: RetriggerPolicy::CancelPending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Logo edge length as a fraction of the stage width.
    pub logo_size_ratio: f32,
    /// Multiplier applied to elapsed seconds before feeding the starfield.
    pub starfield_speed: f32,
    pub background_image: String,
    pub logo_image: String,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            logo_size_ratio: 0.4,
            starfield_speed: 1.0,
            background_image: "background".to_string(),
            logo_image: "logo".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json_str(
            r#"{ "scheduler": { "base_bpm": 128.0, "composition_mode": "replace" } }"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.base_bpm, 128.0);
        assert_eq!(config.scheduler.composition_mode, CompositionMode::Replace);
        assert_eq!(config.scheduler.transient_duration_ms, 200);
        assert_eq!(config.audio, AudioConfig::default());
        assert_eq!(config.scene, SceneConfig::default());
    }

    #[test]
    fn rejects_out_of_range_logo_ratio() {
        let err = AppConfig::from_json_str(r#"{ "scene": { "logo_size_ratio": 1.5 } }"#)
            .unwrap_err();
        assert!(matches!(err, BeatVizError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_transient_duration() {
        let mut config = AppConfig::default();
        config.scheduler.transient_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn leaves_tempo_checks_to_bpm_value() {
        let mut config = AppConfig::default();
        config.scheduler.base_bpm = -10.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn analysis_window_fits_inside_the_time_bound() {
        let mut config = AppConfig::default();
        config.audio.analysis_window_ms = config.audio.capture_duration_ms;
        assert!(matches!(config.validate(), Err(BeatVizError::InvalidConfig(_))));

        let audio = AudioConfig::default();
        assert_eq!(audio.window_len(44_100), 176_400);
        assert_eq!(audio.window_len(48_000), 192_000);
        // Capped by buffer_len for very fast devices.
        assert_eq!(audio.window_len(192_000), 240_000);
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = AppConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, BeatVizError::Json(_)));
    }
}
