use crate::{BeatVizError, Result};

use super::EffectHandle;

/// Triangle-wave oscillator between two bounds.
///
/// The position is kept as a phase over one full up-and-down cycle, so any
/// number of steps of any size keeps the value inside `[min, max]` and
/// reverses direction at each bound.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleSweep {
    min: f64,
    max: f64,
    step_per_frame: f64,
    /// Distance travelled within the current cycle, in `[0, 2 * span)`.
    phase: f64,
}

impl TriangleSweep {
    /// Starts at `start` moving upwards (`rising`) or downwards.
    pub fn new(min: f64, max: f64, step_per_frame: f64, start: f64, rising: bool) -> Result<Self> {
        let valid = min.is_finite() && max.is_finite() && min < max && step_per_frame.is_finite();
        if !valid {
            return Err(BeatVizError::InvalidConfig(format!(
                "sweep bounds {min}..{max} with step {step_per_frame} are not usable"
            )));
        }
        let span = max - min;
        let offset = (start.clamp(min, max) - min).min(span);
        let phase = if rising { offset } else { 2.0 * span - offset };
        Ok(Self {
            min,
            max,
            step_per_frame,
            phase: phase.rem_euclid(2.0 * span),
        })
    }

    pub fn value(&self) -> f64 {
        let span = self.max - self.min;
        if self.phase <= span {
            self.min + self.phase
        } else {
            self.min + 2.0 * span - self.phase
        }
    }

    pub fn is_rising(&self) -> bool {
        self.phase < self.max - self.min
    }

    /// Moves by `delta` frames and returns the new value.
    pub fn advance(&mut self, delta: f64) -> f64 {
        let cycle = 2.0 * (self.max - self.min);
        self.phase = (self.phase + self.step_per_frame * delta).rem_euclid(cycle);
        self.value()
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

/// One animated parameter of a live effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSweep {
    pub param: &'static str,
    pub sweep: TriangleSweep,
}

/// An effect whose parameters are advanced every frame.
#[derive(Debug, Clone)]
pub struct LiveEffect {
    pub effect: EffectHandle,
    pub sweeps: Vec<ParamSweep>,
}

impl LiveEffect {
    pub fn new(effect: EffectHandle) -> Self {
        Self {
            effect,
            sweeps: Vec::new(),
        }
    }

    pub fn with_sweep(mut self, param: &'static str, sweep: TriangleSweep) -> Self {
        self.sweeps.push(ParamSweep { param, sweep });
        self
    }

    /// Pulsing bloom. Brightness sweeps 0.5..1.8 from 1.0 and blur sweeps
    /// 0.0..0.52 from 0.2, both heading down first and reaching their bounds
    /// on the same frames. The blur range is -0.2..0.32 shifted up by 0.2 so it
    /// never goes negative.
    pub fn pulsing_bloom(effect: EffectHandle) -> Result<Self> {
        Ok(Self::new(effect)
            .with_sweep("brightness", TriangleSweep::new(0.5, 1.8, 0.005, 1.0, false)?)
            .with_sweep("blur", TriangleSweep::new(0.0, 0.52, 0.002, 0.2, false)?))
    }
}

/// A shader uniform that tracks elapsed time.
#[derive(Debug, Clone)]
pub struct TimeUniform {
    pub effect: EffectHandle,
    pub name: &'static str,
    /// Uniform units per second.
    pub speed: f64,
    pub value: f64,
}

impl TimeUniform {
    pub fn new(effect: EffectHandle, name: &'static str, speed: f64) -> Self {
        Self {
            effect,
            name,
            speed,
            value: 0.0,
        }
    }

    pub fn advance(&mut self, elapsed_seconds: f64) -> f64 {
        self.value += elapsed_seconds * self.speed;
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn reverses_at_each_bound() {
        let mut sweep = TriangleSweep::new(0.0, 1.0, 0.25, 0.5, true).unwrap();
        let values: Vec<f64> = (0..6).map(|_| sweep.advance(1.0)).collect();
        let expected = [0.75, 1.0, 0.75, 0.5, 0.25, 0.0];
        for (value, expected) in values.iter().zip(expected) {
            assert!(approx(*value, expected), "{values:?}");
        }
        assert!(sweep.is_rising());
    }

    #[test]
    fn falling_start_moves_down() {
        let mut sweep = TriangleSweep::new(0.5, 1.8, 0.005, 1.0, false).unwrap();
        assert!(!sweep.is_rising());
        assert!(approx(sweep.advance(1.0), 0.995));
    }

    #[test]
    fn stays_bounded_for_huge_steps() {
        let mut sweep = TriangleSweep::new(0.5, 1.8, 0.005, 1.0, false).unwrap();
        for delta in [1.0e6, 3.7, 12_345.678, 0.0, 1.0e9] {
            let value = sweep.advance(delta);
            assert!((0.5..=1.8).contains(&value), "{value}");
        }
    }

    #[test]
    fn long_runs_stay_periodic() {
        let mut sweep = TriangleSweep::new(0.0, 1.0, 0.01, 0.0, true).unwrap();
        // 200 frames make one full cycle.
        for _ in 0..200 * 1000 {
            sweep.advance(1.0);
        }
        assert!(sweep.value() < 1e-6, "{}", sweep.value());
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(TriangleSweep::new(1.0, 0.0, 0.1, 0.5, true).is_err());
        assert!(TriangleSweep::new(0.0, 0.0, 0.1, 0.0, true).is_err());
    }

    #[test]
    fn bloom_parameters_move_together() {
        let mut bloom = LiveEffect::pulsing_bloom(EffectHandle::new("bloom")).unwrap();
        let blur = &bloom.sweeps[1];
        assert_eq!(blur.param, "blur");
        assert_eq!(blur.sweep.bounds(), (0.0, 0.52));
        assert!(approx(blur.sweep.value(), 0.2));
        assert!(!blur.sweep.is_rising());
        for _ in 0..100 {
            for sweep in &mut bloom.sweeps {
                sweep.sweep.advance(1.0);
            }
        }
        let brightness = bloom.sweeps[0].sweep.value();
        let blur = bloom.sweeps[1].sweep.value();
        assert!(approx(brightness, 0.5));
        assert!(approx(blur, 0.0));
    }

    #[test]
    fn time_uniform_scales_elapsed_seconds() {
        let mut uniform = TimeUniform::new(EffectHandle::new("starfield"), "iTime", 2.0);
        uniform.advance(0.5);
        assert!(approx(uniform.advance(0.25), 1.5));
    }
}
