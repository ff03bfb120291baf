//! Provides definitions and implementations for waveform-related functionalities.
//!
//! ## Main Structures and Enumerations:
//!
//! - `WaveformType`: An enumeration naming the supported waveform shapes. Used for logging and
//!   for keying per-shape behavior.
//!
//! - `WaveformShape`: A tagged variant carrying the shape parameters of one waveform (ramp, sawtooth,
//!   sine, square, DC value or single pulse).
//!
//! - `WaveformSpec`: A shape together with the sample rate, sweep time and hardware voltage range of
//!   the output it drives. Calling [`WaveformSpec::generate`] validates the parameters and produces
//!   the clipped sample array.
//!
//! ## Free functions:
//!
//! The generators ([`tunable_lens_ramp`], [`sawtooth`], [`sine_wave`], [`square`], [`dc_value`],
//! [`single_pulse`]) are pure functions of `(sample_rate, sweep_time, shape parameters)` returning
//! an array of exactly [`sample_count`] samples. [`smooth_waveform`] and [`clip`] post-process
//! generated arrays.
//!
//! ## Conventions:
//!
//! - Time base is `t_i = i / sample_rate`, so periodic shapes repeat exactly when
//!   `sample_rate / frequency` is an integer.
//! - Percentages are in `[0, 100]` and refer to the sample count of one sweep.
//! - For the tunable-lens ramp `amplitude` is the peak-to-peak swing centered on `offset`;
//!   the periodic shapes scale a unit `[-1, 1]` waveform by `amplitude` about `offset`.

use std::f64::consts::PI;
use std::fmt;

use ndarray::Array1;

use crate::error::{ConfigError, Result};

/// Number of samples covering one sweep: `round(sample_rate * sweep_time)`.
pub fn sample_count(sample_rate: f64, sweep_time: f64) -> usize {
    (sample_rate * sweep_time).round().max(0.) as usize
}

/// Enum type for different waveform shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveformType {
    TunableLensRamp,
    Sawtooth,
    Sine,
    Square,
    Dc,
    SinglePulse,
}
impl fmt::Display for WaveformType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                WaveformType::TunableLensRamp => "RAMP",
                WaveformType::Sawtooth => "SAWTOOTH",
                WaveformType::Sine => "SINE",
                WaveformType::Square => "SQUARE",
                WaveformType::Dc => "DC",
                WaveformType::SinglePulse => "PULSE",
            }
        )
    }
}

/// Shape parameters of a single waveform.
///
/// ## Implemented shapes and their fields:
/// 1. `TunableLensRamp`: `delay_pct`, `rise_pct`, `fall_pct` (percent of the sweep),
///    `amplitude` (peak-to-peak), `offset`
/// 2. `Sawtooth`: `frequency` (Hz), `amplitude`, `offset`, `duty_cycle` (percent rising), `phase` (rad)
/// 3. `Sine`: `frequency`, `amplitude`, `offset`, `phase`
/// 4. `Square`: `frequency`, `amplitude`, `offset`, `duty_cycle` (percent high), `phase`
/// 5. `Dc`: `amplitude`, `offset`. The output level is `amplitude + offset`.
/// 6. `SinglePulse`: `delay_pct`, `pulse_pct`, `amplitude` (level during the pulse), `offset` (level elsewhere)
#[derive(Clone, Debug, PartialEq)]
pub enum WaveformShape {
    TunableLensRamp {
        delay_pct: f64,
        rise_pct: f64,
        fall_pct: f64,
        amplitude: f64,
        offset: f64,
    },
    Sawtooth {
        frequency: f64,
        amplitude: f64,
        offset: f64,
        duty_cycle: f64,
        phase: f64,
    },
    Sine {
        frequency: f64,
        amplitude: f64,
        offset: f64,
        phase: f64,
    },
    Square {
        frequency: f64,
        amplitude: f64,
        offset: f64,
        duty_cycle: f64,
        phase: f64,
    },
    Dc {
        amplitude: f64,
        offset: f64,
    },
    SinglePulse {
        delay_pct: f64,
        pulse_pct: f64,
        amplitude: f64,
        offset: f64,
    },
}

impl WaveformShape {
    pub fn waveform_type(&self) -> WaveformType {
        match self {
            WaveformShape::TunableLensRamp { .. } => WaveformType::TunableLensRamp,
            WaveformShape::Sawtooth { .. } => WaveformType::Sawtooth,
            WaveformShape::Sine { .. } => WaveformType::Sine,
            WaveformShape::Square { .. } => WaveformType::Square,
            WaveformShape::Dc { .. } => WaveformType::Dc,
            WaveformShape::SinglePulse { .. } => WaveformType::SinglePulse,
        }
    }

    /// Checks the shape parameters without generating samples.
    pub fn validate(&self) -> Result<()> {
        let check_pct = |name: &'static str, value: f64| {
            if !(0.0..=100.0).contains(&value) {
                Err(ConfigError::InvalidParameter { name, value })
            } else {
                Ok(())
            }
        };
        let check_freq = |value: f64| {
            if value.is_finite() && value > 0. {
                Ok(())
            } else {
                Err(ConfigError::InvalidParameter {
                    name: "frequency",
                    value,
                })
            }
        };
        match *self {
            WaveformShape::TunableLensRamp {
                delay_pct,
                rise_pct,
                fall_pct,
                ..
            } => {
                check_pct("delay_pct", delay_pct)?;
                check_pct("rise_pct", rise_pct)?;
                check_pct("fall_pct", fall_pct)?;
                // Small tolerance for percentages derived from ms constants
                if delay_pct + rise_pct + fall_pct > 100. + 1e-9 {
                    return Err(ConfigError::ShapeExceedsSweep {
                        delay: delay_pct,
                        rise: rise_pct,
                        fall: fall_pct,
                    });
                }
            }
            WaveformShape::Sawtooth {
                frequency,
                duty_cycle,
                ..
            }
            | WaveformShape::Square {
                frequency,
                duty_cycle,
                ..
            } => {
                check_freq(frequency)?;
                check_pct("duty_cycle", duty_cycle)?;
            }
            WaveformShape::Sine { frequency, .. } => check_freq(frequency)?,
            WaveformShape::Dc { .. } => {}
            WaveformShape::SinglePulse {
                delay_pct,
                pulse_pct,
                ..
            } => {
                check_pct("delay_pct", delay_pct)?;
                check_pct("pulse_pct", pulse_pct)?;
                if delay_pct + pulse_pct > 100. + 1e-9 {
                    return Err(ConfigError::ShapeExceedsSweep {
                        delay: delay_pct,
                        rise: pulse_pct,
                        fall: 0.,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Struct for a waveform bound to an output: shape plus sampling and voltage limits.
///
/// Immutable once handed to a board; a new spec is built whenever the sweep time or
/// the shape parameters change.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveformSpec {
    pub shape: WaveformShape,
    pub sample_rate: f64,
    pub sweep_time: f64,
    pub min_ao: f64,
    pub max_ao: f64,
    /// Moving-average window in percent of the sweep, applied before clipping.
    pub percent_smoothing: f64,
}

impl WaveformSpec {
    pub fn new(shape: WaveformShape, sample_rate: f64, sweep_time: f64, min_ao: f64, max_ao: f64) -> Self {
        Self {
            shape,
            sample_rate,
            sweep_time,
            min_ao,
            max_ao,
            percent_smoothing: 0.,
        }
    }

    pub fn with_smoothing(mut self, percent_smoothing: f64) -> Self {
        self.percent_smoothing = percent_smoothing;
        self
    }

    pub fn num_samples(&self) -> usize {
        sample_count(self.sample_rate, self.sweep_time)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if !(self.sweep_time.is_finite() && self.sweep_time > 0.) {
            return Err(ConfigError::InvalidSweepTime(self.sweep_time));
        }
        check_voltage_range(self.min_ao, self.max_ao)?;
        self.shape.validate()
    }

    /// Validates the spec and generates its samples, smoothed if requested and clipped to
    /// `[min_ao, max_ao]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use aslm_compiler_backend::waveform::*;
    ///
    /// let spec = WaveformSpec::new(
    ///     WaveformShape::Dc { amplitude: 7.0, offset: 0.0 },
    ///     1e3, 0.1, -5.0, 5.0,
    /// );
    /// let samples = spec.generate().unwrap();
    /// assert_eq!(samples.len(), 100);
    /// assert!(samples.iter().all(|&v| v == 5.0));
    /// ```
    ///
    /// An invalid shape is rejected before any sample is produced:
    ///
    /// ```
    /// # use aslm_compiler_backend::waveform::*;
    /// let spec = WaveformSpec::new(
    ///     WaveformShape::TunableLensRamp {
    ///         delay_pct: 20.0, rise_pct: 70.0, fall_pct: 20.0, amplitude: 1.0, offset: 0.0,
    ///     },
    ///     1e3, 0.1, -5.0, 5.0,
    /// );
    /// assert!(spec.generate().is_err());
    /// ```
    pub fn generate(&self) -> Result<Array1<f64>> {
        self.validate()?;
        let (rate, sweep) = (self.sample_rate, self.sweep_time);
        let samples = match self.shape {
            WaveformShape::TunableLensRamp {
                delay_pct,
                rise_pct,
                fall_pct,
                amplitude,
                offset,
            } => tunable_lens_ramp(rate, sweep, delay_pct, rise_pct, fall_pct, amplitude, offset),
            WaveformShape::Sawtooth {
                frequency,
                amplitude,
                offset,
                duty_cycle,
                phase,
            } => sawtooth(rate, sweep, frequency, amplitude, offset, duty_cycle, phase),
            WaveformShape::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            } => sine_wave(rate, sweep, frequency, amplitude, offset, phase),
            WaveformShape::Square {
                frequency,
                amplitude,
                offset,
                duty_cycle,
                phase,
            } => square(rate, sweep, frequency, amplitude, offset, duty_cycle, phase),
            WaveformShape::Dc { amplitude, offset } => dc_value(rate, sweep, amplitude, offset),
            WaveformShape::SinglePulse {
                delay_pct,
                pulse_pct,
                amplitude,
                offset,
            } => single_pulse(rate, sweep, delay_pct, pulse_pct, amplitude, offset),
        };
        let samples = if self.percent_smoothing > 0. {
            smooth_waveform(&samples, self.percent_smoothing)
        } else {
            samples
        };
        clip(samples, self.min_ao, self.max_ao)
    }
}

fn pct_samples(samples: usize, pct: f64) -> usize {
    ((samples as f64) * pct / 100.).floor() as usize
}

/// Ramp for an electrotunable lens.
///
/// Flat at `offset - amplitude / 2` during the delay fraction, rises linearly to
/// `offset + amplitude / 2` over the rise fraction, falls linearly back over the fall
/// fraction, and rests at the baseline for the remainder of the sweep.
/// Callers are expected to have checked that the three percentages sum to at most 100.
pub fn tunable_lens_ramp(
    sample_rate: f64,
    sweep_time: f64,
    delay_pct: f64,
    rise_pct: f64,
    fall_pct: f64,
    amplitude: f64,
    offset: f64,
) -> Array1<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    let low = offset - amplitude / 2.;
    let high = offset + amplitude / 2.;

    let delay = pct_samples(samples, delay_pct).min(samples);
    let rise = pct_samples(samples, rise_pct).min(samples - delay);
    let fall = pct_samples(samples, fall_pct).min(samples - delay - rise);

    let mut waveform = Array1::from_elem(samples, low);
    waveform
        .slice_mut(ndarray::s![delay..delay + rise])
        .assign(&Array1::linspace(low, high, rise));
    waveform
        .slice_mut(ndarray::s![delay + rise..delay + rise + fall])
        .assign(&Array1::linspace(high, low, fall));
    waveform
}

// Unit sawtooth on [-1, 1]: rises over `width` of the period, falls over the rest.
fn unit_sawtooth(x: f64, width: f64) -> f64 {
    let tm = x.rem_euclid(2. * PI);
    let rise_end = width * 2. * PI;
    if width > 0. && tm < rise_end {
        -1. + 2. * tm / rise_end
    } else {
        1. - 2. * (tm - rise_end) / ((1. - width) * 2. * PI)
    }
}

/// Periodic ramp for digitally scanned galvo mirrors.
///
/// `duty_cycle` is the rising share of each period in percent (50 gives a symmetric
/// triangle, 100 a rising sawtooth); `phase` is in radians.
pub fn sawtooth(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    duty_cycle: f64,
    phase: f64,
) -> Array1<f64> {
    let width = (duty_cycle / 100.).clamp(0., 1.);
    Array1::from_shape_fn(sample_count(sample_rate, sweep_time), |i| {
        let t = i as f64 / sample_rate;
        amplitude * unit_sawtooth(2. * PI * frequency * t + phase, width) + offset
    })
}

pub fn sine_wave(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    phase: f64,
) -> Array1<f64> {
    Array1::from_shape_fn(sample_count(sample_rate, sweep_time), |i| {
        let t = i as f64 / sample_rate;
        amplitude * (2. * PI * frequency * t - phase).sin() + offset
    })
}

/// Square wave, high for `duty_cycle` percent of each period.
pub fn square(
    sample_rate: f64,
    sweep_time: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    duty_cycle: f64,
    phase: f64,
) -> Array1<f64> {
    let duty = (duty_cycle / 100.).clamp(0., 1.);
    Array1::from_shape_fn(sample_count(sample_rate, sweep_time), |i| {
        let t = i as f64 / sample_rate;
        let tm = (2. * PI * frequency * t + phase).rem_euclid(2. * PI);
        let level = if tm < duty * 2. * PI { 1. } else { -1. };
        amplitude * level + offset
    })
}

pub fn dc_value(sample_rate: f64, sweep_time: f64, amplitude: f64, offset: f64) -> Array1<f64> {
    Array1::from_elem(sample_count(sample_rate, sweep_time), amplitude + offset)
}

/// Rectangular pulse at `amplitude`, starting `delay_pct` into the sweep and lasting `pulse_pct`.
pub fn single_pulse(
    sample_rate: f64,
    sweep_time: f64,
    delay_pct: f64,
    pulse_pct: f64,
    amplitude: f64,
    offset: f64,
) -> Array1<f64> {
    let samples = sample_count(sample_rate, sweep_time);
    let start = pct_samples(samples, delay_pct).min(samples);
    let end = (start + pct_samples(samples, pulse_pct)).min(samples);
    let mut waveform = Array1::from_elem(samples, offset);
    waveform.slice_mut(ndarray::s![start..end]).fill(amplitude);
    waveform
}

/// Centered moving average with edge padding; output length equals input length.
///
/// The window spans `ceil(len * percent_smoothing / 100)` samples; a non-positive
/// percentage returns the input unchanged.
pub fn smooth_waveform(waveform: &Array1<f64>, percent_smoothing: f64) -> Array1<f64> {
    let len = waveform.len();
    let window = ((len as f64) * percent_smoothing / 100.).ceil();
    if len == 0 || window < 1. {
        return waveform.clone();
    }
    let window = window as usize;
    let at = |j: isize| waveform[j.clamp(0, len as isize - 1) as usize];

    let half = (window / 2) as isize;
    // Running sum over the padded signal
    let mut sum: f64 = (0..window as isize).map(|k| at(k - half)).sum();
    let mut smoothed = Array1::zeros(len);
    for i in 0..len as isize {
        smoothed[i as usize] = sum / window as f64;
        sum += at(i - half + window as isize) - at(i - half);
    }
    smoothed
}

fn check_voltage_range(min_ao: f64, max_ao: f64) -> Result<()> {
    if min_ao <= max_ao {
        Ok(())
    } else {
        Err(ConfigError::InvalidVoltageRange {
            min: min_ao,
            max: max_ao,
        })
    }
}

/// Clips every sample to `[min_ao, max_ao]`. An inverted or NaN range is rejected.
pub fn clip(mut waveform: Array1<f64>, min_ao: f64, max_ao: f64) -> Result<Array1<f64>> {
    check_voltage_range(min_ao, max_ao)?;
    waveform.mapv_inplace(|v| v.clamp(min_ao, max_ao));
    Ok(waveform)
}

#[cfg(test)]
mod test {
    use crate::waveform::*;
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    fn ramp(delay: f64, rise: f64, fall: f64) -> WaveformSpec {
        WaveformSpec::new(
            WaveformShape::TunableLensRamp {
                delay_pct: delay,
                rise_pct: rise,
                fall_pct: fall,
                amplitude: 2.0,
                offset: 1.0,
            },
            1e4,
            0.05,
            -5.,
            5.,
        )
    }

    #[rstest]
    #[case(WaveformShape::Dc { amplitude: 9.0, offset: 0.0 })]
    #[case(WaveformShape::Sine { frequency: 30.0, amplitude: 8.0, offset: 1.0, phase: 0.3 })]
    #[case(WaveformShape::Sawtooth { frequency: 20.0, amplitude: 7.0, offset: -2.0, duty_cycle: 80.0, phase: 0.0 })]
    #[case(WaveformShape::Square { frequency: 10.0, amplitude: 6.0, offset: 0.0, duty_cycle: 25.0, phase: 0.0 })]
    #[case(WaveformShape::SinglePulse { delay_pct: 10.0, pulse_pct: 5.0, amplitude: 12.0, offset: -12.0 })]
    #[case(WaveformShape::TunableLensRamp { delay_pct: 5.0, rise_pct: 85.0, fall_pct: 10.0, amplitude: 20.0, offset: 0.0 })]
    fn length_and_range(#[case] shape: WaveformShape) {
        for &(rate, sweep) in &[(1e4, 0.1), (1e5, 0.0123), (3333., 0.2)] {
            let spec = WaveformSpec::new(shape.clone(), rate, sweep, -4.5, 4.5);
            let samples = spec.generate().unwrap();
            assert_eq!(samples.len(), (rate * sweep).round() as usize);
            assert!(samples.iter().all(|&v| (-4.5..=4.5).contains(&v)));
        }
    }

    #[test]
    fn full_rise_is_strictly_monotonic() {
        let samples = ramp(0., 100., 0.).generate().unwrap();
        assert_eq!(samples.len(), 500);
        assert!(samples.windows(2).into_iter().all(|w| w[1] > w[0]));
        assert_abs_diff_eq!(samples[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[499], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn ramp_segments() {
        // 500 samples: 50 delay, 350 rise, 50 fall, 50 rest
        let samples = ramp(10., 70., 10.).generate().unwrap();
        assert!(samples.slice(ndarray::s![..50]).iter().all(|&v| v == 0.0));
        assert_abs_diff_eq!(samples[50], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[399], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[400], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[449], 0.0, epsilon = 1e-12);
        assert!(samples.slice(ndarray::s![450..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn ramp_exceeding_sweep_is_rejected() {
        assert_eq!(
            ramp(10., 80., 20.).generate(),
            Err(ConfigError::ShapeExceedsSweep {
                delay: 10.,
                rise: 80.,
                fall: 20.
            })
        );
        assert!(ramp(-1., 50., 0.).generate().is_err());
    }

    #[test]
    fn invalid_timing_is_rejected() {
        let mut spec = ramp(0., 50., 50.);
        spec.sample_rate = 0.;
        assert_eq!(spec.generate(), Err(ConfigError::InvalidSampleRate(0.)));
        let mut spec = ramp(0., 50., 50.);
        spec.sweep_time = -1.;
        assert!(matches!(spec.generate(), Err(ConfigError::InvalidSweepTime(_))));
        let mut spec = ramp(0., 50., 50.);
        spec.min_ao = 1.;
        spec.max_ao = 0.;
        assert!(matches!(spec.generate(), Err(ConfigError::InvalidVoltageRange { .. })));
    }

    #[test]
    fn symmetric_sawtooth_is_periodic_and_centered() {
        // 10 kHz, 20 Hz -> 500 samples per period, 4 periods
        let samples = sawtooth(1e4, 0.2, 20., 1.5, 0.7, 50., 0.);
        assert_eq!(samples.len(), 2000);
        for i in 0..1500 {
            assert_abs_diff_eq!(samples[i], samples[i + 500], epsilon = 1e-9);
        }
        assert_abs_diff_eq!(samples.mean().unwrap(), 0.7, epsilon = 1e-3);
        assert_abs_diff_eq!(samples[0], 0.7 - 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[250], 0.7 + 1.5, epsilon = 1e-12);
    }

    #[test]
    fn square_duty_cycle() {
        let samples = square(1e4, 0.1, 10., 1., 0., 25., 1e-6);
        let high = samples.iter().filter(|&&v| v > 0.).count();
        assert_eq!(high, 250);
    }

    #[test]
    fn single_pulse_window() {
        let samples = single_pulse(1e3, 0.1, 20., 10., 5., 0.);
        let high: Vec<usize> = (0..samples.len()).filter(|&i| samples[i] == 5.).collect();
        assert_eq!(high, (20..30).collect::<Vec<_>>());
    }

    #[test]
    fn smoothing_preserves_length_and_flattens_edges() {
        let step = Array1::from_shape_fn(100, |i| if i < 50 { 0. } else { 1. });
        let smoothed = smooth_waveform(&step, 10.);
        assert_eq!(smoothed.len(), 100);
        assert_abs_diff_eq!(smoothed[0], 0.0);
        assert_abs_diff_eq!(smoothed[99], 1.0);
        assert!(smoothed[50] > 0. && smoothed[50] < 1.);
        assert_eq!(smooth_waveform(&step, 0.), step);
    }

    #[test]
    fn clip_rejects_inverted_or_nan_range() {
        let samples = Array1::from(vec![-7., 0.5, 7.]);
        assert_eq!(clip(samples.clone(), -5., 5.), Ok(Array1::from(vec![-5., 0.5, 5.])));
        assert_eq!(
            clip(samples.clone(), 5., -5.),
            Err(ConfigError::InvalidVoltageRange { min: 5., max: -5. })
        );
        assert!(matches!(
            clip(samples, f64::NAN, 5.),
            Err(ConfigError::InvalidVoltageRange { .. })
        ));
    }
}
