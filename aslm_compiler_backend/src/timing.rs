//! Channel timing: sweep times and camera trigger pulse parameters.
//!
//! A channel's sweep is one full trigger/exposure/readout cycle. In normal sensor mode it is
//!
//! ```text
//! sweep = exposure + readout + max(rf_ramp_falling + rf_settle, camera_settle, camera_delay)
//! ```
//!
//! stretched by `1 + percent_smoothing / 100` when waveform smoothing is enabled. In light-sheet
//! mode the readout overlaps the exposure and the camera itself decides the effective exposure
//! (see [`CameraTiming::light_sheet_exposure`]). The margin is never shorter than the camera
//! delay, so the remote-focus ramp, which rises until `exposure + camera_delay`, always fits.

use indexmap::IndexMap;
use tracing::debug;

use crate::config::{AcquisitionContext, SensorMode};
use crate::error::{ConfigError, Result};

/// Timing queries a camera must answer for the sweep computation.
pub trait CameraTiming {
    /// Frame readout time in seconds (normal sensor mode).
    fn readout_time(&self) -> f64;

    /// Effective exposure in seconds for light-sheet readout over `rows` sensor rows.
    ///
    /// The relation between per-row exposure, line interval and row count is camera-model
    /// specific; cameras without a light-sheet mode keep this default.
    fn light_sheet_exposure(&self, _exposure_time: f64, _rows: usize) -> Result<f64> {
        Err(ConfigError::UnsupportedSensorMode(
            SensorMode::LightSheet.to_string(),
        ))
    }
}

/// Margins added after exposure and readout, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SweepMargins {
    pub remote_focus_ramp_falling: f64,
    pub remote_focus_settle_duration: f64,
    pub camera_settle_duration: f64,
    pub camera_delay: f64,
    pub percent_smoothing: f64,
}
impl SweepMargins {
    pub fn from_context(ctx: &AcquisitionContext) -> Self {
        let constants = &ctx.waveform_constants;
        let ramp_falling = if ctx.camera_parameters.readout_direction.is_bidirectional() {
            0.
        } else {
            constants.remote_focus_ramp_falling_ms / 1000.
        };
        Self {
            remote_focus_ramp_falling: ramp_falling,
            remote_focus_settle_duration: constants.remote_focus_settle_duration_ms / 1000.,
            camera_settle_duration: ctx.camera.settle_duration(),
            camera_delay: ctx.camera.delay(),
            percent_smoothing: constants.percent_smoothing,
        }
    }

    fn total(&self) -> f64 {
        (self.remote_focus_ramp_falling + self.remote_focus_settle_duration)
            .max(self.camera_settle_duration)
            .max(self.camera_delay)
    }
}

pub fn sweep_time(exposure_time: f64, readout_time: f64, margins: &SweepMargins) -> f64 {
    let sweep = exposure_time + readout_time + margins.total();
    if margins.percent_smoothing > 0. {
        sweep * (1. + margins.percent_smoothing / 100.)
    } else {
        sweep
    }
}

/// Normal-mode sweep time of every channel, keyed like the input.
pub fn compute_sweep_times(
    channels: &IndexMap<String, f64>,
    readout_time: f64,
    margins: &SweepMargins,
) -> IndexMap<String, f64> {
    channels
        .iter()
        .map(|(key, &exposure)| (key.clone(), sweep_time(exposure, readout_time, margins)))
        .collect()
}

/// Exposure and sweep time of every selected channel under the context's sensor mode.
pub fn compute_exposure_sweep_times(
    ctx: &AcquisitionContext,
    camera: &dyn CameraTiming,
) -> Result<IndexMap<String, (f64, f64)>> {
    let margins = SweepMargins::from_context(ctx);
    ctx.microscope_state
        .selected_channels()
        .map(|(key, chan)| -> Result<(String, (f64, f64))> {
            let (exposure, readout) = match ctx.camera_parameters.sensor_mode {
                SensorMode::Normal => (chan.exposure_time(), camera.readout_time()),
                SensorMode::LightSheet => (
                    camera.light_sheet_exposure(chan.exposure_time(), ctx.camera.number_of_rows)?,
                    0.,
                ),
            };
            Ok((key.clone(), (exposure, sweep_time(exposure, readout, &margins))))
        })
        .collect()
}

/// Counter-output parameters of the camera trigger train, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraPulse {
    pub initial_delay: f64,
    pub high_time: f64,
    pub low_time: f64,
    pub pulses: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelTiming {
    pub channel_key: String,
    pub exposure_time: f64,
    pub readout_time: f64,
    pub sweep_time: f64,
    pub camera_delay: f64,
    pub camera_high_time: f64,
}

impl ChannelTiming {
    /// Builds and validates the timing of one channel.
    ///
    /// Fails when the trigger pulse `[camera_delay, camera_delay + camera_high_time]` does not fit
    /// inside `[0, sweep_time]`.
    pub fn new(
        channel_key: &str,
        exposure_time: f64,
        readout_time: f64,
        sweep_time: f64,
        camera_delay: f64,
        camera_high_time: f64,
    ) -> Result<Self> {
        if !(sweep_time.is_finite() && sweep_time > 0.) {
            return Err(ConfigError::InvalidSweepTime(sweep_time));
        }
        let timing = Self {
            channel_key: channel_key.to_string(),
            exposure_time,
            readout_time,
            sweep_time,
            camera_delay,
            camera_high_time,
        };
        let (start, end) = timing.trigger_window();
        if start < 0. || end > sweep_time {
            return Err(ConfigError::TriggerOutsideSweep {
                delay: start,
                end,
                sweep_time,
            });
        }
        Ok(timing)
    }

    /// Derives the timing of `channel_key` from the context and the camera.
    pub fn from_context(
        ctx: &AcquisitionContext,
        channel_key: &str,
        camera: &dyn CameraTiming,
    ) -> Result<Self> {
        let chan = ctx.microscope_state.channel(channel_key)?;
        let margins = SweepMargins::from_context(ctx);
        let (exposure, readout) = match ctx.camera_parameters.sensor_mode {
            SensorMode::Normal => (chan.exposure_time(), camera.readout_time()),
            SensorMode::LightSheet => (
                camera.light_sheet_exposure(chan.exposure_time(), ctx.camera.number_of_rows)?,
                0.,
            ),
        };
        let sweep = sweep_time(exposure, readout, &margins);
        debug!(channel = channel_key, exposure, readout, sweep, "channel timing");
        Self::new(
            channel_key,
            exposure,
            readout,
            sweep,
            ctx.camera.delay(),
            ctx.camera.high_time(),
        )
    }

    /// Trigger pulse window `[start, end]` relative to the sweep start.
    pub fn trigger_window(&self) -> (f64, f64) {
        (self.camera_delay, self.camera_delay + self.camera_high_time)
    }

    /// Camera trigger train for `frames` triggers.
    ///
    /// With analog outputs the pulse is short and the rest of the sweep is low time. Without
    /// analog outputs the pulse itself spans the exposure: a single frame holds it until the
    /// sweep ends, several frames keep a `camera_high_time` gap between them.
    pub fn camera_pulse(&self, has_analog_outputs: bool, frames: usize) -> CameraPulse {
        let (high_time, low_time) = if has_analog_outputs {
            (self.camera_high_time, self.sweep_time - self.camera_high_time)
        } else if frames == 1 {
            (self.sweep_time - self.camera_delay, self.camera_high_time)
        } else {
            (self.sweep_time - self.camera_high_time, self.camera_high_time)
        };
        CameraPulse {
            initial_delay: self.camera_delay,
            high_time,
            low_time,
            pulses: frames,
        }
    }
}
