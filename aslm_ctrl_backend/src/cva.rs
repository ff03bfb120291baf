//! Constant-velocity acquisition.
//!
//! The scan stage moves at a constant speed and its encoder triggers every camera frame and
//! every analog pass, so the stage velocity must advance exactly one encoder step per sweep.
//! The encoder counts 10 nm and, being a quadrature device, cannot divide below 40 nm. The stage
//! moves at 45 degrees to the optical axis, so a z step of `d` needs `d * 2 / sqrt(2)` of travel.
//!
//! The signal side sizes the `CVACONPRO` template to cover the whole scan in one armed buffer,
//! switches the coordinator to the encoder trigger line, starts the scan and fires one pass. The
//! data side counts frames until the expected number arrived.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aslm_compiler_backend::{Axis, ConfigError, WaveformTemplate};
use tracing::{debug, info, warn};

use crate::coordinator::{AcquisitionCoordinator, TriggerMode};
use crate::daq::DaqBackend;
use crate::devices::{Camera, Stage};
use crate::error::Result;
use crate::feature::{DataFeature, DataStatus, SignalFeature, SignalStatus, StopFlag};

pub const ENCODER_RESOLUTION_NM: f64 = 10.;
pub const MIN_ENCODER_DIVIDE_NM: f64 = 4. * ENCODER_RESOLUTION_NM;
pub const CVA_TEMPLATE: &str = "CVACONPRO";
/// Encoder line used when the context names none.
pub const DEFAULT_ENCODER_TRIGGER: &str = "/PXI6259/PFI1";
/// Speed the stage is left at after a scan, as a fraction of its maximum.
const PARKING_SPEED: f64 = 0.5;

#[derive(Clone, Debug, PartialEq)]
pub struct ScanPlan {
    /// Stage travel per frame, rounded up to a whole encoder divide.
    pub step_nm: f64,
    pub start_mm: f64,
    pub end_mm: f64,
    pub sweep_time: f64,
}

impl ScanPlan {
    /// Plans a scan from `abs_z_start_um` to `abs_z_end_um` sampled every `step_size_um`.
    pub fn new(step_size_um: f64, abs_z_start_um: f64, abs_z_end_um: f64, sweep_time: f64) -> Result<Self> {
        if !(step_size_um > 0.) {
            return Err(ConfigError::InvalidParameter {
                name: "scan step size",
                value: step_size_um,
            }
            .into());
        }
        if !(sweep_time > 0.) {
            return Err(ConfigError::InvalidSweepTime(sweep_time).into());
        }
        let travel_nm = step_size_um * 1000. * 2. / 2f64.sqrt();
        let step_nm = (travel_nm / MIN_ENCODER_DIVIDE_NM).ceil() * MIN_ENCODER_DIVIDE_NM;
        Ok(Self {
            step_nm,
            start_mm: abs_z_start_um / 1000.,
            end_mm: abs_z_end_um / 1000.,
            sweep_time,
        })
    }

    /// Encoder divide handed to the stage, in mm.
    pub fn step_mm(&self) -> f64 {
        self.step_nm * 1e-6
    }

    /// Velocity advancing one step per sweep, in mm/s.
    pub fn expected_speed(&self) -> f64 {
        self.step_mm() / self.sweep_time
    }

    /// Frames the scan produces when the stage actually runs at `velocity` mm/s.
    pub fn expected_frames(&self, velocity: f64) -> Result<usize> {
        if !(velocity > 0.) {
            return Err(ConfigError::InvalidParameter {
                name: "stage velocity",
                value: velocity,
            }
            .into());
        }
        let frames = ((self.start_mm - self.end_mm).abs() / velocity / self.sweep_time).ceil();
        if frames < 1. {
            return Err(ConfigError::InvalidParameter {
                name: "scan range",
                value: (self.start_mm - self.end_mm).abs(),
            }
            .into());
        }
        Ok(frames as usize)
    }
}

pub struct ConstantVelocitySignal<B: DaqBackend> {
    coordinator: Arc<AcquisitionCoordinator<B>>,
    stage: Arc<dyn Stage>,
    channel_key: String,
    expected: Arc<AtomicUsize>,
    axis: Axis,
    speed_percent: f64,
    started: bool,
}

impl<B: DaqBackend> ConstantVelocitySignal<B> {
    /// Configures the stage scan and the coordinator, returning the expected frame count.
    fn arm(&mut self) -> Result<usize> {
        let ctx = self.coordinator.context().clone();
        let (axis, step_size, start, end, trigger_line) = {
            let ctx = ctx.read();
            let state = &ctx.microscope_state;
            (
                ctx.stage.scan_axis,
                state.step_size,
                state.abs_z_start,
                state.abs_z_end,
                ctx.daq
                    .external_trigger
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ENCODER_TRIGGER.to_string()),
            )
        };
        self.axis = axis;
        let sweep_time = self.coordinator.channel_timing(&self.channel_key)?.sweep_time;
        let plan = ScanPlan::new(step_size, start, end, sweep_time)?;

        self.stage.scanr(plan.start_mm, plan.end_mm, plan.step_mm(), axis)?;
        self.stage.set_speed(1.)?;
        let max_speed = self.stage.get_speed(axis)?;
        if !(max_speed > 0.) {
            return Err(ConfigError::InvalidParameter {
                name: "stage max speed",
                value: max_speed,
            }
            .into());
        }
        self.stage.set_speed(0.0001 / max_speed)?;
        self.speed_percent = plan.expected_speed() / max_speed;
        self.stage.set_speed(self.speed_percent)?;
        let velocity = self.stage.get_speed(axis)?;
        let frames = plan.expected_frames(velocity)?;
        info!(
            step_nm = plan.step_nm,
            expected_speed = plan.expected_speed(),
            velocity,
            frames,
            "constant-velocity scan planned"
        );

        {
            let mut ctx = ctx.write();
            ctx.waveform_templates
                .insert(CVA_TEMPLATE.to_string(), WaveformTemplate::new(1, frames));
            ctx.microscope_state.waveform_template = CVA_TEMPLATE.to_string();
            ctx.microscope_state.number_z_steps = frames;
        }
        self.coordinator
            .set_trigger_mode(TriggerMode::External(trigger_line))?;
        self.coordinator.prepare(&self.channel_key)?;
        Ok(frames)
    }
}

impl<B: DaqBackend> SignalFeature for ConstantVelocitySignal<B> {
    fn name(&self) -> &str {
        "constant velocity"
    }

    fn init(&mut self) -> Result<()> {
        let frames = self.arm()?;
        self.expected.store(frames, Ordering::SeqCst);
        Ok(())
    }

    fn step(&mut self, _frame_id: usize, _stop: &StopFlag) -> Result<SignalStatus> {
        if self.started {
            return Ok(SignalStatus::Done);
        }
        self.stage.set_speed(self.speed_percent)?;
        self.stage.start_scan(self.axis)?;
        self.started = true;
        Ok(SignalStatus::Continue { trigger: true })
    }

    fn frames_per_trigger(&self) -> usize {
        self.expected.load(Ordering::SeqCst).max(1)
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Err(err) = self.stage.stop_scan() {
            warn!(%err, "could not stop the scan");
        }
        if let Err(err) = self.stage.set_speed(PARKING_SPEED) {
            debug!(%err, "ignored speed reset failure");
        }
        self.coordinator.stop();
        self.coordinator.context().write().microscope_state.waveform_template =
            "Default".to_string();
        self.coordinator.set_trigger_mode(TriggerMode::SelfTrigger)
    }
}

pub struct ConstantVelocityData {
    expected: Arc<AtomicUsize>,
    received: usize,
}

impl ConstantVelocityData {
    pub fn received(&self) -> usize {
        self.received
    }
}

impl DataFeature for ConstantVelocityData {
    fn consume(&mut self, ready: &[usize], _camera: &dyn Camera) -> Result<DataStatus> {
        self.received += ready.len();
        let expected = self.expected.load(Ordering::SeqCst);
        if !ready.is_empty() {
            debug!(received = self.received, expected, "scan frames received");
        }
        if expected > 0 && self.received >= expected {
            info!(frames = self.received, "constant-velocity scan complete");
            return Ok(DataStatus::Done);
        }
        Ok(DataStatus::Continue)
    }
}

/// Builds the two halves of a constant-velocity scan of `channel_key`.
pub fn constant_velocity<B: DaqBackend>(
    coordinator: Arc<AcquisitionCoordinator<B>>,
    stage: Arc<dyn Stage>,
    channel_key: &str,
) -> (ConstantVelocitySignal<B>, ConstantVelocityData) {
    let expected = Arc::new(AtomicUsize::new(0));
    (
        ConstantVelocitySignal {
            coordinator,
            stage,
            channel_key: channel_key.to_string(),
            expected: expected.clone(),
            axis: Axis::Z,
            speed_percent: PARKING_SPEED,
            started: false,
        },
        ConstantVelocityData {
            expected,
            received: 0,
        },
    )
}
