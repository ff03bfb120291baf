//! Camera and stage capabilities consumed by the acquisition features.
//!
//! Only the timing-relevant parts of a camera are modelled: the frame ring buffer addressed by
//! frame id, the new-frame poll, and the exposure/readout queries of
//! [`aslm_compiler_backend::CameraTiming`]. Property writes go through the closed
//! [`CameraProperty`] enum instead of free-form names.

use std::collections::HashMap;
use std::time::Duration;

use aslm_compiler_backend::{Axis, CameraTiming, ReadoutDirection, SensorMode};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Axis {0} is not available on this stage")]
    UnknownAxis(Axis),

    #[error("Move of axis {axis} to {value} is outside [{min}, {max}]")]
    OutOfRange {
        axis: Axis,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Frame {0} is not in the camera buffer")]
    MissingFrame(usize),

    #[error("Device failure: {0}")]
    Hardware(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Clone, Debug, PartialEq)]
pub enum CameraProperty {
    ExposureTimeMs(f64),
    SensorMode(SensorMode),
    ReadoutDirection(ReadoutDirection),
}

pub trait Camera: CameraTiming + Send + Sync {
    /// Resets the frame counter; the next captured frame gets id 0.
    fn start_series(&self) -> Result<()>;
    fn end_series(&self) -> Result<()>;

    /// Ids of frames that became ready since the previous poll, waiting at most `timeout`.
    fn get_new_frame(&self, timeout: Duration) -> Vec<usize>;
    fn frame(&self, frame_id: usize) -> Result<Array2<u16>>;
    /// Number of slots in the frame ring buffer.
    fn buffer_size(&self) -> usize;

    fn exposure_time_ms(&self) -> f64;
    fn set_property(&self, property: CameraProperty) -> Result<()>;
}

pub trait Stage: Send + Sync {
    fn move_axis_absolute(&self, axis: Axis, value: f64, wait_until_done: bool) -> Result<bool>;
    fn get_axis_position(&self, axis: Axis) -> Result<f64>;

    fn move_axis_relative(&self, axis: Axis, delta: f64, wait_until_done: bool) -> Result<bool> {
        let current = self.get_axis_position(axis)?;
        self.move_axis_absolute(axis, current + delta, wait_until_done)
    }

    /// Sets the scan speed as a fraction of the maximum speed.
    fn set_speed(&self, percent: f64) -> Result<()>;
    /// Current scan speed of `axis` in mm/s.
    fn get_speed(&self, axis: Axis) -> Result<f64>;

    /// Arms an encoder-triggered constant-velocity scan of `axis` between two positions in mm,
    /// emitting one trigger every `enc_divide` mm.
    fn scanr(&self, start_mm: f64, end_mm: f64, enc_divide: f64, axis: Axis) -> Result<()>;
    fn start_scan(&self, axis: Axis) -> Result<()>;
    fn stop_scan(&self) -> Result<()>;
}

/// Per-axis software zero.
///
/// A zeroed axis reads 0 at the position it had when zeroed; logical positions are physical
/// positions plus the stored offset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageOffsets {
    offsets: HashMap<Axis, f64>,
}

impl StageOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self, axis: Axis) -> f64 {
        self.offsets.get(&axis).copied().unwrap_or(0.)
    }

    /// Captures the current position of every axis in `axes` as its new zero.
    pub fn zero_axes(&mut self, stage: &dyn Stage, axes: &[Axis]) -> Result<()> {
        for &axis in axes {
            let position = stage.get_axis_position(axis)?;
            self.offsets.insert(axis, -position);
        }
        Ok(())
    }

    pub fn unzero_axes(&mut self, axes: &[Axis]) {
        for axis in axes {
            self.offsets.remove(axis);
        }
    }

    pub fn to_logical(&self, axis: Axis, physical: f64) -> f64 {
        physical + self.offset(axis)
    }

    pub fn to_physical(&self, axis: Axis, logical: f64) -> f64 {
        logical - self.offset(axis)
    }
}

#[cfg(test)]
mod test {
    use crate::devices::*;
    use crate::synthetic::SyntheticStage;

    #[test]
    fn zero_and_unzero() {
        let stage = SyntheticStage::new();
        stage.move_axis_absolute(Axis::X, 120., true).unwrap();
        stage.move_axis_absolute(Axis::Y, -30., true).unwrap();

        let mut offsets = StageOffsets::new();
        offsets.zero_axes(&stage, &[Axis::X, Axis::Y]).unwrap();
        assert_eq!(offsets.to_logical(Axis::X, 120.), 0.);
        assert_eq!(offsets.to_logical(Axis::Y, -20.), 10.);
        assert_eq!(offsets.to_physical(Axis::X, 5.), 125.);
        assert_eq!(offsets.to_logical(Axis::Z, 7.), 7.);

        offsets.unzero_axes(&[Axis::X]);
        assert_eq!(offsets.offset(Axis::X), 0.);
        assert_eq!(offsets.offset(Axis::Y), 30.);
    }

    #[test]
    fn relative_move_uses_current_position() {
        let stage = SyntheticStage::new();
        stage.move_axis_absolute(Axis::F, 10., true).unwrap();
        stage.move_axis_relative(Axis::F, -2.5, true).unwrap();
        assert_eq!(stage.get_axis_position(Axis::F), Ok(7.5));
    }
}
