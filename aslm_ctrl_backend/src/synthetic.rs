//! Synthetic camera and stage.
//!
//! Both stand in for hardware in tests and in the demo binary. The camera renders frames from a
//! caller-supplied scene when [`SyntheticCamera::capture`] is called (typically from the
//! simulated DAQ's pulse-train hook) and reports their ids through a channel, optionally
//! scrambling the delivery order. The stage keeps positions in memory and records scan setup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aslm_compiler_backend::{Axis, CameraTiming, ReadoutDirection, Result as ConfigResult, SensorMode};
use crossbeam::channel::{unbounded, Receiver, Sender};
use ndarray::Array2;
use parking_lot::Mutex;
use tracing::trace;

use crate::devices::{Camera, CameraProperty, DeviceError, Result, Stage};
use crate::error::Result as AcquisitionResult;
use crate::feature::Trigger;

/// Renders the frame for the given capture index.
pub type Scene = Box<dyn Fn(usize) -> Array2<u16> + Send + Sync>;

struct CameraState {
    frames: Vec<Option<Array2<u16>>>,
    captured: usize,
    held: Vec<usize>,
    exposure_ms: f64,
    sensor_mode: SensorMode,
    readout_direction: ReadoutDirection,
}

pub struct SyntheticCamera {
    buffer_size: usize,
    readout_time: f64,
    line_interval: f64,
    scramble: bool,
    scene: Scene,
    state: Mutex<CameraState>,
    ready_tx: Sender<usize>,
    ready_rx: Receiver<usize>,
}

impl SyntheticCamera {
    /// Camera with a flat mid-grey 64x64 scene.
    pub fn new(buffer_size: usize) -> Self {
        Self::with_scene(buffer_size, Box::new(|_| Array2::from_elem((64, 64), 2048)))
    }

    pub fn with_scene(buffer_size: usize, scene: Scene) -> Self {
        let (ready_tx, ready_rx) = unbounded();
        Self {
            buffer_size: buffer_size.max(1),
            readout_time: 0.01,
            line_interval: 10e-6,
            scramble: false,
            scene,
            state: Mutex::new(CameraState {
                frames: vec![None; buffer_size.max(1)],
                captured: 0,
                held: Vec::new(),
                exposure_ms: 100.,
                sensor_mode: SensorMode::Normal,
                readout_direction: ReadoutDirection::TopToBottom,
            }),
            ready_tx,
            ready_rx,
        }
    }

    pub fn with_readout_time(mut self, readout_time: f64) -> Self {
        self.readout_time = readout_time;
        self
    }

    /// Delivers each poll's ids in reverse order and holds the lowest one back to the next poll.
    pub fn with_scrambled_delivery(mut self, scramble: bool) -> Self {
        self.scramble = scramble;
        self
    }

    /// Renders the next frame into the ring buffer and reports it ready. Returns its id.
    pub fn capture(&self) -> usize {
        let mut state = self.state.lock();
        let frame_id = state.captured % self.buffer_size;
        let frame = (self.scene)(state.captured);
        state.frames[frame_id] = Some(frame);
        state.captured += 1;
        drop(state);
        trace!(frame_id, "synthetic frame captured");
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.ready_tx.send(frame_id);
        frame_id
    }

    pub fn captured(&self) -> usize {
        self.state.lock().captured
    }

    pub fn sensor_mode(&self) -> SensorMode {
        self.state.lock().sensor_mode
    }

    pub fn readout_direction(&self) -> ReadoutDirection {
        self.state.lock().readout_direction
    }
}

impl CameraTiming for SyntheticCamera {
    fn readout_time(&self) -> f64 {
        self.readout_time
    }

    /// The rolling shutter sweeps `rows` lines, one line interval each, on top of the row
    /// exposure.
    fn light_sheet_exposure(&self, exposure_time: f64, rows: usize) -> ConfigResult<f64> {
        Ok(exposure_time + rows as f64 * self.line_interval)
    }
}

impl Camera for SyntheticCamera {
    fn start_series(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.captured = 0;
        state.held.clear();
        state.frames.iter_mut().for_each(|frame| *frame = None);
        while self.ready_rx.try_recv().is_ok() {}
        Ok(())
    }

    fn end_series(&self) -> Result<()> {
        Ok(())
    }

    fn get_new_frame(&self, timeout: Duration) -> Vec<usize> {
        let mut ids: Vec<usize> = self.ready_rx.recv_timeout(timeout).into_iter().collect();
        ids.extend(self.ready_rx.try_iter());
        if !self.scramble {
            return ids;
        }
        let mut state = self.state.lock();
        let mut delivered = std::mem::take(&mut state.held);
        if ids.len() > 1 {
            state.held.push(ids.remove(0));
        }
        delivered.extend(ids.into_iter().rev());
        delivered
    }

    fn frame(&self, frame_id: usize) -> Result<Array2<u16>> {
        self.state
            .lock()
            .frames
            .get(frame_id)
            .cloned()
            .flatten()
            .ok_or(DeviceError::MissingFrame(frame_id))
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn exposure_time_ms(&self) -> f64 {
        self.state.lock().exposure_ms
    }

    fn set_property(&self, property: CameraProperty) -> Result<()> {
        let mut state = self.state.lock();
        match property {
            CameraProperty::ExposureTimeMs(ms) if ms > 0. => state.exposure_ms = ms,
            CameraProperty::ExposureTimeMs(ms) => {
                return Err(DeviceError::Hardware(format!("Invalid exposure time {} ms", ms)))
            }
            CameraProperty::SensorMode(mode) => state.sensor_mode = mode,
            CameraProperty::ReadoutDirection(direction) => state.readout_direction = direction,
        }
        Ok(())
    }
}

/// Trigger capturing one synthetic frame per fired pass, without any DAQ in between.
pub struct SyntheticTrigger {
    camera: Arc<SyntheticCamera>,
}

impl SyntheticTrigger {
    pub fn new(camera: Arc<SyntheticCamera>) -> Self {
        Self { camera }
    }
}

impl Trigger for SyntheticTrigger {
    fn fire(&self) -> AcquisitionResult<()> {
        self.camera.capture();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanRange {
    pub start_mm: f64,
    pub end_mm: f64,
    pub enc_divide: f64,
    pub axis: Axis,
}

struct StageState {
    positions: HashMap<Axis, f64>,
    speed_percent: f64,
    scan: Option<ScanRange>,
    scanning: bool,
    moves: usize,
}

pub struct SyntheticStage {
    max_speed: f64,
    limits: HashMap<Axis, (f64, f64)>,
    state: Mutex<StageState>,
}

impl SyntheticStage {
    pub fn new() -> Self {
        Self {
            max_speed: 7.5,
            limits: HashMap::new(),
            state: Mutex::new(StageState {
                positions: HashMap::new(),
                speed_percent: 1.,
                scan: None,
                scanning: false,
                moves: 0,
            }),
        }
    }

    /// Maximum scan speed in mm/s.
    pub fn with_max_speed(mut self, max_speed: f64) -> Self {
        self.max_speed = max_speed;
        self
    }

    pub fn with_limits(mut self, axis: Axis, min: f64, max: f64) -> Self {
        self.limits.insert(axis, (min, max));
        self
    }

    pub fn scan_range(&self) -> Option<ScanRange> {
        self.state.lock().scan
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn speed_percent(&self) -> f64 {
        self.state.lock().speed_percent
    }

    /// Number of absolute moves performed so far.
    pub fn move_count(&self) -> usize {
        self.state.lock().moves
    }
}

impl Default for SyntheticStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SyntheticStage {
    fn move_axis_absolute(&self, axis: Axis, value: f64, _wait_until_done: bool) -> Result<bool> {
        if let Some(&(min, max)) = self.limits.get(&axis) {
            if value < min || value > max {
                return Err(DeviceError::OutOfRange {
                    axis,
                    value,
                    min,
                    max,
                });
            }
        }
        let mut state = self.state.lock();
        state.positions.insert(axis, value);
        state.moves += 1;
        Ok(true)
    }

    fn get_axis_position(&self, axis: Axis) -> Result<f64> {
        Ok(self.state.lock().positions.get(&axis).copied().unwrap_or(0.))
    }

    fn set_speed(&self, percent: f64) -> Result<()> {
        if !(percent > 0.) {
            return Err(DeviceError::Hardware(format!("Invalid speed {}", percent)));
        }
        self.state.lock().speed_percent = percent.min(1.);
        Ok(())
    }

    fn get_speed(&self, _axis: Axis) -> Result<f64> {
        Ok(self.max_speed * self.state.lock().speed_percent)
    }

    fn scanr(&self, start_mm: f64, end_mm: f64, enc_divide: f64, axis: Axis) -> Result<()> {
        self.state.lock().scan = Some(ScanRange {
            start_mm,
            end_mm,
            enc_divide,
            axis,
        });
        Ok(())
    }

    fn start_scan(&self, axis: Axis) -> Result<()> {
        let mut state = self.state.lock();
        match state.scan {
            Some(scan) if scan.axis == axis => {
                state.scanning = true;
                Ok(())
            }
            _ => Err(DeviceError::Hardware(format!("No scan configured on axis {}", axis))),
        }
    }

    fn stop_scan(&self) -> Result<()> {
        self.state.lock().scanning = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::synthetic::*;

    #[test]
    fn ring_buffer_wraps() {
        let camera = SyntheticCamera::with_scene(
            3,
            Box::new(|i| Array2::from_elem((2, 2), i as u16)),
        );
        let ids: Vec<usize> = (0..4).map(|_| camera.capture()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0]);
        assert_eq!(camera.frame(0).unwrap()[[0, 0]], 3);
        assert_eq!(camera.frame(2).unwrap()[[1, 1]], 2);
        assert_eq!(
            camera.get_new_frame(Duration::from_millis(1)),
            vec![0, 1, 2, 0]
        );
        assert!(camera.get_new_frame(Duration::from_millis(1)).is_empty());

        camera.start_series().unwrap();
        assert_eq!(camera.captured(), 0);
        assert_eq!(camera.frame(1), Err(DeviceError::MissingFrame(1)));
    }

    #[test]
    fn scrambled_delivery_holds_lowest_id() {
        let camera = SyntheticCamera::new(10).with_scrambled_delivery(true);
        for _ in 0..3 {
            camera.capture();
        }
        assert_eq!(camera.get_new_frame(Duration::from_millis(1)), vec![2, 1]);
        camera.capture();
        assert_eq!(camera.get_new_frame(Duration::from_millis(1)), vec![0, 3]);
        assert!(camera.get_new_frame(Duration::from_millis(1)).is_empty());
    }

    #[test]
    fn stage_scan_setup() {
        let stage = SyntheticStage::new().with_limits(Axis::Z, 0., 100.);
        assert!(stage.move_axis_absolute(Axis::Z, 150., true).is_err());
        assert!(stage.start_scan(Axis::Z).is_err());
        stage.scanr(0., 0.1, 0.00008, Axis::Z).unwrap();
        stage.start_scan(Axis::Z).unwrap();
        assert!(stage.is_scanning());
        stage.stop_scan().unwrap();
        assert!(!stage.is_scanning());

        stage.set_speed(0.5).unwrap();
        assert_eq!(stage.get_speed(Axis::Z), Ok(3.75));
        assert!(stage.set_speed(0.).is_err());
    }
}
