//! Hardware-facing DAQ task abstraction.
//!
//! The coordinator drives three kinds of tasks: a counter-output pulse train triggering the
//! camera, one analog-output task per board, and (in self-trigger mode) a digital-output master
//! task. [`DaqTask`] exposes the handful of task calls the coordinator needs and [`DaqBackend`]
//! creates configured tasks. Two backends exist: [`crate::sim::SimDaq`], which records every
//! call, and `crate::nidaqmx::NiDaq`, which wraps the NI-DAQmx C library and is only compiled
//! with the `nidaqmx` feature.
//!
//! Task methods take `&self`; backends are responsible for their own interior synchronization
//! so a task can be stopped from one thread while another waits on it.

use std::time::Duration;

use aslm_compiler_backend::CameraPulse;
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    #[error("DAQmx error {code}: {message}")]
    Driver { code: i32, message: String },

    #[error("Task {task} not done after {timeout:?}")]
    Timeout { task: String, timeout: Duration },

    #[error("Task {0} is already closed")]
    TaskClosed(String),

    #[error("Invalid buffer for task {task}: {reason}")]
    InvalidBuffer { task: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DaqError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    CounterOutput,
    AnalogOutput,
    DigitalOutput,
}

pub trait DaqTask: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> TaskKind;

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    /// Releases the hardware task. Any later call fails with [`DaqError::TaskClosed`].
    fn close(&self) -> Result<()>;

    fn is_task_done(&self) -> Result<bool>;
    /// Blocks until the task finishes or `timeout` elapses ([`DaqError::Timeout`]).
    fn wait_until_done(&self, timeout: Duration) -> Result<()>;

    fn cfg_dig_edge_start_trigger(&self, source: &str) -> Result<()>;
    fn set_retriggerable(&self, retriggerable: bool) -> Result<()>;

    /// Writes a `(n_channels, samps_per_chan)` buffer without starting the task.
    fn write_analog(&self, buffer: &Array2<f64>) -> Result<usize>;
    /// Writes a line pattern, one sample per element, and starts the task.
    fn write_digital_lines(&self, pattern: &[bool]) -> Result<usize>;
}

pub trait DaqBackend: Send + Sync {
    type Task: DaqTask + 'static;

    /// Finite counter-output pulse train on `counter` (e.g. `/PXI6259/ctr0`).
    fn create_co_pulse_task(&self, name: &str, counter: &str, pulse: &CameraPulse)
        -> Result<Self::Task>;

    /// Finite analog-output task over `channels`, clocked at `samp_rate`.
    fn create_ao_task(
        &self,
        name: &str,
        channels: &[String],
        samp_rate: f64,
        samps_per_chan: usize,
    ) -> Result<Self::Task>;

    /// Digital-output task on one or more lines (e.g. `/PXI6259/port0/line1`).
    fn create_do_task(&self, name: &str, lines: &str) -> Result<Self::Task>;

    fn reset_device(&self, device: &str) -> Result<()>;
}

/// Stops then closes `task`, logging instead of propagating failures.
pub(crate) fn release_task<T: DaqTask + ?Sized>(task: &T) {
    if let Err(err) = task.stop() {
        tracing::debug!(task = task.name(), %err, "ignored stop failure during teardown");
    }
    if let Err(err) = task.close() {
        tracing::debug!(task = task.name(), %err, "ignored close failure during teardown");
    }
}
