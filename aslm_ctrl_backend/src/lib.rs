//! Hardware side of synchronized light-sheet acquisitions.
//!
//! [`AcquisitionCoordinator`] turns the buffers compiled by `aslm_compiler_backend` into DAQ tasks
//! and fires them; [`AcquisitionSession`] runs an acquisition feature (autofocus,
//! constant-velocity scan) as a signal/data thread pair on top of it. DAQ access goes through
//! the [`daq::DaqBackend`] trait: [`sim::SimDaq`] records every call, and the NI-DAQmx backend is
//! compiled with the `nidaqmx` feature.

pub mod autofocus;
pub mod coordinator;
pub mod cva;
pub mod daq;
pub mod devices;
pub mod error;
pub mod events;
pub mod feature;
pub mod frame_queue;
pub mod metric;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod sim;
pub mod synthetic;

pub use coordinator::{AcquisitionCoordinator, CoordinatorState, TriggerMode};
pub use error::{AcquisitionError, Result};
pub use events::{EventSender, ModelEvent};
pub use feature::{AcquisitionSession, SessionConfig, SessionReport, StopFlag, Trigger};
