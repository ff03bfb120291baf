//! Acquisition error taxonomy.
//!
//! [`AcquisitionError`] wraps the configuration, DAQ and device errors raised underneath the
//! coordinator and the acquisition features, and adds the coordinator state and thread-pair
//! failures of its own.

use std::time::Duration;

use aslm_compiler_backend::ConfigError;
use thiserror::Error;

use crate::coordinator::CoordinatorState;
use crate::daq::DaqError;
use crate::devices::DeviceError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Daq(#[from] DaqError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Coordinator is {state}, expected {expected}")]
    InvalidState {
        state: CoordinatorState,
        expected: &'static str,
    },

    #[error("Camera delivered no frame in {0} consecutive polls")]
    CameraTimeout(usize),

    #[error("No result from the data thread after {0:?}")]
    QueueTimeout(Duration),

    #[error("Acquisition thread failure: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;
