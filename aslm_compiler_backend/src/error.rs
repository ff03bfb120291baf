//! Configuration error taxonomy.
//!
//! Every problem detected while turning an acquisition context into waveforms, sweep times
//! or board buffers surfaces as a [`ConfigError`]. These are raised at build time, before any
//! hardware task is created.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(f64),

    #[error("Sweep time must be positive, got {0} s")]
    InvalidSweepTime(f64),

    #[error("Voltage range [{min}, {max}] is empty")]
    InvalidVoltageRange { min: f64, max: f64 },

    #[error(
        "Waveform shape exceeds the sweep: delay {delay}% + rise {rise}% + fall {fall}% > 100%"
    )]
    ShapeExceedsSweep { delay: f64, rise: f64, fall: f64 },

    #[error("Waveform parameter {name} out of range: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("Unknown channel {0}")]
    UnknownChannel(String),

    #[error("Unknown waveform template {0}")]
    UnknownTemplate(String),

    #[error("Waveform template {name} must have non-zero repeat and expand (got {repeat}x{expand})")]
    EmptyTemplate {
        name: String,
        repeat: usize,
        expand: usize,
    },

    #[error("Sensor mode {0} is not supported by this camera")]
    UnsupportedSensorMode(String),

    #[error("Expecting output address of format '{expected}' yet received {address}")]
    InvalidAddress { address: String, expected: String },

    #[error("Channel {channel} already registered on board {board}")]
    DuplicateChannel { board: String, channel: String },

    #[error("Channel {channel} does not belong to board {board}")]
    ForeignChannel { board: String, channel: String },

    #[error(
        "Camera trigger window [{delay}, {end}] s does not fit inside the sweep of {sweep_time} s"
    )]
    TriggerOutsideSweep {
        delay: f64,
        end: f64,
        sweep_time: f64,
    },

    #[error("Failed to parse acquisition context: {0}")]
    Parse(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
