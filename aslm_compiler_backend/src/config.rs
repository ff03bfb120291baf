//! Typed acquisition context.
//!
//! [`AcquisitionContext`] gathers everything the timing engine reads: DAQ lines and sample rate,
//! camera timing constants, waveform constants, the analog outputs to drive, waveform templates,
//! the current microscope state and the autofocus parameters. It deserializes from TOML with a
//! default for every field, so a context file only needs to list what differs.
//!
//! Times in this module follow the units an operator types in (milliseconds, micrometers);
//! accessors such as [`CameraConfig::delay`] convert to seconds for the timing code.
//!
//! ## Sharing
//!
//! At runtime the context is wrapped in a [`SharedContext`]. Writers are restricted by
//! convention: acquisition features write the microscope state and waveform templates from
//! their signal side (or before the data side starts); data-side code only reads.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::template::{default_templates, WaveformTemplate};

pub type SharedContext = Arc<RwLock<AcquisitionContext>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    Theta,
    F,
}
impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Axis::X => "x",
                Axis::Y => "y",
                Axis::Z => "z",
                Axis::Theta => "theta",
                Axis::F => "f",
            }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
pub enum SensorMode {
    #[default]
    Normal,
    #[serde(rename = "Light-Sheet")]
    LightSheet,
}
impl fmt::Display for SensorMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SensorMode::Normal => "Normal",
                SensorMode::LightSheet => "Light-Sheet",
            }
        )
    }
}
impl FromStr for SensorMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Normal" => Ok(SensorMode::Normal),
            "Light-Sheet" => Ok(SensorMode::LightSheet),
            other => Err(ConfigError::UnsupportedSensorMode(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
pub enum ReadoutDirection {
    #[default]
    #[serde(rename = "Top-to-Bottom")]
    TopToBottom,
    #[serde(rename = "Bottom-to-Top")]
    BottomToTop,
    #[serde(rename = "Bidirectional")]
    Bidirectional,
    #[serde(rename = "Rev-Bidirectional")]
    RevBidirectional,
}
impl ReadoutDirection {
    pub fn is_bidirectional(&self) -> bool {
        matches!(
            self,
            ReadoutDirection::Bidirectional | ReadoutDirection::RevBidirectional
        )
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub sample_rate: f64,
    /// Counter output generating the camera trigger pulse train.
    pub camera_trigger_out_line: String,
    /// Digital line pulsed by the master task in self-trigger mode.
    pub master_trigger_out_line: String,
    /// Terminal all tasks listen on in self-trigger mode.
    pub trigger_source: String,
    /// PFI terminal used by external-trigger acquisitions (stage encoder).
    pub external_trigger: Option<String>,
    /// Bound on the camera task wait inside `run()`, in seconds.
    pub camera_wait_timeout: f64,
}
impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            sample_rate: 100_000.,
            camera_trigger_out_line: "/PXI6259/ctr0".to_string(),
            master_trigger_out_line: "/PXI6259/port0/line1".to_string(),
            trigger_source: "/PXI6259/PFI0".to_string(),
            external_trigger: None,
            camera_wait_timeout: 10.,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub delay_ms: f64,
    pub settle_duration_ms: f64,
    pub high_time_ms: f64,
    pub number_of_rows: usize,
}
impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2.,
            settle_duration_ms: 0.,
            high_time_ms: 4.,
            number_of_rows: 2048,
        }
    }
}
impl CameraConfig {
    pub fn delay(&self) -> f64 {
        self.delay_ms / 1000.
    }
    pub fn settle_duration(&self) -> f64 {
        self.settle_duration_ms / 1000.
    }
    pub fn high_time(&self) -> f64 {
        self.high_time_ms / 1000.
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct WaveformConstants {
    pub remote_focus_delay_ms: f64,
    pub remote_focus_ramp_falling_ms: f64,
    pub remote_focus_settle_duration_ms: f64,
    pub percent_smoothing: f64,
}
impl Default for WaveformConstants {
    fn default() -> Self {
        Self {
            remote_focus_delay_ms: 0.,
            remote_focus_ramp_falling_ms: 5.,
            remote_focus_settle_duration_ms: 0.,
            percent_smoothing: 0.,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalvoWaveform {
    #[default]
    Sawtooth,
    Sine,
    Dc,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GalvoConfig {
    pub physical_name: String,
    pub waveform: GalvoWaveform,
    pub frequency: f64,
    pub amplitude: f64,
    pub offset: f64,
    pub duty_cycle: f64,
    pub phase: f64,
    pub min_ao: f64,
    pub max_ao: f64,
}
impl Default for GalvoConfig {
    fn default() -> Self {
        Self {
            physical_name: "PXI6259/ao0".to_string(),
            waveform: GalvoWaveform::Sawtooth,
            frequency: 100.,
            amplitude: 1.,
            offset: 0.,
            duty_cycle: 50.,
            phase: std::f64::consts::FRAC_PI_2,
            min_ao: -5.,
            max_ao: 5.,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RampSetting {
    pub amplitude: f64,
    pub offset: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteFocusConfig {
    pub physical_name: String,
    pub min_ao: f64,
    pub max_ao: f64,
    /// Ramp setting used when the channel's laser has no entry in `lasers`.
    pub ramp: RampSetting,
    pub lasers: IndexMap<String, RampSetting>,
}
impl Default for RemoteFocusConfig {
    fn default() -> Self {
        Self {
            physical_name: "PXI6259/ao2".to_string(),
            min_ao: 0.,
            max_ao: 5.,
            ramp: RampSetting {
                amplitude: 1.,
                offset: 2.5,
            },
            lasers: IndexMap::new(),
        }
    }
}
impl RemoteFocusConfig {
    pub fn ramp_for(&self, laser: &str) -> RampSetting {
        self.lasers.get(laser).copied().unwrap_or(self.ramp)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub is_selected: bool,
    pub laser: String,
    pub camera_exposure_time_ms: f64,
}
impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            is_selected: true,
            laser: "488nm".to_string(),
            camera_exposure_time_ms: 100.,
        }
    }
}
impl ChannelSettings {
    pub fn exposure_time(&self) -> f64 {
        self.camera_exposure_time_ms / 1000.
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MicroscopeState {
    pub channels: IndexMap<String, ChannelSettings>,
    pub waveform_template: String,
    /// Z step in micrometers.
    pub step_size: f64,
    pub abs_z_start: f64,
    pub abs_z_end: f64,
    pub number_z_steps: usize,
}
impl Default for MicroscopeState {
    fn default() -> Self {
        Self {
            channels: IndexMap::new(),
            waveform_template: "Default".to_string(),
            step_size: 0.16,
            abs_z_start: 0.,
            abs_z_end: 100.,
            number_z_steps: 1,
        }
    }
}
impl MicroscopeState {
    pub fn selected_channels(&self) -> impl Iterator<Item = (&String, &ChannelSettings)> {
        self.channels.iter().filter(|(_, chan)| chan.is_selected)
    }

    pub fn channel(&self, channel_key: &str) -> Result<&ChannelSettings> {
        self.channels
            .get(channel_key)
            .ok_or_else(|| ConfigError::UnknownChannel(channel_key.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct CameraParameters {
    pub sensor_mode: SensorMode,
    pub readout_direction: ReadoutDirection,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutoFocusParameters {
    pub coarse_selected: bool,
    pub coarse_range: f64,
    pub coarse_step_size: f64,
    pub fine_selected: bool,
    pub fine_range: f64,
    pub fine_step_size: f64,
    pub robust_fit: bool,
}
impl Default for AutoFocusParameters {
    fn default() -> Self {
        Self {
            coarse_selected: true,
            coarse_range: 500.,
            coarse_step_size: 50.,
            fine_selected: true,
            fine_range: 50.,
            fine_step_size: 5.,
            robust_fit: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Axis scanned during constant-velocity acquisitions.
    pub scan_axis: Axis,
    /// Axis moved by stage-based autofocus.
    pub focus_axis: Axis,
}
impl Default for StageConfig {
    fn default() -> Self {
        Self {
            scan_axis: Axis::Z,
            focus_axis: Axis::F,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AcquisitionContext {
    pub daq: DaqConfig,
    pub camera: CameraConfig,
    pub waveform_constants: WaveformConstants,
    pub galvos: Vec<GalvoConfig>,
    pub remote_focus: Option<RemoteFocusConfig>,
    pub waveform_templates: IndexMap<String, WaveformTemplate>,
    pub microscope_state: MicroscopeState,
    pub camera_parameters: CameraParameters,
    pub autofocus: AutoFocusParameters,
    pub stage: StageConfig,
}
impl Default for AcquisitionContext {
    fn default() -> Self {
        Self {
            daq: DaqConfig::default(),
            camera: CameraConfig::default(),
            waveform_constants: WaveformConstants::default(),
            galvos: Vec::new(),
            remote_focus: None,
            waveform_templates: default_templates(),
            microscope_state: MicroscopeState::default(),
            camera_parameters: CameraParameters::default(),
            autofocus: AutoFocusParameters::default(),
            stage: StageConfig::default(),
        }
    }
}
impl AcquisitionContext {
    /// Parses a context from TOML. Templates missing from the file fall back to the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut ctx: AcquisitionContext = toml::from_str(text)?;
        for (name, template) in default_templates() {
            ctx.waveform_templates.entry(name).or_insert(template);
        }
        Ok(ctx)
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(RwLock::new(self))
    }

    /// True when at least one galvo or remote-focus output is declared.
    pub fn has_analog_outputs(&self) -> bool {
        !self.galvos.is_empty() || self.remote_focus.is_some()
    }
}

#[cfg(test)]
mod test {
    use crate::config::*;

    const CONTEXT: &str = r#"
        [daq]
        sample_rate = 50000.0
        external_trigger = "/PXI6259/PFI1"

        [camera]
        delay_ms = 1.5

        [[galvos]]
        physical_name = "PXI6259/ao0"
        waveform = "sine"
        frequency = 20.0

        [remote_focus]
        physical_name = "PXI6259/ao2"
        [remote_focus.lasers.642nm]
        amplitude = 0.4
        offset = 2.0

        [waveform_templates.Custom]
        repeat = 2
        expand = 3

        [microscope_state]
        waveform_template = "Custom"
        [microscope_state.channels.channel_1]
        laser = "642nm"
        camera_exposure_time_ms = 50.0
        [microscope_state.channels.channel_2]
        is_selected = false

        [camera_parameters]
        sensor_mode = "Light-Sheet"
        readout_direction = "Bidirectional"
    "#;

    #[test]
    fn parse_context() {
        let ctx = AcquisitionContext::from_toml_str(CONTEXT).unwrap();
        assert_eq!(ctx.daq.sample_rate, 50_000.);
        assert_eq!(ctx.daq.external_trigger.as_deref(), Some("/PXI6259/PFI1"));
        assert_eq!(ctx.daq.trigger_source, "/PXI6259/PFI0");
        assert_eq!(ctx.camera.delay(), 0.0015);
        assert_eq!(ctx.camera.high_time(), 0.004);
        assert_eq!(ctx.galvos[0].waveform, GalvoWaveform::Sine);
        assert_eq!(ctx.galvos[0].duty_cycle, 50.);

        let rf = ctx.remote_focus.as_ref().unwrap();
        assert_eq!(rf.ramp_for("642nm").amplitude, 0.4);
        assert_eq!(rf.ramp_for("488nm").offset, 2.5);

        // Custom template added, defaults still present
        assert_eq!(ctx.waveform_templates["Custom"].repeat, 2);
        assert!(ctx.waveform_templates.contains_key("CVACONPRO"));

        let selected: Vec<&String> = ctx.microscope_state.selected_channels().map(|(k, _)| k).collect();
        assert_eq!(selected, vec!["channel_1"]);
        assert_eq!(ctx.microscope_state.channel("channel_1").unwrap().exposure_time(), 0.05);
        assert_eq!(ctx.camera_parameters.sensor_mode, SensorMode::LightSheet);
        assert!(ctx.camera_parameters.readout_direction.is_bidirectional());
        assert!(ctx.has_analog_outputs());
    }

    #[test]
    fn unknown_channel_and_sensor_mode() {
        let ctx = AcquisitionContext::default();
        assert_eq!(
            ctx.microscope_state.channel("channel_9"),
            Err(ConfigError::UnknownChannel("channel_9".to_string()))
        );
        assert!("Progressive".parse::<SensorMode>().is_err());
        assert_eq!("Light-Sheet".parse::<SensorMode>(), Ok(SensorMode::LightSheet));
    }

    #[test]
    fn malformed_context_is_a_config_error() {
        let err = AcquisitionContext::from_toml_str("[daq]\nsample_rate = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
