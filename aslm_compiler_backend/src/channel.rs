//! Analog output channels.
//!
//! A [`Channel`] binds one physical output (e.g. `PXI6259/ao2`) to the [`WaveformSpec`] it plays
//! during a sweep. Compiling a channel generates and caches its samples; boards then tile the
//! cached samples into their shared buffer (see [`crate::board`]).

use ndarray::{Array1, ArrayViewMut1};

use crate::error::{ConfigError, Result};
use crate::utils::split_ao_address;
use crate::waveform::WaveformSpec;

pub trait BaseChannel {
    // Field methods
    fn physical_name(&self) -> &str;
    fn line(&self) -> usize;
    fn waveform(&self) -> &WaveformSpec;
    fn samples(&self) -> Option<&Array1<f64>>;
    // Mutable field references
    fn samples_(&mut self) -> &mut Option<Array1<f64>>;

    fn samp_rate(&self) -> f64 {
        self.waveform().sample_rate
    }

    fn is_compiled(&self) -> bool {
        self.samples().is_some()
    }

    fn clear_compile_cache(&mut self) {
        *self.samples_() = None;
    }

    // Generates the waveform once; double compiles are ignored
    fn compile(&mut self) -> Result<()> {
        if self.is_compiled() {
            return Ok(());
        }
        let samples = self.waveform().generate()?;
        if samples.is_empty() {
            return Err(ConfigError::InvalidSweepTime(self.waveform().sweep_time));
        }
        *self.samples_() = Some(samples);
        Ok(())
    }

    /// Fills `row` by tiling the compiled samples from the start; longer waveforms are truncated.
    ///
    /// Tiling assumes the waveform is periodic at its own length.
    fn fill_tiled(&mut self, row: &mut ArrayViewMut1<f64>) -> Result<()> {
        self.compile()?;
        let samples = match self.samples() {
            Some(samples) => samples,
            None => return Err(ConfigError::UnknownChannel(self.physical_name().to_string())),
        };
        let len = samples.len();
        row.indexed_iter_mut()
            .for_each(|(i, v)| *v = samples[i % len]);
        Ok(())
    }
}

pub struct Channel {
    physical_name: String,
    line: usize,
    waveform: WaveformSpec,
    samples: Option<Array1<f64>>,
}

impl Channel {
    /// Creates a channel for an address of form `board/ao(number)`.
    pub fn new(physical_name: &str, waveform: WaveformSpec) -> Result<Self> {
        let (_board, line) = split_ao_address(physical_name)?;
        Ok(Self {
            physical_name: physical_name.trim_start_matches('/').to_string(),
            line,
            waveform,
            samples: None,
        })
    }
}

impl BaseChannel for Channel {
    fn physical_name(&self) -> &str {
        &self.physical_name
    }
    fn line(&self) -> usize {
        self.line
    }
    fn waveform(&self) -> &WaveformSpec {
        &self.waveform
    }
    fn samples(&self) -> Option<&Array1<f64>> {
        self.samples.as_ref()
    }
    fn samples_(&mut self) -> &mut Option<Array1<f64>> {
        &mut self.samples
    }
}
