//! Implements structs and methods corresponding to DAQ boards. See [`BaseBoard`] for
//! implementation details.
//!
//! ## Board
//! Every [`BoardTask`] corresponds to one analog output task on a physical card
//! (e.g. `PXI6259`). All channels of a board share one sample clock and one trigger source,
//! so their waveforms are compiled into a single 2D buffer of shape
//! `(n_channels, samples_per_chan * expand * repeat)`.
//!
//! ## Grouping
//! Channels are grouped by the board prefix of their address: `PXI6259/ao0` and `PXI6259/ao2`
//! land on the same board, `PXI6733/ao0` on another. [`BoardSet`] performs this grouping and
//! [`plan_boards`] builds the complete set for one channel of the microscope state.
//!
//! ## Templates
//! The `repeat` and `expand` factors come from the selected [`WaveformTemplate`]. Each row first
//! tiles its waveform over `samples_per_chan * expand` samples; the resulting pass is then
//! repeated `repeat` times.

use indexmap::IndexMap;
use ndarray::{s, Array2};
use tracing::debug;

use crate::channel::*;
use crate::config::{AcquisitionContext, GalvoWaveform};
use crate::error::{ConfigError, Result};
use crate::template::{lookup_template, WaveformTemplate};
use crate::timing::ChannelTiming;
use crate::utils::split_ao_address;
use crate::waveform::{sample_count, WaveformShape, WaveformSpec};

/// The `BaseBoard` trait defines the operations shared by every analog output board.
///
/// # Trait Methods and Their Functionality:
///
/// - **Field methods**: access to the board's channels, identifier, sample clock, sweep time
///   and waveform template.
///
/// - **Channel management**: [`BaseBoard::add_channel`] validates the waveform and the address
///   against the board prefix, and rejects duplicates.
///
/// - **Compilation**: [`BaseBoard::compile`] generates every channel's samples;
///   [`BaseBoard::build`] stacks them into the board buffer.
pub trait BaseBoard {
    // Immutable accessors (getters)
    fn channels(&self) -> &IndexMap<String, Channel>;
    fn board_id(&self) -> &str;
    fn samp_rate(&self) -> f64;
    fn sweep_time(&self) -> f64;
    fn template(&self) -> WaveformTemplate;

    // Mutable accessors
    fn channels_(&mut self) -> &mut IndexMap<String, Channel>;

    fn add_channel(&mut self, channel_name: &str, waveform: WaveformSpec) -> Result<()> {
        waveform.validate()?;
        let (board, _line) = split_ao_address(channel_name)?;
        if board != self.board_id() {
            return Err(ConfigError::ForeignChannel {
                board: self.board_id().to_string(),
                channel: channel_name.to_string(),
            });
        }
        if waveform.sample_rate != self.samp_rate() {
            return Err(ConfigError::InvalidSampleRate(waveform.sample_rate));
        }
        let channel = Channel::new(channel_name, waveform)?;
        if self.channels().contains_key(channel.physical_name()) {
            return Err(ConfigError::DuplicateChannel {
                board: self.board_id().to_string(),
                channel: channel_name.to_string(),
            });
        }
        self.channels_()
            .insert(channel.physical_name().to_string(), channel);
        Ok(())
    }

    /// Physical names of the channels, in buffer row order.
    fn physical_channels(&self) -> Vec<String> {
        self.channels().keys().cloned().collect()
    }

    fn samples_per_chan(&self) -> usize {
        sample_count(self.samp_rate(), self.sweep_time())
    }

    /// Samples per channel of one full buffer: `samples_per_chan * expand * repeat`.
    fn total_samps(&self) -> usize {
        let template = self.template();
        self.samples_per_chan() * template.expand * template.repeat
    }

    fn is_compiled(&self) -> bool {
        self.channels().values().all(|chan| chan.is_compiled())
    }

    fn clear_compile_cache(&mut self) {
        self.channels_()
            .values_mut()
            .for_each(|chan| chan.clear_compile_cache());
    }

    fn compile(&mut self) -> Result<()> {
        for chan in self.channels_().values_mut() {
            chan.compile()?;
        }
        Ok(())
    }

    /// Builds the board buffer.
    ///
    /// Every `samples_per_chan * expand` block of a row is identical, and every row holds
    /// `repeat` copies of that block.
    fn build(&mut self) -> Result<Array2<f64>> {
        self.compile()?;
        let nchan = self.channels().len();
        let pass = self.samples_per_chan() * self.template().expand;
        let total = self.total_samps();
        let mut buffer = Array2::zeros((nchan, total));
        for (row_idx, chan) in self.channels_().values_mut().enumerate() {
            let mut row = buffer.row_mut(row_idx);
            chan.fill_tiled(&mut row.slice_mut(s![..pass]))?;
            let first = row.slice(s![..pass]).to_owned();
            for rep in 1..total / pass.max(1) {
                row.slice_mut(s![rep * pass..(rep + 1) * pass]).assign(&first);
            }
        }
        debug!(
            board = self.board_id(),
            nchan,
            samps_per_chan = total,
            "built board buffer"
        );
        Ok(buffer)
    }
}

/// One analog output task on one physical board.
pub struct BoardTask {
    channels: IndexMap<String, Channel>,
    board_id: String,
    samp_rate: f64,
    sweep_time: f64,
    template: WaveformTemplate,
}

impl BoardTask {
    pub fn new(board_id: &str, samp_rate: f64, sweep_time: f64, template: WaveformTemplate) -> Self {
        Self {
            channels: IndexMap::new(),
            board_id: board_id.to_string(),
            samp_rate,
            sweep_time,
            template,
        }
    }
}

impl BaseBoard for BoardTask {
    fn channels(&self) -> &IndexMap<String, Channel> {
        &self.channels
    }

    fn board_id(&self) -> &str {
        &self.board_id
    }

    fn samp_rate(&self) -> f64 {
        self.samp_rate
    }

    fn sweep_time(&self) -> f64 {
        self.sweep_time
    }

    fn template(&self) -> WaveformTemplate {
        self.template
    }

    fn channels_(&mut self) -> &mut IndexMap<String, Channel> {
        &mut self.channels
    }
}

/// All boards driven during one channel's sweep, keyed by board id.
pub struct BoardSet {
    boards: IndexMap<String, BoardTask>,
    samp_rate: f64,
    sweep_time: f64,
    template: WaveformTemplate,
}

impl BoardSet {
    pub fn new(samp_rate: f64, sweep_time: f64, template: WaveformTemplate) -> Self {
        Self {
            boards: IndexMap::new(),
            samp_rate,
            sweep_time,
            template,
        }
    }

    /// Adds a channel to the board named by its address prefix, creating the board if needed.
    pub fn add_channel(&mut self, channel_name: &str, waveform: WaveformSpec) -> Result<()> {
        let (board_id, _line) = split_ao_address(channel_name)?;
        let (samp_rate, sweep_time, template) = (self.samp_rate, self.sweep_time, self.template);
        self.boards
            .entry(board_id.to_string())
            .or_insert_with(|| BoardTask::new(board_id, samp_rate, sweep_time, template))
            .add_channel(channel_name, waveform)
    }

    pub fn boards(&self) -> &IndexMap<String, BoardTask> {
        &self.boards
    }

    pub fn boards_(&mut self) -> &mut IndexMap<String, BoardTask> {
        &mut self.boards
    }

    pub fn board(&self, board_id: &str) -> Option<&BoardTask> {
        self.boards.get(board_id)
    }

    pub fn template(&self) -> WaveformTemplate {
        self.template
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    pub fn build_all(&mut self) -> Result<IndexMap<String, Array2<f64>>> {
        self.boards
            .iter_mut()
            .map(|(id, board)| -> Result<(String, Array2<f64>)> { Ok((id.clone(), board.build()?)) })
            .collect()
    }
}

/// Builds every board for `timing`'s channel from the galvo and remote-focus declarations.
///
/// `focus_offset` is added to the remote-focus ramp offset (live tuning and autofocus).
pub fn plan_boards(
    ctx: &AcquisitionContext,
    timing: &ChannelTiming,
    focus_offset: f64,
) -> Result<BoardSet> {
    let template = lookup_template(
        &ctx.waveform_templates,
        &ctx.microscope_state.waveform_template,
    )?;
    let rate = ctx.daq.sample_rate;
    let sweep = timing.sweep_time;
    let smoothing = ctx.waveform_constants.percent_smoothing;
    let mut boards = BoardSet::new(rate, sweep, template);

    for galvo in &ctx.galvos {
        let shape = match galvo.waveform {
            GalvoWaveform::Sawtooth => WaveformShape::Sawtooth {
                frequency: galvo.frequency,
                amplitude: galvo.amplitude,
                offset: galvo.offset,
                duty_cycle: galvo.duty_cycle,
                phase: galvo.phase,
            },
            GalvoWaveform::Sine => WaveformShape::Sine {
                frequency: galvo.frequency,
                amplitude: galvo.amplitude,
                offset: galvo.offset,
                phase: galvo.phase,
            },
            GalvoWaveform::Dc => WaveformShape::Dc {
                amplitude: galvo.amplitude,
                offset: galvo.offset,
            },
        };
        boards.add_channel(
            &galvo.physical_name,
            WaveformSpec::new(shape, rate, sweep, galvo.min_ao, galvo.max_ao),
        )?;
    }

    if let Some(rf) = &ctx.remote_focus {
        let chan = ctx.microscope_state.channel(&timing.channel_key)?;
        let ramp = rf.ramp_for(&chan.laser);
        let constants = &ctx.waveform_constants;
        let rf_delay = constants.remote_focus_delay_ms / 1000.;
        let fall = if ctx.camera_parameters.readout_direction.is_bidirectional() {
            0.
        } else {
            constants.remote_focus_ramp_falling_ms / 1000.
        };
        let rise = timing.exposure_time + timing.camera_delay - rf_delay;
        let delay_pct = 100. * rf_delay / sweep;
        let rise_pct = 100. * rise / sweep;
        // The fall is compressed into what is left of the sweep
        let fall_pct = (100. * fall / sweep).min((100. - delay_pct - rise_pct).max(0.));
        if fall_pct < 100. * fall / sweep {
            debug!(fall_pct, sweep, "remote-focus fall shortened to fit the sweep");
        }
        let shape = WaveformShape::TunableLensRamp {
            delay_pct,
            rise_pct,
            fall_pct,
            amplitude: ramp.amplitude,
            offset: ramp.offset + focus_offset,
        };
        boards.add_channel(
            &rf.physical_name,
            WaveformSpec::new(shape, rate, sweep, rf.min_ao, rf.max_ao).with_smoothing(smoothing),
        )?;
    }
    Ok(boards)
}

/// Board id of the remote-focus output, if one is declared.
pub fn remote_focus_board(ctx: &AcquisitionContext) -> Option<String> {
    ctx.remote_focus
        .as_ref()
        .and_then(|rf| split_ao_address(&rf.physical_name).ok())
        .map(|(board, _line)| board.to_string())
}

#[cfg(test)]
mod test {
    use crate::board::*;
    use crate::config::*;

    fn dc(value: f64) -> WaveformSpec {
        WaveformSpec::new(
            WaveformShape::Dc {
                amplitude: value,
                offset: 0.,
            },
            1e3,
            0.01,
            -10.,
            10.,
        )
    }

    fn ramp() -> WaveformSpec {
        WaveformSpec::new(
            WaveformShape::TunableLensRamp {
                delay_pct: 10.,
                rise_pct: 60.,
                fall_pct: 20.,
                amplitude: 2.,
                offset: 0.,
            },
            1e3,
            0.01,
            -10.,
            10.,
        )
    }

    #[test]
    fn add_channel_checks() {
        let mut board = BoardTask::new("Dev1", 1e3, 0.01, WaveformTemplate::default());
        board.add_channel("Dev1/ao0", dc(1.)).unwrap();
        assert!(matches!(
            board.add_channel("Dev1/ao0", dc(2.)),
            Err(ConfigError::DuplicateChannel { .. })
        ));
        assert!(matches!(
            board.add_channel("Dev2/ao0", dc(2.)),
            Err(ConfigError::ForeignChannel { .. })
        ));
        let mut fast = dc(1.);
        fast.sample_rate = 2e3;
        assert!(board.add_channel("Dev1/ao1", fast).is_err());
        assert_eq!(board.physical_channels(), vec!["Dev1/ao0".to_string()]);
    }

    #[test]
    fn build_shape() {
        let mut board = BoardTask::new("Dev1", 1e3, 0.01, WaveformTemplate::new(2, 3));
        board.add_channel("Dev1/ao0", dc(1.)).unwrap();
        board.add_channel("Dev1/ao1", ramp()).unwrap();
        assert_eq!(board.samples_per_chan(), 10);
        assert_eq!(board.total_samps(), 60);

        let buffer = board.build().unwrap();
        assert_eq!(buffer.shape(), &[2, 60]);
        assert!(board.is_compiled());
        assert!(buffer.row(0).iter().all(|&v| v == 1.));
        let base = ramp().generate().unwrap();
        for block in 0..6 {
            assert_eq!(buffer.slice(s![1, block * 10..(block + 1) * 10]), base);
        }
    }

    #[test]
    fn repeat_triples_the_buffer() {
        let mut single = BoardTask::new("Dev1", 1e3, 0.01, WaveformTemplate::new(1, 1));
        single.add_channel("Dev1/ao0", ramp()).unwrap();
        let base = single.build().unwrap();

        let mut triple = BoardTask::new("Dev1", 1e3, 0.01, WaveformTemplate::new(3, 1));
        triple.add_channel("Dev1/ao0", ramp()).unwrap();
        let tiled = triple.build().unwrap();

        assert_eq!(tiled.ncols(), 3 * base.ncols());
        let n = base.ncols();
        for third in 0..3 {
            let part = tiled.slice(s![.., third * n..(third + 1) * n]);
            assert!(part
                .iter()
                .zip(base.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits()));
        }
    }

    #[test]
    fn board_set_groups_by_prefix() {
        let mut set = BoardSet::new(1e3, 0.01, WaveformTemplate::default());
        set.add_channel("PXI6259/ao0", dc(1.)).unwrap();
        set.add_channel("PXI6733/ao0", dc(2.)).unwrap();
        set.add_channel("PXI6259/ao2", ramp()).unwrap();
        assert_eq!(set.boards().len(), 2);
        assert_eq!(set.board("PXI6259").unwrap().channels().len(), 2);

        let buffers = set.build_all().unwrap();
        assert_eq!(buffers["PXI6259"].shape(), &[2, 10]);
        assert_eq!(buffers["PXI6733"].shape(), &[1, 10]);
    }

    #[test]
    fn plan_from_context() {
        let mut ctx = AcquisitionContext::default();
        ctx.daq.sample_rate = 1e4;
        ctx.galvos.push(GalvoConfig::default());
        ctx.remote_focus = Some(RemoteFocusConfig::default());
        ctx.microscope_state
            .channels
            .insert("channel_1".to_string(), ChannelSettings::default());
        ctx.microscope_state.waveform_template = "Confocal-Projection".to_string();

        let timing = ChannelTiming::new("channel_1", 0.1, 0.01, 0.115, 0.002, 0.004).unwrap();
        let mut boards = plan_boards(&ctx, &timing, 0.5).unwrap();
        assert_eq!(boards.template(), WaveformTemplate::new(5, 1));
        assert_eq!(remote_focus_board(&ctx).as_deref(), Some("PXI6259"));

        let board = boards.boards_().get_mut("PXI6259").unwrap();
        assert_eq!(board.physical_channels(), vec!["PXI6259/ao0", "PXI6259/ao2"]);
        let buffer = board.build().unwrap();
        assert_eq!(buffer.shape(), &[2, 1150 * 5]);
        // Ramp baseline: offset 2.5 + 0.5 focus offset - amplitude / 2
        assert!((buffer[[1, 0]] - 2.5).abs() < 1e-9);
    }

    #[test]
    fn light_sheet_ramp_fits_the_sweep() {
        use crate::timing::CameraTiming;

        struct RowCamera;
        impl CameraTiming for RowCamera {
            fn readout_time(&self) -> f64 {
                0.01
            }
            fn light_sheet_exposure(&self, exposure_time: f64, rows: usize) -> crate::error::Result<f64> {
                Ok(exposure_time + rows as f64 * 1e-5)
            }
        }

        let mut ctx = AcquisitionContext::default();
        ctx.daq.sample_rate = 1e4;
        ctx.remote_focus = Some(RemoteFocusConfig::default());
        ctx.camera_parameters.sensor_mode = SensorMode::LightSheet;
        ctx.microscope_state
            .channels
            .insert("channel_1".to_string(), ChannelSettings::default());

        // No readout: the 5 ms ramp falling margin follows the 120.48 ms exposure
        let timing = ChannelTiming::from_context(&ctx, "channel_1", &RowCamera).unwrap();
        assert!((timing.sweep_time - 0.12548).abs() < 1e-12);

        let mut boards = plan_boards(&ctx, &timing, 0.).unwrap();
        let buffers = boards.build_all().unwrap();
        let ramp = buffers["PXI6259"].row(0);
        assert_eq!(ramp.len(), 1255);
        let peak = ramp.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!((peak - 3.).abs() < 1e-9);
        assert!(ramp.iter().all(|&v| (2. - 1e-9..=3. + 1e-9).contains(&v)));
    }

    #[test]
    fn plan_rejects_unknown_template() {
        let mut ctx = AcquisitionContext::default();
        ctx.microscope_state.waveform_template = "Nope".to_string();
        let timing = ChannelTiming::new("channel_1", 0.1, 0.01, 0.11, 0.002, 0.004).unwrap();
        assert!(matches!(
            plan_boards(&ctx, &timing, 0.),
            Err(ConfigError::UnknownTemplate(_))
        ));
    }
}
