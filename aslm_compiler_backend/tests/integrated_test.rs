use aslm_compiler_backend::*;

use approx::assert_abs_diff_eq;
use rstest::rstest;

struct FixedReadout(f64);
impl CameraTiming for FixedReadout {
    fn readout_time(&self) -> f64 {
        self.0
    }
}

const CONTEXT: &str = r#"
    [daq]
    sample_rate = 20000.0

    [camera]
    delay_ms = 2.0
    high_time_ms = 4.0

    [waveform_constants]
    remote_focus_ramp_falling_ms = 0.0

    [[galvos]]
    physical_name = "PXI6259/ao0"
    frequency = 50.0
    amplitude = 0.5

    [remote_focus]
    physical_name = "PXI6733/ao0"
    min_ao = 0.0
    max_ao = 5.0
    [remote_focus.ramp]
    amplitude = 1.0
    offset = 2.5

    [microscope_state.channels.channel_1]
    camera_exposure_time_ms = 100.0
"#;

#[test]
fn end_to_end_normal_mode() {
    let ctx = AcquisitionContext::from_toml_str(CONTEXT).unwrap();
    let timing = ChannelTiming::from_context(&ctx, "channel_1", &FixedReadout(0.01)).unwrap();

    // The 2 ms camera delay is the longest margin
    assert_abs_diff_eq!(timing.sweep_time, 0.112, epsilon = 1e-12);
    let (start, end) = timing.trigger_window();
    assert_abs_diff_eq!(start, 0.002, epsilon = 1e-12);
    assert_abs_diff_eq!(end, 0.006, epsilon = 1e-12);
    assert!(0. < start && end < timing.sweep_time);

    let mut boards = plan_boards(&ctx, &timing, 0.).unwrap();
    let buffers = boards.build_all().unwrap();
    assert_eq!(buffers.len(), 2);
    for buffer in buffers.values() {
        assert_eq!(buffer.shape(), &[1, 2240]);
    }
    // Galvo sawtooth stays inside its amplitude, ramp inside the remote-focus range
    assert!(buffers["PXI6259"].iter().all(|v| v.abs() <= 0.5 + 1e-12));
    assert!(buffers["PXI6733"]
        .iter()
        .all(|&v| (2.0 - 1e-9..=3.0 + 1e-9).contains(&v)));
}

#[rstest]
#[case("Default", 1)]
#[case("Confocal-Projection", 5)]
fn template_scales_buffer(#[case] template: &str, #[case] frames: usize) {
    let mut ctx = AcquisitionContext::from_toml_str(CONTEXT).unwrap();
    ctx.microscope_state.waveform_template = template.to_string();
    let timing = ChannelTiming::from_context(&ctx, "channel_1", &FixedReadout(0.01)).unwrap();
    let mut boards = plan_boards(&ctx, &timing, 0.).unwrap();
    assert_eq!(boards.template().frames(), frames);

    let board = boards.boards_().get_mut("PXI6733").unwrap();
    assert_eq!(board.total_samps(), 2240 * frames);
    assert_eq!(board.build().unwrap().ncols(), 2240 * frames);

    let pulse = timing.camera_pulse(true, frames);
    assert_eq!(pulse.pulses, frames);
}

#[test]
fn ramp_delay_past_the_exposure_fails_before_any_buffer() {
    let mut ctx = AcquisitionContext::from_toml_str(CONTEXT).unwrap();
    let timing = ChannelTiming::from_context(&ctx, "channel_1", &FixedReadout(0.01)).unwrap();
    // The ramp would have to start after the sweep ends
    ctx.waveform_constants.remote_focus_delay_ms = 150.;
    assert!(matches!(
        plan_boards(&ctx, &timing, 0.),
        Err(ConfigError::InvalidParameter { .. })
    ));
}

#[test]
fn long_ramp_falling_is_compressed_into_the_sweep() {
    let mut ctx = AcquisitionContext::from_toml_str(CONTEXT).unwrap();
    let timing = ChannelTiming::from_context(&ctx, "channel_1", &FixedReadout(0.01)).unwrap();
    ctx.waveform_constants.remote_focus_ramp_falling_ms = 60.;
    let mut boards = plan_boards(&ctx, &timing, 0.).unwrap();
    let buffers = boards.build_all().unwrap();
    assert_eq!(buffers["PXI6733"].shape(), &[1, 2240]);
}
