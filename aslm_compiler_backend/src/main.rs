use aslm_compiler_backend::*;

struct FixedReadout(f64);
impl CameraTiming for FixedReadout {
    fn readout_time(&self) -> f64 {
        self.0
    }
}

fn main() -> Result<()> {
    let mut ctx = AcquisitionContext::default();
    ctx.galvos.push(GalvoConfig::default());
    ctx.remote_focus = Some(RemoteFocusConfig::default());
    ctx.microscope_state
        .channels
        .insert("channel_1".to_string(), ChannelSettings::default());

    let timing = ChannelTiming::from_context(&ctx, "channel_1", &FixedReadout(0.01))?;
    let mut boards = plan_boards(&ctx, &timing, 0.)?;
    println!(
        "sweep {:.4} s, camera pulse {:?}",
        timing.sweep_time,
        timing.camera_pulse(ctx.has_analog_outputs(), boards.template().frames())
    );
    for (board_id, buffer) in boards.build_all()? {
        println!("{}: {:?}", board_id, buffer.shape());
    }
    Ok(())
}
