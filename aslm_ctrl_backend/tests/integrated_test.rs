use std::sync::Arc;
use std::time::Duration;

use aslm_compiler_backend::{AcquisitionContext, Axis, ConfigError, WaveformTemplate};
use aslm_ctrl_backend::autofocus::{autofocus, AutofocusPlan, RemoteFocus, StageFocus};
use aslm_ctrl_backend::cva::constant_velocity;
use aslm_ctrl_backend::devices::Stage;
use aslm_ctrl_backend::metric::MeanIntensity;
use aslm_ctrl_backend::sim::{SimDaq, SimEvent};
use aslm_ctrl_backend::synthetic::{Scene, SyntheticCamera, SyntheticStage};
use aslm_ctrl_backend::*;

use approx::assert_abs_diff_eq;
use ndarray::Array2;

const CONTEXT: &str = r#"
    [daq]
    sample_rate = 10000.0
    external_trigger = "/PXI6259/PFI1"

    [camera]
    delay_ms = 2.0
    high_time_ms = 4.0

    [waveform_constants]
    remote_focus_ramp_falling_ms = 0.0

    [[galvos]]
    physical_name = "PXI6259/ao0"
    waveform = "dc"
    amplitude = 1.0

    [remote_focus]
    physical_name = "PXI6733/ao0"
    min_ao = 0.0
    max_ao = 5.0
    ramp = { amplitude = 1.0, offset = 2.5 }

    [microscope_state]
    step_size = 0.16
    abs_z_start = 100.0
    abs_z_end = 102.5

    [microscope_state.channels.channel_1]
    camera_exposure_time_ms = 100.0

    [autofocus]
    coarse_range = 40.0
    coarse_step_size = 10.0
    fine_range = 10.0
    fine_step_size = 2.0
"#;

fn fast() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(2),
        camera_wait_iterations: 1000,
        max_unmatched_polls: 50,
    }
}

/// Coordinator on the simulated DAQ, with `camera` capturing one frame per trigger pulse.
fn rig(
    ctx: &str,
    camera: Arc<SyntheticCamera>,
) -> (Arc<AcquisitionCoordinator<SimDaq>>, SimDaq) {
    let ctx = AcquisitionContext::from_toml_str(ctx).unwrap().into_shared();
    let daq = SimDaq::new();
    let pulse_camera = camera.clone();
    daq.on_pulse_train(move |pulses| {
        for _ in 0..pulses {
            pulse_camera.capture();
        }
    });
    (
        Arc::new(AcquisitionCoordinator::new(daq.clone(), ctx, camera)),
        daq,
    )
}

fn uniform(value: f64) -> Array2<u16> {
    Array2::from_elem((8, 8), value.max(0.) as u16)
}

#[test]
fn stage_autofocus_through_the_coordinator() {
    let stage = Arc::new(SyntheticStage::new());
    let scene_stage = stage.clone();
    let scene: Scene = Box::new(move |_| {
        let position = scene_stage.get_axis_position(Axis::F).unwrap_or(0.);
        uniform(1000. - (position - 7.5).powi(2))
    });
    let camera = Arc::new(SyntheticCamera::with_scene(50, scene));
    let (coordinator, daq) = rig(CONTEXT, camera.clone());
    coordinator.prepare("channel_1").unwrap();

    let session = AcquisitionSession::new(camera.clone(), coordinator.clone()).with_config(fast());
    let plan = AutofocusPlan::from_parameters(&coordinator.context().read().autofocus).unwrap();
    let (events, rx) = EventSender::channel();
    let (signal, data) = autofocus(
        plan,
        StageFocus::new(stage.clone(), Axis::F),
        Box::new(MeanIntensity),
        events,
        session.config(),
    );
    let report = session.run(signal, data).unwrap();

    // Coarse -20..20 picks 10, fine 4..14 picks 8
    assert_eq!(stage.get_axis_position(Axis::F), Ok(8.));
    assert_eq!(report.passes, 11);
    assert_eq!(camera.captured(), 11);
    assert!(coordinator.is_armed());
    let fired = daq
        .events()
        .iter()
        .filter(|e| {
            matches!(e, SimEvent::DigitalWrite { pattern, .. } if pattern == &[false, true, true, true, false])
        })
        .count();
    assert_eq!(fired, 11);
    assert!(rx
        .try_iter()
        .any(|e| e == ModelEvent::UpdateStage([(Axis::F, 8.)].into_iter().collect())));
}

/// Remote-focus offset last written to the remote-focus board: its first sample sits at
/// `ramp.offset - ramp.amplitude / 2 + focus_offset`.
fn written_offset(daq: &SimDaq) -> f64 {
    daq.events()
        .into_iter()
        .rev()
        .find_map(|e| match e {
            SimEvent::AnalogWrite { task, buffer } if task == "PXI6733_ao" => Some(buffer[[0, 0]]),
            _ => None,
        })
        .map_or(0., |first| first - 2.)
}

#[test]
fn remote_focus_autofocus_rewrites_the_focus_board() {
    let ctx = CONTEXT.replace("fine_range = 10.0", "fine_range = 0.04").replace(
        "coarse_range = 40.0\n    coarse_step_size = 10.0",
        "coarse_range = 0.4\n    coarse_step_size = 0.1",
    );
    let ctx = ctx.replace("fine_step_size = 2.0", "fine_step_size = 0.02");

    // The scene needs the DAQ log, which only exists once the rig is built
    let daq_slot: Arc<parking_lot::Mutex<Option<SimDaq>>> = Arc::new(parking_lot::Mutex::new(None));
    let scene_daq = daq_slot.clone();
    let scene: Scene = Box::new(move |_| {
        let offset = scene_daq.lock().as_ref().map_or(0., written_offset);
        uniform(1000. - 1e4 * (offset - 0.1).powi(2))
    });
    let camera = Arc::new(SyntheticCamera::with_scene(50, scene));
    let (coordinator, daq) = rig(&ctx, camera.clone());
    *daq_slot.lock() = Some(daq.clone());
    coordinator.prepare("channel_1").unwrap();

    let session = AcquisitionSession::new(camera, coordinator.clone()).with_config(fast());
    let plan = AutofocusPlan::from_parameters(&coordinator.context().read().autofocus).unwrap();
    let (signal, data) = autofocus(
        plan,
        RemoteFocus::new(coordinator.clone()),
        Box::new(MeanIntensity),
        EventSender::disconnected(),
        session.config(),
    );
    session.run(signal, data).unwrap();

    assert_abs_diff_eq!(coordinator.focus_offset(), 0.1, epsilon = 1e-9);
    assert_abs_diff_eq!(written_offset(&daq), 0.1, epsilon = 1e-9);
    assert!(coordinator.is_armed());
}

#[test]
fn constant_velocity_scan_uses_the_encoder_trigger() {
    let camera = Arc::new(SyntheticCamera::new(50));
    let (coordinator, daq) = rig(CONTEXT, camera.clone());
    let stage = Arc::new(SyntheticStage::new());

    let session = AcquisitionSession::new(camera.clone(), coordinator.clone()).with_config(fast());
    let (signal, data) = constant_velocity(coordinator.clone(), stage.clone(), "channel_1");
    let report = session.run(signal, data).unwrap();

    // 2.5 um of travel in 0.24 um encoder steps
    assert_eq!(report.frames, 11);
    assert_eq!(report.passes, 1);
    assert_eq!(camera.captured(), 11);

    let scan = stage.scan_range().unwrap();
    assert_eq!(scan.axis, Axis::Z);
    assert_abs_diff_eq!(scan.start_mm, 0.1, epsilon = 1e-12);
    assert_abs_diff_eq!(scan.end_mm, 0.1025, epsilon = 1e-12);
    assert_abs_diff_eq!(scan.enc_divide, 2.4e-4, epsilon = 1e-12);
    assert!(!stage.is_scanning());
    assert_eq!(stage.speed_percent(), 0.5);

    let events = daq.events();
    assert!(events.contains(&SimEvent::TriggerSource {
        task: "camera_trigger".to_string(),
        source: "/PXI6259/PFI1".to_string(),
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SimEvent::DigitalWrite { .. })));
    let scan_buffer = events.iter().find_map(|e| match e {
        SimEvent::AnalogWrite { task, buffer } if task == "PXI6733_ao" => Some(buffer.dim()),
        _ => None,
    });
    assert_eq!(scan_buffer, Some((1, 11 * 1120)));

    // Everything is restored for stepped acquisitions
    assert_eq!(coordinator.state(), CoordinatorState::Idle);
    assert_eq!(coordinator.trigger_mode(), TriggerMode::SelfTrigger);
    assert_eq!(daq.open_tasks(), 0);
    let ctx = coordinator.context().read();
    assert_eq!(ctx.microscope_state.waveform_template, "Default");
    assert_eq!(ctx.waveform_templates["CVACONPRO"], WaveformTemplate::new(1, 11));
    assert_eq!(ctx.microscope_state.number_z_steps, 11);
}

#[test]
fn constant_velocity_rejects_a_stage_that_cannot_move() {
    let camera = Arc::new(SyntheticCamera::new(50));
    let (coordinator, daq) = rig(CONTEXT, camera.clone());
    let stage = Arc::new(SyntheticStage::new().with_max_speed(0.));

    let session = AcquisitionSession::new(camera.clone(), coordinator.clone()).with_config(fast());
    let (signal, data) = constant_velocity(coordinator.clone(), stage.clone(), "channel_1");
    assert_eq!(
        session.run(signal, data),
        Err(AcquisitionError::Config(ConfigError::InvalidParameter {
            name: "stage max speed",
            value: 0.,
        }))
    );
    assert_eq!(camera.captured(), 0);
    assert!(!stage.is_scanning());
    assert_eq!(coordinator.trigger_mode(), TriggerMode::SelfTrigger);
    assert_eq!(daq.open_tasks(), 0);
}

