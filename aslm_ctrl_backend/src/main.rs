use std::sync::Arc;

use aslm_compiler_backend::{AcquisitionContext, ConfigError};
use aslm_ctrl_backend::autofocus::{autofocus, AutofocusPlan, StageFocus};
use aslm_ctrl_backend::devices::Stage;
use aslm_ctrl_backend::metric::{DctsEntropy, FrameMetric, TissueFraction};
use aslm_ctrl_backend::sim::SimDaq;
use aslm_ctrl_backend::synthetic::{SyntheticCamera, SyntheticStage};
use aslm_ctrl_backend::*;
use ndarray::Array2;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_CONTEXT: &str = r#"
    [daq]
    sample_rate = 10000.0

    [[galvos]]
    physical_name = "PXI6259/ao0"
    waveform = "sine"
    frequency = 99.9
    amplitude = 0.5

    [remote_focus]
    physical_name = "PXI6733/ao0"
    min_ao = 0.0
    max_ao = 5.0
    ramp = { amplitude = 1.0, offset = 2.5 }

    [microscope_state.channels.channel_1]
    camera_exposure_time_ms = 100.0
"#;

/// Focal plane of the synthetic sample on the focus axis.
const SAMPLE_FOCUS: f64 = 37.;

// Vertical stripes whose contrast fades away from the focal plane
fn stripes(position: f64) -> Array2<u16> {
    let defocus = (position - SAMPLE_FOCUS) / 40.;
    let contrast = 400. / (1. + defocus * defocus);
    Array2::from_shape_fn((64, 64), |(_, x)| {
        (1000. + contrast * (2. * std::f64::consts::PI * x as f64 / 8.).cos()) as u16
    })
}

fn load_context() -> Result<AcquisitionContext> {
    let text = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|err| ConfigError::Parse(format!("{}: {}", path, err)))?,
        None => DEMO_CONTEXT.to_string(),
    };
    Ok(AcquisitionContext::from_toml_str(&text)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let ctx = load_context()?.into_shared();
    let focus_axis = ctx.read().stage.focus_axis;
    let stage = Arc::new(SyntheticStage::new());
    stage.move_axis_absolute(focus_axis, 0., true)?;

    let scene_stage = stage.clone();
    let camera = Arc::new(SyntheticCamera::with_scene(
        100,
        Box::new(move |_| stripes(scene_stage.get_axis_position(focus_axis).unwrap_or(0.))),
    ));
    let daq = SimDaq::new();
    let pulse_camera = camera.clone();
    daq.on_pulse_train(move |pulses| {
        for _ in 0..pulses {
            pulse_camera.capture();
        }
    });

    let coordinator = Arc::new(AcquisitionCoordinator::new(daq, ctx.clone(), camera.clone()));
    let channel_key = ctx
        .read()
        .microscope_state
        .selected_channels()
        .next()
        .map(|(key, _)| key.clone())
        .ok_or_else(|| ConfigError::UnknownChannel("<none selected>".to_string()))?;
    coordinator.prepare(&channel_key)?;

    let session = AcquisitionSession::new(camera, coordinator.clone());
    let plan = AutofocusPlan::from_parameters(&ctx.read().autofocus)?;
    let (events, rx) = EventSender::channel();
    let (signal, data) = autofocus(
        plan,
        StageFocus::new(stage.clone(), focus_axis),
        Box::new(DctsEntropy::default()),
        events,
        session.config(),
    );
    let report = session.run(signal, data)?;

    for event in rx.try_iter() {
        match event {
            ModelEvent::Autofocus {
                plot_data,
                is_fit,
                is_done,
            } => info!(points = plot_data.len(), is_fit, is_done, "autofocus curve"),
            ModelEvent::UpdateStage(positions) => info!(?positions, "stage update"),
            ModelEvent::Warning(message) => warn!("{}", message),
        }
    }
    let focus = stage.get_axis_position(focus_axis)?;
    info!(
        focus,
        passes = report.passes,
        frames = report.frames,
        "autofocus finished"
    );
    let coverage = TissueFraction { threshold: 1100 }.score(stripes(focus).view());
    info!(coverage, "sample coverage at focus");
    coordinator.stop();
    Ok(())
}
