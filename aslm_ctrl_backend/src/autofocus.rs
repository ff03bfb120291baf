//! Coarse/fine autofocus.
//!
//! The signal side sweeps the focus target through a coarse grid centred on the current focus,
//! waits for the data side to report the sharpest position, then sweeps a fine grid centred on
//! that position and finally moves to the best fine position. Each grid is one *group* of frame
//! records; the data side scores every frame with a [`FrameMetric`] and closes a group when the
//! record with `remaining == 1` has been paired (or dropped as lost).

use std::sync::Arc;
use std::time::Duration;

use aslm_compiler_backend::{AutoFocusParameters, Axis, ConfigError};
use maplit::hashmap;
use tracing::{debug, info, warn};

use crate::coordinator::AcquisitionCoordinator;
use crate::daq::DaqBackend;
use crate::devices::{Camera, DeviceError, Stage};
use crate::error::Result;
use crate::events::{EventSender, ModelEvent};
use crate::feature::{DataFeature, DataStatus, SessionConfig, SignalFeature, SignalStatus, StopFlag};
use crate::frame_queue::{FrameMatcher, FrameQueue, FrameRecord, ResultQueue};
use crate::metric::FrameMetric;

/// Bound on the wait for a group verdict, per frame of the group.
const VERDICT_WAIT_PER_FRAME: Duration = Duration::from_secs(10);

/// Number of positions and starting offset of a sweep of `range` in steps of `step_size`.
///
/// The sweep starts at `focus - offset` and adds `step_size` before every frame, so the
/// positions are centred on the focus.
pub fn get_steps(range: f64, step_size: f64) -> Result<(usize, f64)> {
    if !(step_size > 0.) {
        return Err(ConfigError::InvalidParameter {
            name: "autofocus step size",
            value: step_size,
        }
        .into());
    }
    if !(range >= 0.) {
        return Err(ConfigError::InvalidParameter {
            name: "autofocus range",
            value: range,
        }
        .into());
    }
    let steps = (range / step_size).floor() as usize + 1;
    let offset = (steps / 2) as f64 * step_size + step_size;
    Ok((steps, offset))
}

#[derive(Clone, Debug, PartialEq)]
pub struct AutofocusPlan {
    pub coarse_steps: usize,
    pub coarse_step: f64,
    pub coarse_offset: f64,
    pub fine_steps: usize,
    pub fine_step: f64,
    pub fine_offset: f64,
    pub robust_fit: bool,
}

impl AutofocusPlan {
    pub fn from_parameters(params: &AutoFocusParameters) -> Result<Self> {
        let (coarse_steps, coarse_offset) = if params.coarse_selected {
            get_steps(params.coarse_range, params.coarse_step_size)?
        } else {
            (0, 0.)
        };
        let (fine_steps, fine_offset) = if params.fine_selected {
            get_steps(params.fine_range, params.fine_step_size)?
        } else {
            (0, 0.)
        };
        Ok(Self {
            coarse_steps,
            coarse_step: params.coarse_step_size,
            coarse_offset,
            fine_steps,
            fine_step: params.fine_step_size,
            fine_offset,
            robust_fit: params.robust_fit,
        })
    }

    pub fn total_steps(&self) -> usize {
        self.coarse_steps + self.fine_steps
    }

    pub fn groups(&self) -> usize {
        usize::from(self.coarse_steps > 0) + usize::from(self.fine_steps > 0)
    }
}

/// What autofocus moves: a stage axis or the remote-focus offset.
pub trait FocusActuator: Send {
    fn position(&self) -> Result<f64>;
    fn move_to(&self, position: f64) -> Result<()>;

    /// Stage axis reported in the final `UpdateStage` event.
    fn axis(&self) -> Option<Axis> {
        None
    }
}

pub struct StageFocus {
    stage: Arc<dyn Stage>,
    axis: Axis,
}

impl StageFocus {
    pub fn new(stage: Arc<dyn Stage>, axis: Axis) -> Self {
        Self { stage, axis }
    }
}

impl FocusActuator for StageFocus {
    fn position(&self) -> Result<f64> {
        Ok(self.stage.get_axis_position(self.axis)?)
    }

    fn move_to(&self, position: f64) -> Result<()> {
        if self.stage.move_axis_absolute(self.axis, position, true)? {
            Ok(())
        } else {
            Err(DeviceError::Hardware(format!(
                "Move of axis {} to {} did not complete",
                self.axis, position
            ))
            .into())
        }
    }

    fn axis(&self) -> Option<Axis> {
        Some(self.axis)
    }
}

/// Focuses with the remote-focus offset, rewriting the remote-focus buffer at every move.
pub struct RemoteFocus<B: DaqBackend> {
    coordinator: Arc<AcquisitionCoordinator<B>>,
}

impl<B: DaqBackend> RemoteFocus<B> {
    pub fn new(coordinator: Arc<AcquisitionCoordinator<B>>) -> Self {
        Self { coordinator }
    }
}

impl<B: DaqBackend> FocusActuator for RemoteFocus<B> {
    fn position(&self) -> Result<f64> {
        Ok(self.coordinator.focus_offset())
    }

    fn move_to(&self, position: f64) -> Result<()> {
        if !self.coordinator.set_focus_offset(position)? {
            debug!(offset = position, "focus offset stored, no remote-focus task rewritten");
        }
        Ok(())
    }
}

/// Least-squares parabola `a x^2 + b x + c` through `points`, as `(a, b, c)`.
pub fn fit_parabola(points: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    // Centre x to keep the normal equations well conditioned
    let mean = points.iter().map(|(x, _)| x).sum::<f64>() / points.len() as f64;
    let mut s = [0.; 5];
    let mut t = [0.; 3];
    for &(x, y) in points {
        let x = x - mean;
        let mut xk = 1.;
        for k in 0..5 {
            s[k] += xk;
            if k < 3 {
                t[k] += xk * y;
            }
            xk *= x;
        }
    }
    let m = [[s[4], s[3], s[2]], [s[3], s[2], s[1]], [s[2], s[1], s[0]]];
    let rhs = [t[2], t[1], t[0]];
    let det = det3(&m);
    if det.abs() < f64::EPSILON * s[4].abs().max(1.) {
        return None;
    }
    let solve = |col: usize| {
        let mut mc = m;
        for row in 0..3 {
            mc[row][col] = rhs[row];
        }
        det3(&mc) / det
    };
    let (a, b, c) = (solve(0), solve(1), solve(2));
    // Undo the centring
    Some((a, b - 2. * a * mean, a * mean * mean - b * mean + c))
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Vertex of the fitted parabola, if it is a maximum lying inside the swept positions.
pub fn robust_focus(points: &[(f64, f64)]) -> Option<f64> {
    let (a, b, _) = fit_parabola(points)?;
    if !(a < 0.) {
        return None;
    }
    let vertex = -b / (2. * a);
    let (lo, hi) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| {
            (lo.min(x), hi.max(x))
        });
    (lo..=hi).contains(&vertex).then_some(vertex)
}

pub struct AutofocusSignal<F: FocusActuator> {
    plan: AutofocusPlan,
    actuator: F,
    queue: Arc<FrameQueue>,
    results: ResultQueue,
    poll_interval: Duration,
    signal_id: usize,
    position: f64,
    start_position: f64,
    coarse_resolved: bool,
    finished: bool,
}

impl<F: FocusActuator> AutofocusSignal<F> {
    pub fn frame_queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    fn wait_verdict(&self, frames: usize, stop: &StopFlag) -> Result<Option<f64>> {
        let timeout = VERDICT_WAIT_PER_FRAME * frames.max(1) as u32;
        self.results.get(stop, self.poll_interval, timeout)
    }
}

impl<F: FocusActuator> SignalFeature for AutofocusSignal<F> {
    fn name(&self) -> &str {
        "autofocus"
    }

    fn init(&mut self) -> Result<()> {
        self.start_position = self.actuator.position()?;
        let offset = if self.plan.coarse_steps > 0 {
            self.plan.coarse_offset
        } else {
            self.plan.fine_offset
        };
        self.position = self.start_position - offset;
        info!(
            start = self.start_position,
            coarse_steps = self.plan.coarse_steps,
            fine_steps = self.plan.fine_steps,
            "autofocus started"
        );
        Ok(())
    }

    fn step(&mut self, frame_id: usize, stop: &StopFlag) -> Result<SignalStatus> {
        let plan = &self.plan;
        let total = plan.total_steps();
        if self.signal_id == total {
            if total == 0 {
                self.finished = true;
                return Ok(SignalStatus::Done);
            }
            let last_group = if plan.fine_steps > 0 { plan.fine_steps } else { plan.coarse_steps };
            if let Some(best) = self.wait_verdict(last_group, stop)? {
                self.actuator.move_to(best)?;
                self.finished = true;
                info!(focus = best, "autofocus done");
            }
            return Ok(SignalStatus::Done);
        }

        if self.signal_id == plan.coarse_steps && plan.coarse_steps > 0 && !self.coarse_resolved {
            match self.wait_verdict(plan.coarse_steps, stop)? {
                Some(best) => {
                    debug!(best, "coarse sweep resolved");
                    self.position = best - plan.fine_offset;
                    self.coarse_resolved = true;
                }
                None => return Ok(SignalStatus::Done),
            }
        }

        let (step, remaining) = if self.signal_id < plan.coarse_steps {
            (plan.coarse_step, plan.coarse_steps - self.signal_id)
        } else {
            (plan.fine_step, total - self.signal_id)
        };
        self.position += step;
        self.actuator.move_to(self.position)?;
        self.queue.push(FrameRecord {
            frame_id,
            remaining,
            parameter: self.position,
        });
        self.signal_id += 1;
        Ok(SignalStatus::Continue { trigger: true })
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.finished {
            warn!(start = self.start_position, "autofocus interrupted, restoring focus");
            self.actuator.move_to(self.start_position)?;
        }
        Ok(())
    }
}

pub struct AutofocusData {
    matcher: FrameMatcher,
    results: ResultQueue,
    metric: Box<dyn FrameMetric>,
    events: EventSender,
    robust_fit: bool,
    axis: Option<Axis>,
    groups_left: usize,
    group: Vec<(f64, f64)>,
    group_positions: Vec<f64>,
    best: Option<(f64, f64)>,
    plot_data: Vec<(f64, f64)>,
    last_fit: bool,
    focus: Option<f64>,
}

impl AutofocusData {
    fn score(&mut self, record: &FrameRecord, camera: &dyn Camera) -> Result<()> {
        let frame = camera.frame(record.frame_id)?;
        let value = self.metric.score(frame.view());
        debug!(frame_id = record.frame_id, position = record.parameter, value, "frame scored");
        self.group.push((record.parameter, value));
        if self.best.map_or(true, |(_, best)| value > best) {
            self.best = Some((record.parameter, value));
        }
        Ok(())
    }

    fn close_group(&mut self) {
        let fit = if self.robust_fit {
            robust_focus(&self.group)
        } else {
            None
        };
        let target = match (fit, self.best) {
            (Some(vertex), _) => vertex,
            (None, Some((position, _))) => position,
            (None, None) => {
                let centre = self.group_positions.iter().sum::<f64>()
                    / self.group_positions.len().max(1) as f64;
                warn!(centre, "no frame of the group was scored, keeping the sweep centre");
                self.events.send(ModelEvent::Warning(
                    "Autofocus received no frame for a sweep".to_string(),
                ));
                centre
            }
        };
        info!(target, fitted = fit.is_some(), points = self.group.len(), "autofocus group closed");
        self.results.put(target);
        self.events.send(ModelEvent::Autofocus {
            plot_data: self.group.clone(),
            is_fit: fit.is_some(),
            is_done: false,
        });
        self.plot_data.append(&mut self.group);
        self.group_positions.clear();
        self.best = None;
        self.last_fit = fit.is_some();
        self.focus = Some(target);
        self.groups_left = self.groups_left.saturating_sub(1);
    }

    fn finish(&mut self) {
        self.events.send(ModelEvent::Autofocus {
            plot_data: std::mem::take(&mut self.plot_data),
            is_fit: self.last_fit,
            is_done: true,
        });
        if let (Some(axis), Some(focus)) = (self.axis, self.focus) {
            self.events.send(ModelEvent::UpdateStage(hashmap! { axis => focus }));
        }
    }
}

impl DataFeature for AutofocusData {
    fn consume(&mut self, ready: &[usize], camera: &dyn Camera) -> Result<DataStatus> {
        if self.groups_left == 0 {
            return Ok(DataStatus::Done);
        }
        let outcome = self.matcher.poll(ready);
        for record in &outcome.lost {
            self.events.send(ModelEvent::Warning(format!(
                "Frame {} at position {} was never delivered",
                record.frame_id, record.parameter
            )));
            self.group_positions.push(record.parameter);
            if record.remaining == 1 {
                self.close_group();
            }
        }
        for record in &outcome.matched {
            self.score(record, camera)?;
            self.group_positions.push(record.parameter);
            if record.remaining == 1 {
                self.close_group();
            }
        }
        if self.groups_left == 0 {
            self.finish();
            return Ok(DataStatus::Done);
        }
        Ok(DataStatus::Continue)
    }

    fn awaiting_frames(&self) -> bool {
        !self.matcher.queue().is_empty()
    }

    fn cancel(&mut self) {
        let dropped = self.matcher.clear();
        if dropped > 0 {
            debug!(dropped, "autofocus records dropped on cancel");
        }
    }
}

/// Builds the two halves of an autofocus session, sharing their queues.
pub fn autofocus<F: FocusActuator>(
    plan: AutofocusPlan,
    actuator: F,
    metric: Box<dyn FrameMetric>,
    events: EventSender,
    config: &SessionConfig,
) -> (AutofocusSignal<F>, AutofocusData) {
    let queue = Arc::new(FrameQueue::new());
    let results = ResultQueue::new();
    let data = AutofocusData {
        matcher: FrameMatcher::new(queue.clone(), config.max_unmatched_polls),
        results: results.clone(),
        metric,
        events,
        robust_fit: plan.robust_fit,
        axis: actuator.axis(),
        groups_left: plan.groups(),
        group: Vec::new(),
        group_positions: Vec::new(),
        best: None,
        plot_data: Vec::new(),
        last_fit: false,
        focus: None,
    };
    let signal = AutofocusSignal {
        plan,
        actuator,
        queue,
        results,
        poll_interval: config.poll_interval,
        signal_id: 0,
        position: 0.,
        start_position: 0.,
        coarse_resolved: false,
        finished: false,
    };
    (signal, data)
}
