//! Acquisition coordinator: prepares, fires and tears down the DAQ tasks of one channel.
//!
//! ## Tasks
//! A prepared [`AcquisitionCoordinator`] owns one trigger session made of
//! - a counter-output pulse train triggering the camera, sized to `repeat * expand` pulses,
//! - one analog-output task per board, holding the compiled board buffer,
//! - a digital master-trigger task, in self-trigger mode only.
//!
//! Every camera and analog task waits for a rising edge on the trigger source: the line the
//! master task pulses in self-trigger mode, or an external PFI line (stage encoder) in external
//! mode, where tasks are retriggerable.
//!
//! ## States
//! ```text
//! Idle --prepare--> Preparing --> Armed --run--> Running --> Armed
//!                                   |  \--update_analog_task--> Updating --> Armed|Running
//!                                   \--stop (from any state)--> Idle
//! ```
//! `run()` blocks while an analog update is rewriting a buffer, so a partially written waveform
//! is never fired. The state lock is not held while waiting on hardware, so `state()` and
//! `stop()` stay responsive during an update.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aslm_compiler_backend::{
    plan_boards, remote_focus_board, AcquisitionContext, BaseBoard, BoardSet, CameraPulse,
    split_ao_address, CameraTiming, ChannelTiming, ConfigError, SharedContext, TickTimer,
};
use indexmap::IndexMap;
use ndarray::Array2;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::daq::{release_task, DaqBackend, DaqError, DaqTask};
use crate::error::{AcquisitionError, Result};
use crate::feature::Trigger;

/// Master line pattern written in self-trigger mode. The three high samples are a hold pattern
/// the trigger fan-out hardware relies on; keep it literal.
pub const MASTER_TRIGGER_PATTERN: [bool; 5] = [false, true, true, true, false];

/// Bound on waiting for the current analog pass before rewriting its buffer.
const UPDATE_WAIT: Duration = Duration::from_secs(1);

const CAMERA_TASK: &str = "camera_trigger";
const MASTER_TASK: &str = "master_trigger";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    SelfTrigger,
    /// External trigger on the given PFI line.
    External(String),
}

impl TriggerMode {
    pub fn is_external(&self) -> bool {
        matches!(self, TriggerMode::External(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Preparing,
    Armed,
    Running,
    Updating,
    Stopping,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CoordinatorState::Idle => "IDLE",
                CoordinatorState::Preparing => "PREPARING",
                CoordinatorState::Armed => "ARMED",
                CoordinatorState::Running => "RUNNING",
                CoordinatorState::Updating => "UPDATING",
                CoordinatorState::Stopping => "STOPPING",
            }
        )
    }
}

/// Compiled buffer of one board plus what is needed to create its task.
struct BoardBuffer {
    channels: Vec<String>,
    samp_rate: f64,
    buffer: Array2<f64>,
}

fn compile_boards(boards: &mut BoardSet) -> Result<IndexMap<String, BoardBuffer>> {
    boards
        .boards_()
        .iter_mut()
        .map(|(board_id, board)| -> Result<(String, BoardBuffer)> {
            Ok((
                board_id.clone(),
                BoardBuffer {
                    channels: board.physical_channels(),
                    samp_rate: board.samp_rate(),
                    buffer: board.build()?,
                },
            ))
        })
        .collect()
}

fn trigger_source(ctx: &AcquisitionContext, mode: &TriggerMode) -> String {
    match mode {
        TriggerMode::SelfTrigger => ctx.daq.trigger_source.clone(),
        TriggerMode::External(line) => line.clone(),
    }
}

/// Accepts PFI terminals such as `/PXI6259/PFI1`.
fn validate_trigger_line(line: &str) -> std::result::Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        address: line.to_string(),
        expected: "/{device}/PFI{number}".to_string(),
    };
    let re = Regex::new(r"^/?[^/\s]+/PFI\d+$").map_err(|_| invalid())?;
    if re.is_match(line) {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn configure_trigger<T: DaqTask + ?Sized>(
    task: &T,
    source: &str,
    retriggerable: bool,
) -> std::result::Result<(), DaqError> {
    task.cfg_dig_edge_start_trigger(source)?;
    task.set_retriggerable(retriggerable)
}

// Covers the whole pulse train plus the configured margin.
fn camera_timeout(ctx: &AcquisitionContext, timing: &ChannelTiming, pulse: &CameraPulse) -> Duration {
    Duration::from_secs_f64(
        ctx.daq.camera_wait_timeout.max(0.) + pulse.pulses as f64 * timing.sweep_time,
    )
}

struct TriggerSession<T> {
    channel_key: String,
    timing: ChannelTiming,
    pulse: CameraPulse,
    camera_timeout: Duration,
    camera_task: Arc<T>,
    analog_tasks: IndexMap<String, Arc<T>>,
    master_task: Option<Arc<T>>,
}

impl<T: DaqTask> TriggerSession<T> {
    fn teardown(&self) {
        release_task(self.camera_task.as_ref());
        for task in self.analog_tasks.values() {
            release_task(task.as_ref());
        }
        if let Some(master) = &self.master_task {
            release_task(master.as_ref());
        }
    }
}

struct Inner<T> {
    state: CoordinatorState,
    trigger_mode: TriggerMode,
    focus_offset: f64,
    /// State an `Updating` coordinator returns to.
    resume: CoordinatorState,
    session: Option<TriggerSession<T>>,
}

/// Handles of one `run()` pass, cloned out of the session so the pass can wait without holding
/// the state lock.
struct Pass<T> {
    camera: Arc<T>,
    analog: Vec<Arc<T>>,
    master: Option<Arc<T>>,
    timeout: Duration,
    external: bool,
}

pub struct AcquisitionCoordinator<B: DaqBackend> {
    backend: B,
    ctx: SharedContext,
    camera: Arc<dyn CameraTiming + Send + Sync>,
    inner: Mutex<Inner<B::Task>>,
    update_lock: Mutex<()>,
}

impl<B: DaqBackend> AcquisitionCoordinator<B> {
    pub fn new(backend: B, ctx: SharedContext, camera: Arc<dyn CameraTiming + Send + Sync>) -> Self {
        Self {
            backend,
            ctx,
            camera,
            inner: Mutex::new(Inner {
                state: CoordinatorState::Idle,
                trigger_mode: TriggerMode::SelfTrigger,
                focus_offset: 0.,
                resume: CoordinatorState::Idle,
                session: None,
            }),
            update_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.lock().state
    }

    pub fn is_armed(&self) -> bool {
        self.state() == CoordinatorState::Armed
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.inner.lock().trigger_mode.clone()
    }

    pub fn focus_offset(&self) -> f64 {
        self.inner.lock().focus_offset
    }

    /// Timing of the prepared channel.
    pub fn current_timing(&self) -> Option<ChannelTiming> {
        self.inner.lock().session.as_ref().map(|s| s.timing.clone())
    }

    /// Camera trigger train of the prepared channel.
    pub fn current_pulse(&self) -> Option<CameraPulse> {
        self.inner.lock().session.as_ref().map(|s| s.pulse)
    }

    /// Computes the timing of `channel_key` from the current context without touching tasks.
    pub fn channel_timing(&self, channel_key: &str) -> Result<ChannelTiming> {
        let ctx = self.ctx.read();
        Ok(ChannelTiming::from_context(&ctx, channel_key, self.camera.as_ref())?)
    }

    /// Builds every buffer for `channel_key` and creates its tasks.
    ///
    /// Configuration errors surface before any task exists. On any failure the partially
    /// created tasks are released and the coordinator is left `Idle`.
    pub fn prepare(&self, channel_key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CoordinatorState::Idle | CoordinatorState::Armed => {}
            state => {
                return Err(AcquisitionError::InvalidState {
                    state,
                    expected: "IDLE or ARMED",
                })
            }
        }
        if let Some(previous) = inner.session.take() {
            previous.teardown();
        }
        inner.state = CoordinatorState::Preparing;

        let mut timer = TickTimer::new();
        match self.build_session(channel_key, &inner.trigger_mode, inner.focus_offset) {
            Ok(session) => {
                timer.tick_print("acquisition tasks prepared");
                info!(
                    channel = channel_key,
                    sweep_time = session.timing.sweep_time,
                    pulses = session.pulse.pulses,
                    boards = session.analog_tasks.len(),
                    "armed"
                );
                inner.session = Some(session);
                inner.state = CoordinatorState::Armed;
                Ok(())
            }
            Err(err) => {
                error!(channel = channel_key, %err, "prepare failed");
                inner.state = CoordinatorState::Idle;
                Err(err)
            }
        }
    }

    fn build_session(
        &self,
        channel_key: &str,
        mode: &TriggerMode,
        focus_offset: f64,
    ) -> Result<TriggerSession<B::Task>> {
        let ctx = self.ctx.read();
        let timing = ChannelTiming::from_context(&ctx, channel_key, self.camera.as_ref())?;
        let mut boards = plan_boards(&ctx, &timing, focus_offset)?;
        let buffers = compile_boards(&mut boards)?;
        let pulse = timing.camera_pulse(ctx.has_analog_outputs(), boards.template().frames());
        let source = trigger_source(&ctx, mode);
        let external = mode.is_external();

        let wait = camera_timeout(&ctx, &timing, &pulse);

        let mut created = Vec::new();
        let tasks = self.create_tasks(&ctx, &buffers, &pulse, &source, external, &mut created);
        match tasks {
            Ok((camera_task, analog_tasks, master_task)) => Ok(TriggerSession {
                channel_key: channel_key.to_string(),
                timing,
                pulse,
                camera_timeout: wait,
                camera_task,
                analog_tasks,
                master_task,
            }),
            Err(err) => {
                for task in created.iter().rev() {
                    release_task(task.as_ref());
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create_tasks(
        &self,
        ctx: &AcquisitionContext,
        buffers: &IndexMap<String, BoardBuffer>,
        pulse: &CameraPulse,
        source: &str,
        external: bool,
        created: &mut Vec<Arc<B::Task>>,
    ) -> Result<(Arc<B::Task>, IndexMap<String, Arc<B::Task>>, Option<Arc<B::Task>>)> {
        let camera_task = Arc::new(self.backend.create_co_pulse_task(
            CAMERA_TASK,
            &ctx.daq.camera_trigger_out_line,
            pulse,
        )?);
        created.push(camera_task.clone());
        configure_trigger(camera_task.as_ref(), source, external)?;

        let analog_tasks = self.create_analog_tasks(buffers, source, external, created)?;

        let master_task = if external {
            None
        } else {
            let task = Arc::new(
                self.backend
                    .create_do_task(MASTER_TASK, &ctx.daq.master_trigger_out_line)?,
            );
            created.push(task.clone());
            Some(task)
        };
        Ok((camera_task, analog_tasks, master_task))
    }

    fn create_analog_tasks(
        &self,
        buffers: &IndexMap<String, BoardBuffer>,
        source: &str,
        external: bool,
        created: &mut Vec<Arc<B::Task>>,
    ) -> Result<IndexMap<String, Arc<B::Task>>> {
        let mut tasks = IndexMap::new();
        for (board_id, board) in buffers {
            let task = Arc::new(self.backend.create_ao_task(
                &format!("{}_ao", board_id),
                &board.channels,
                board.samp_rate,
                board.buffer.ncols(),
            )?);
            created.push(task.clone());
            configure_trigger(task.as_ref(), source, external)?;
            task.write_analog(&board.buffer)?;
            debug!(board = %board_id, samps = board.buffer.ncols(), "analog task written");
            tasks.insert(board_id.clone(), task);
        }
        Ok(tasks)
    }

    /// Fires one acquisition pass and waits for the camera trigger train to finish.
    ///
    /// Fails with [`AcquisitionError::InvalidState`] unless the coordinator is armed. A camera
    /// wait timeout is logged and treated as completion.
    pub fn run(&self) -> Result<()> {
        let pass = {
            let _update = self.update_lock.lock();
            let pass = self.begin_pass()?;
            if let Err(err) = self.fire(&pass) {
                self.halt(&pass);
                self.end_pass();
                return Err(err);
            }
            pass
        };
        let outcome = self.complete(&pass);
        self.halt(&pass);
        if self.end_pass() {
            outcome
        } else {
            debug!("coordinator stopped during run");
            Ok(())
        }
    }

    fn begin_pass(&self) -> Result<Pass<B::Task>> {
        let mut inner = self.inner.lock();
        let pass = match (&inner.session, inner.state) {
            (Some(session), CoordinatorState::Armed) => Pass {
                camera: session.camera_task.clone(),
                analog: session.analog_tasks.values().cloned().collect(),
                master: session.master_task.clone(),
                timeout: session.camera_timeout,
                external: inner.trigger_mode.is_external(),
            },
            (_, state) => {
                return Err(AcquisitionError::InvalidState {
                    state,
                    expected: "ARMED",
                })
            }
        };
        inner.state = CoordinatorState::Running;
        Ok(pass)
    }

    fn fire(&self, pass: &Pass<B::Task>) -> Result<()> {
        if pass.camera.is_task_done()? {
            pass.camera.start()?;
            for task in &pass.analog {
                task.start()?;
            }
        }
        if let Some(master) = &pass.master {
            master.write_digital_lines(&MASTER_TRIGGER_PATTERN)?;
        }
        Ok(())
    }

    fn complete(&self, pass: &Pass<B::Task>) -> Result<()> {
        match pass.camera.wait_until_done(pass.timeout) {
            Ok(()) => {}
            Err(DaqError::Timeout { task, timeout }) => {
                warn!(%task, ?timeout, "camera trigger train not done, continuing");
            }
            Err(err) => return Err(err.into()),
        }
        if !pass.external {
            for task in &pass.analog {
                if let Err(err) = task.wait_until_done(pass.timeout) {
                    warn!(task = task.name(), %err, "analog task not done, continuing");
                }
            }
        }
        Ok(())
    }

    // Stops, never closes, so the next run() can restart the same tasks.
    fn halt(&self, pass: &Pass<B::Task>) {
        let tasks = pass
            .analog
            .iter()
            .chain(std::iter::once(&pass.camera))
            .chain(pass.master.iter());
        for task in tasks {
            if let Err(err) = task.stop() {
                debug!(task = task.name(), %err, "ignored stop failure after run");
            }
        }
    }

    /// Returns to `Armed`; false when a concurrent `stop()` already moved the state on.
    fn end_pass(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CoordinatorState::Running => {
                inner.state = CoordinatorState::Armed;
                true
            }
            // The update in flight hands the coordinator back armed
            CoordinatorState::Updating if inner.resume == CoordinatorState::Running => {
                inner.resume = CoordinatorState::Armed;
                true
            }
            _ => false,
        }
    }

    /// Recompiles `board_id`'s buffer from the current context and rewrites its task.
    ///
    /// Concurrent calls are serialised, so the last one always writes the latest parameters.
    /// Returns `Ok(false)` without touching hardware when nothing is prepared or the board has
    /// no task, and also when a `stop()` released the session during the rewrite. A failed
    /// rewrite falls back to recreating every analog task. While running, the rewritten task is
    /// restarted; while armed it stays stopped until the next `run()`.
    pub fn update_analog_task(&self, board_id: &str) -> Result<bool> {
        let _update = self.update_lock.lock();
        let (timing, task, focus_offset, restart) = {
            let mut inner = self.inner.lock();
            if !matches!(
                inner.state,
                CoordinatorState::Armed | CoordinatorState::Running
            ) {
                return Ok(false);
            }
            let (timing, task) = match &inner.session {
                Some(session) => match session.analog_tasks.get(board_id) {
                    Some(task) => (session.timing.clone(), task.clone()),
                    None => return Ok(false),
                },
                None => return Ok(false),
            };
            inner.resume = inner.state;
            inner.state = CoordinatorState::Updating;
            (
                timing,
                task,
                inner.focus_offset,
                inner.resume == CoordinatorState::Running,
            )
        };

        // A bad configuration leaves the loaded buffers untouched
        let compiled = {
            let ctx = self.ctx.read();
            plan_boards(&ctx, &timing, focus_offset)
                .map_err(AcquisitionError::from)
                .and_then(|mut boards| compile_boards(&mut boards))
        };
        let buffers = match compiled {
            Ok(buffers) => buffers,
            Err(err) => {
                self.leave_update();
                return Err(err);
            }
        };
        let board = match buffers.get(board_id) {
            Some(board) => board,
            None => {
                self.leave_update();
                return Ok(false);
            }
        };

        let rewritten = rewrite_task(task.as_ref(), &board.buffer, restart);
        let mut inner = self.inner.lock();
        if inner.state != CoordinatorState::Updating {
            debug!(board = board_id, "session released during analog update");
            return Ok(false);
        }
        // The pass may have ended while the buffer was being written
        let running = inner.resume == CoordinatorState::Running;
        let outcome = match rewritten {
            Ok(()) => {
                if restart && !running {
                    if let Err(err) = task.stop() {
                        debug!(task = task.name(), %err, "ignored stop failure after update");
                    }
                }
                info!(board = board_id, "analog task updated");
                Ok(true)
            }
            Err(err) => {
                warn!(board = board_id, %err, "analog rewrite failed, recreating analog tasks");
                self.rebuild_analog_tasks(&mut inner, &buffers, running)
                    .map(|_| true)
            }
        };
        inner.state = if inner.session.is_some() {
            inner.resume
        } else {
            CoordinatorState::Idle
        };
        outcome
    }

    fn leave_update(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CoordinatorState::Updating {
            inner.state = inner.resume;
        }
    }

    fn rebuild_analog_tasks(
        &self,
        inner: &mut Inner<B::Task>,
        buffers: &IndexMap<String, BoardBuffer>,
        restart: bool,
    ) -> Result<()> {
        let old: Vec<Arc<B::Task>> = match inner.session.as_mut() {
            Some(session) => session.analog_tasks.drain(..).map(|(_, task)| task).collect(),
            None => return Ok(()),
        };
        for task in &old {
            release_task(task.as_ref());
        }

        let source = trigger_source(&self.ctx.read(), &inner.trigger_mode);
        let external = inner.trigger_mode.is_external();
        let mut created = Vec::new();
        let rebuilt = self
            .create_analog_tasks(buffers, &source, external, &mut created)
            .and_then(|tasks| {
                if restart {
                    for task in tasks.values() {
                        task.start()?;
                    }
                }
                Ok(tasks)
            });
        match rebuilt {
            Ok(tasks) => {
                if let Some(session) = inner.session.as_mut() {
                    session.analog_tasks = tasks;
                }
                Ok(())
            }
            Err(err) => {
                error!(%err, "could not recreate analog tasks, releasing the session");
                for task in &created {
                    release_task(task.as_ref());
                }
                if let Some(session) = inner.session.take() {
                    session.teardown();
                }
                Err(err)
            }
        }
    }

    /// Switches between self and external triggering.
    ///
    /// When armed, the existing tasks are re-targeted in place: every camera and analog task
    /// listens on the new source, and the master task is created or released.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        if let TriggerMode::External(line) = &mode {
            validate_trigger_line(line)?;
        }
        let mut inner = self.inner.lock();
        match inner.state {
            CoordinatorState::Idle | CoordinatorState::Armed => {}
            state => {
                return Err(AcquisitionError::InvalidState {
                    state,
                    expected: "IDLE or ARMED",
                })
            }
        }
        if inner.trigger_mode == mode {
            return Ok(());
        }
        info!(?mode, "trigger mode changed");
        inner.trigger_mode = mode;
        if inner.state != CoordinatorState::Armed {
            return Ok(());
        }
        if let Err(err) = self.retarget_session(&mut inner) {
            error!(%err, "could not re-target trigger source, releasing the session");
            if let Some(session) = inner.session.take() {
                session.teardown();
            }
            inner.state = CoordinatorState::Idle;
            return Err(err);
        }
        Ok(())
    }

    fn retarget_session(&self, inner: &mut Inner<B::Task>) -> Result<()> {
        let (source, master_line) = {
            let ctx = self.ctx.read();
            (
                trigger_source(&ctx, &inner.trigger_mode),
                ctx.daq.master_trigger_out_line.clone(),
            )
        };
        let external = inner.trigger_mode.is_external();
        let session = match inner.session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };
        for task in std::iter::once(&session.camera_task).chain(session.analog_tasks.values()) {
            if let Err(err) = task.stop() {
                debug!(task = task.name(), %err, "ignored stop failure while re-targeting");
            }
            configure_trigger(task.as_ref(), &source, external)?;
        }
        match (external, session.master_task.take()) {
            (true, Some(master)) => release_task(master.as_ref()),
            (false, None) => {
                session.master_task = Some(Arc::new(
                    self.backend.create_do_task(MASTER_TASK, &master_line)?,
                ))
            }
            (_, master) => session.master_task = master,
        }
        Ok(())
    }

    /// Sets the live remote-focus offset and rewrites the remote-focus board.
    ///
    /// Returns whether a task was rewritten.
    pub fn set_focus_offset(&self, offset: f64) -> Result<bool> {
        self.inner.lock().focus_offset = offset;
        let board = remote_focus_board(&self.ctx.read());
        match board {
            Some(board) => self.update_analog_task(&board),
            None => Ok(false),
        }
    }

    /// Resets every device carrying a declared analog output. Only allowed while idle.
    pub fn reset_devices(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.state != CoordinatorState::Idle {
            return Err(AcquisitionError::InvalidState {
                state: inner.state,
                expected: "IDLE",
            });
        }
        let devices: BTreeSet<String> = {
            let ctx = self.ctx.read();
            ctx.galvos
                .iter()
                .map(|galvo| galvo.physical_name.as_str())
                .chain(ctx.remote_focus.iter().map(|rf| rf.physical_name.as_str()))
                .map(|address| split_ao_address(address).map(|(device, _)| device.to_string()))
                .collect::<std::result::Result<_, ConfigError>>()?
        };
        for device in &devices {
            self.backend.reset_device(device)?;
            info!(%device, "device reset");
        }
        Ok(())
    }

    /// Releases every task and returns to `Idle`. Safe to call in any state, any number of times.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.take() {
            inner.state = CoordinatorState::Stopping;
            session.teardown();
            info!(channel = %session.channel_key, "acquisition tasks released");
        }
        inner.state = CoordinatorState::Idle;
    }
}

fn rewrite_task<T: DaqTask + ?Sized>(
    task: &T,
    buffer: &Array2<f64>,
    restart: bool,
) -> std::result::Result<(), DaqError> {
    match task.wait_until_done(UPDATE_WAIT) {
        Ok(()) => {}
        Err(DaqError::Timeout { .. }) => {
            warn!(task = task.name(), "analog pass still running, rewriting anyway")
        }
        Err(err) => return Err(err),
    }
    task.stop()?;
    task.write_analog(buffer)?;
    if restart {
        task.start()?;
    }
    Ok(())
}

impl<B: DaqBackend> Trigger for AcquisitionCoordinator<B> {
    fn fire(&self) -> Result<()> {
        self.run()
    }
}

impl<B: DaqBackend> Drop for AcquisitionCoordinator<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
