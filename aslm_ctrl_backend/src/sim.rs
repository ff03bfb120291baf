//! Simulated DAQ backend.
//!
//! [`SimDaq`] hands out [`SimTask`]s that behave like finite NI tasks without touching hardware:
//! starting a task makes it busy until it is waited on or stopped, closed tasks reject further
//! calls, and every call is appended to a shared [`SimEvent`] log so tests can assert on the exact
//! sequence the coordinator issued. Failures can be injected per task kind.
//!
//! A pulse-train hook lets a synthetic camera capture one frame per counter pulse when the camera
//! trigger task completes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aslm_compiler_backend::CameraPulse;
use ndarray::Array2;
use parking_lot::Mutex;

use crate::daq::{DaqBackend, DaqError, DaqTask, Result, TaskKind};

#[derive(Clone, Debug, PartialEq)]
pub enum SimEvent {
    Create { task: String, kind: TaskKind },
    TriggerSource { task: String, source: String },
    Retriggerable { task: String, retriggerable: bool },
    Start(String),
    Stop(String),
    Close(String),
    Wait { task: String, timed_out: bool },
    AnalogWrite { task: String, buffer: Array2<f64> },
    DigitalWrite { task: String, pattern: Vec<bool> },
    Reset(String),
}

#[derive(Clone, Debug, Default)]
struct Faults {
    fail_create: Option<TaskKind>,
    fail_writes: usize,
    hang_waits: bool,
    wait_delay: Option<Duration>,
}

type PulseHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<SimEvent>>,
    faults: Mutex<Faults>,
    pulse_hook: Mutex<Option<PulseHook>>,
    open_tasks: AtomicUsize,
}

impl Shared {
    fn log(&self, event: SimEvent) {
        self.events.lock().push(event);
    }
}

/// Cloning shares the event log and fault settings.
#[derive(Clone, Default)]
pub struct SimDaq {
    shared: Arc<Shared>,
}

impl SimDaq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.shared.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().clear();
    }

    /// Tasks created and not yet closed.
    pub fn open_tasks(&self) -> usize {
        self.shared.open_tasks.load(Ordering::SeqCst)
    }

    /// Makes creation of every task of `kind` fail.
    pub fn fail_task_creation(&self, kind: Option<TaskKind>) {
        self.shared.faults.lock().fail_create = kind;
    }

    /// Makes the next `count` buffer writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.shared.faults.lock().fail_writes = count;
    }

    /// Makes every wait on a running task time out.
    pub fn hang_waits(&self, hang: bool) {
        self.shared.faults.lock().hang_waits = hang;
    }

    /// Makes every wait block for `delay` before looking at the task.
    pub fn slow_waits(&self, delay: Option<Duration>) {
        self.shared.faults.lock().wait_delay = delay;
    }

    /// Called with the pulse count whenever a running counter task completes.
    pub fn on_pulse_train(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.shared.pulse_hook.lock() = Some(Arc::new(hook));
    }

    fn new_task(&self, name: &str, kind: TaskKind, channels: usize, pulses: usize) -> Result<SimTask> {
        if self.shared.faults.lock().fail_create == Some(kind) {
            return Err(DaqError::Driver {
                code: -200220,
                message: format!("Simulated creation failure for {}", name),
            });
        }
        self.shared.open_tasks.fetch_add(1, Ordering::SeqCst);
        self.shared.log(SimEvent::Create {
            task: name.to_string(),
            kind,
        });
        Ok(SimTask {
            name: name.to_string(),
            kind,
            channels,
            pulses,
            state: Mutex::new(TaskState::default()),
            shared: self.shared.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct TaskState {
    running: bool,
    closed: bool,
}

pub struct SimTask {
    name: String,
    kind: TaskKind,
    channels: usize,
    pulses: usize,
    state: Mutex<TaskState>,
    shared: Arc<Shared>,
}

impl SimTask {
    fn open_state(&self) -> Result<parking_lot::MutexGuard<'_, TaskState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(DaqError::TaskClosed(self.name.clone()));
        }
        Ok(state)
    }

    fn take_write_fault(&self) -> Result<()> {
        let mut faults = self.shared.faults.lock();
        if faults.fail_writes > 0 {
            faults.fail_writes -= 1;
            return Err(DaqError::Driver {
                code: -200288,
                message: format!("Simulated write failure for {}", self.name),
            });
        }
        Ok(())
    }
}

impl DaqTask for SimTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn start(&self) -> Result<()> {
        self.open_state()?.running = true;
        self.shared.log(SimEvent::Start(self.name.clone()));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.open_state()?.running = false;
        self.shared.log(SimEvent::Stop(self.name.clone()));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.open_state()?;
            state.closed = true;
            state.running = false;
        }
        self.shared.open_tasks.fetch_sub(1, Ordering::SeqCst);
        self.shared.log(SimEvent::Close(self.name.clone()));
        Ok(())
    }

    fn is_task_done(&self) -> Result<bool> {
        Ok(!self.open_state()?.running)
    }

    fn wait_until_done(&self, timeout: Duration) -> Result<()> {
        let delay = self.shared.faults.lock().wait_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let was_running = self.open_state()?.running;
        if was_running && self.shared.faults.lock().hang_waits {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            self.shared.log(SimEvent::Wait {
                task: self.name.clone(),
                timed_out: true,
            });
            return Err(DaqError::Timeout {
                task: self.name.clone(),
                timeout,
            });
        }
        self.open_state()?.running = false;
        self.shared.log(SimEvent::Wait {
            task: self.name.clone(),
            timed_out: false,
        });
        if was_running && self.kind == TaskKind::CounterOutput {
            let hook = self.shared.pulse_hook.lock().clone();
            if let Some(hook) = hook {
                hook(self.pulses);
            }
        }
        Ok(())
    }

    fn cfg_dig_edge_start_trigger(&self, source: &str) -> Result<()> {
        self.open_state()?;
        self.shared.log(SimEvent::TriggerSource {
            task: self.name.clone(),
            source: source.to_string(),
        });
        Ok(())
    }

    fn set_retriggerable(&self, retriggerable: bool) -> Result<()> {
        self.open_state()?;
        self.shared.log(SimEvent::Retriggerable {
            task: self.name.clone(),
            retriggerable,
        });
        Ok(())
    }

    fn write_analog(&self, buffer: &Array2<f64>) -> Result<usize> {
        self.open_state()?;
        self.take_write_fault()?;
        if buffer.nrows() != self.channels {
            return Err(DaqError::InvalidBuffer {
                task: self.name.clone(),
                reason: format!("{} rows for {} channels", buffer.nrows(), self.channels),
            });
        }
        self.shared.log(SimEvent::AnalogWrite {
            task: self.name.clone(),
            buffer: buffer.clone(),
        });
        Ok(buffer.ncols())
    }

    fn write_digital_lines(&self, pattern: &[bool]) -> Result<usize> {
        self.open_state()?;
        self.take_write_fault()?;
        self.shared.log(SimEvent::DigitalWrite {
            task: self.name.clone(),
            pattern: pattern.to_vec(),
        });
        Ok(pattern.len())
    }
}

impl DaqBackend for SimDaq {
    type Task = SimTask;

    fn create_co_pulse_task(&self, name: &str, _counter: &str, pulse: &CameraPulse) -> Result<SimTask> {
        self.new_task(name, TaskKind::CounterOutput, 1, pulse.pulses)
    }

    fn create_ao_task(
        &self,
        name: &str,
        channels: &[String],
        _samp_rate: f64,
        _samps_per_chan: usize,
    ) -> Result<SimTask> {
        self.new_task(name, TaskKind::AnalogOutput, channels.len(), 0)
    }

    fn create_do_task(&self, name: &str, _lines: &str) -> Result<SimTask> {
        self.new_task(name, TaskKind::DigitalOutput, 1, 0)
    }

    fn reset_device(&self, device: &str) -> Result<()> {
        self.shared.log(SimEvent::Reset(device.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::daq::*;
    use crate::sim::*;
    use std::sync::atomic::AtomicUsize;

    fn pulse() -> CameraPulse {
        CameraPulse {
            initial_delay: 0.002,
            high_time: 0.004,
            low_time: 0.1,
            pulses: 3,
        }
    }

    #[test]
    fn closed_task_rejects_calls() {
        let daq = SimDaq::new();
        let task = daq.create_do_task("master", "Dev1/port0/line0").unwrap();
        assert_eq!(daq.open_tasks(), 1);
        task.close().unwrap();
        assert_eq!(daq.open_tasks(), 0);
        assert!(matches!(task.start(), Err(DaqError::TaskClosed(_))));
        assert!(matches!(task.close(), Err(DaqError::TaskClosed(_))));
    }

    #[test]
    fn wait_completes_and_fires_hook() {
        let daq = SimDaq::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        daq.on_pulse_train(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        });
        let task = daq.create_co_pulse_task("camera", "Dev1/ctr0", &pulse()).unwrap();
        assert!(task.is_task_done().unwrap());
        // Waiting on an idle task does not generate pulses
        task.wait_until_done(Duration::from_millis(10)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        task.start().unwrap();
        assert!(!task.is_task_done().unwrap());
        task.wait_until_done(Duration::from_millis(10)).unwrap();
        assert!(task.is_task_done().unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn injected_faults() {
        let daq = SimDaq::new();
        daq.fail_task_creation(Some(TaskKind::AnalogOutput));
        assert!(daq
            .create_ao_task("ao", &["Dev1/ao0".to_string()], 1e3, 10)
            .is_err());
        daq.fail_task_creation(None);
        let ao = daq
            .create_ao_task("ao", &["Dev1/ao0".to_string()], 1e3, 10)
            .unwrap();

        daq.fail_next_writes(1);
        assert!(ao.write_analog(&Array2::zeros((1, 10))).is_err());
        assert_eq!(ao.write_analog(&Array2::zeros((1, 10))), Ok(10));
        assert!(matches!(
            ao.write_analog(&Array2::zeros((2, 10))),
            Err(DaqError::InvalidBuffer { .. })
        ));

        daq.hang_waits(true);
        ao.start().unwrap();
        assert!(matches!(
            ao.wait_until_done(Duration::from_millis(1)),
            Err(DaqError::Timeout { .. })
        ));
    }
}
