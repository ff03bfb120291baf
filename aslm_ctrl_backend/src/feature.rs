//! Signal/data thread pair.
//!
//! An acquisition feature is split in two halves that run concurrently:
//! - a [`SignalFeature`] commands positions and fires acquisition passes through a [`Trigger`],
//! - a [`DataFeature`] consumes the frames the camera reports and scores them.
//!
//! The halves only talk through the queues of [`crate::frame_queue`]. [`AcquisitionSession`]
//! owns the two threads: it initialises both halves in the calling thread, spawns
//! `"{feature} signal"` and `"{feature} data"`, and joins them. Cancellation is cooperative: both
//! loops check the shared [`StopFlag`] on every iteration, and an error in either thread raises
//! it so the other one exits too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::devices::Camera;
use crate::error::{AcquisitionError, Result};

/// Shared `stop_acquisition` flag.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fires one acquisition pass and returns once it completed.
pub trait Trigger: Send + Sync {
    fn fire(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalStatus {
    /// Step again; fire one pass first when `trigger` is set.
    Continue { trigger: bool },
    Done,
}

pub trait SignalFeature: Send {
    fn name(&self) -> &str;

    /// Runs in the calling thread before either thread starts.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Advances the state machine by one step. `frame_id` is the ring-buffer slot the next
    /// triggered frame will land in.
    fn step(&mut self, frame_id: usize, stop: &StopFlag) -> Result<SignalStatus>;

    /// Frames produced by one fired pass.
    fn frames_per_trigger(&self) -> usize {
        1
    }

    /// Always runs once the loop exits, whether it finished, failed or was cancelled.
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    Continue,
    Done,
}

pub trait DataFeature: Send {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handles the ids reported by one camera poll, possibly none.
    fn consume(&mut self, ready: &[usize], camera: &dyn Camera) -> Result<DataStatus>;

    /// Whether a frame is currently expected. Empty polls only count towards the camera
    /// timeout while this holds.
    fn awaiting_frames(&self) -> bool {
        true
    }

    /// Drops pending work without processing it.
    fn cancel(&mut self) {}
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Bound on each camera poll and on each blocking queue wait.
    pub poll_interval: Duration,
    /// Consecutive empty polls after which the data thread gives up.
    pub camera_wait_iterations: usize,
    /// Polls a queued frame record may stay unmatched before it is dropped as lost.
    pub max_unmatched_polls: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            camera_wait_iterations: 500,
            max_unmatched_polls: 100,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub passes: usize,
    pub frames: usize,
    /// True when the stop flag ended the session.
    pub cancelled: bool,
}

pub struct AcquisitionSession {
    camera: Arc<dyn Camera>,
    trigger: Arc<dyn Trigger>,
    stop: StopFlag,
    config: SessionConfig,
}

impl AcquisitionSession {
    pub fn new(camera: Arc<dyn Camera>, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            camera,
            trigger,
            stop: StopFlag::new(),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Flag cancelling this session when set from any thread.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Runs `signal` and `data` to completion on their own threads.
    ///
    /// Returns the first error raised by either half; the other half is stopped through the
    /// shared flag and joined before returning.
    pub fn run<S, D>(&self, mut signal: S, mut data: D) -> Result<SessionReport>
    where
        S: SignalFeature + 'static,
        D: DataFeature + 'static,
    {
        let name = signal.name().to_string();
        self.camera.start_series()?;
        if let Err(err) = signal.init().and_then(|_| data.init()) {
            error!(feature = %name, %err, "feature init failed");
            if let Err(cleanup) = signal.cleanup() {
                debug!(feature = %name, %cleanup, "ignored cleanup failure after init");
            }
            self.end_series();
            return Err(err);
        }
        info!(feature = %name, "acquisition session started");

        let signal_thread = {
            let trigger = self.trigger.clone();
            let stop = self.stop.clone();
            let ring = self.camera.buffer_size().max(1);
            let poll = self.config.poll_interval;
            spawn(format!("{} signal", name), move || {
                run_signal(signal, trigger.as_ref(), &stop, ring, poll)
            })?
        };
        let data_thread = {
            let camera = self.camera.clone();
            let stop = self.stop.clone();
            let config = self.config.clone();
            spawn(format!("{} data", name), move || {
                run_data(data, camera.as_ref(), &stop, &config)
            })
        };
        let data_thread = match data_thread {
            Ok(handle) => handle,
            Err(err) => {
                self.stop.set();
                let _ = join(signal_thread, &name);
                self.end_series();
                return Err(err);
            }
        };

        let passes = join(signal_thread, &name);
        let frames = join(data_thread, &name);
        self.end_series();
        let report = SessionReport {
            passes: passes?,
            frames: frames?,
            cancelled: self.stop.is_set(),
        };
        info!(
            feature = %name,
            passes = report.passes,
            frames = report.frames,
            cancelled = report.cancelled,
            "acquisition session finished"
        );
        Ok(report)
    }

    fn end_series(&self) {
        if let Err(err) = self.camera.end_series() {
            debug!(%err, "ignored camera end_series failure");
        }
    }
}

fn spawn<T, F>(name: String, body: F) -> Result<JoinHandle<Result<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|err| AcquisitionError::Thread(format!("could not spawn {}: {}", name, err)))
}

fn join<T>(handle: JoinHandle<Result<T>>, feature: &str) -> Result<T> {
    let thread = handle.thread().name().unwrap_or(feature).to_string();
    handle
        .join()
        .map_err(|_| AcquisitionError::Thread(format!("{} panicked", thread)))?
}

fn run_signal<S: SignalFeature>(
    mut signal: S,
    trigger: &dyn Trigger,
    stop: &StopFlag,
    ring: usize,
    poll_interval: Duration,
) -> Result<usize> {
    let mut frame_id = 0;
    let mut passes = 0;
    let outcome = (|| -> Result<()> {
        loop {
            if stop.is_set() {
                debug!("signal thread stopping");
                return Ok(());
            }
            match signal.step(frame_id, stop)? {
                SignalStatus::Continue { trigger: true } => {
                    trigger.fire()?;
                    passes += 1;
                    frame_id = (frame_id + signal.frames_per_trigger()) % ring;
                }
                SignalStatus::Continue { trigger: false } => thread::sleep(poll_interval),
                SignalStatus::Done => return Ok(()),
            }
        }
    })();
    let outcome = outcome.and(signal.cleanup());
    if let Err(err) = &outcome {
        error!(%err, "signal thread failed");
        stop.set();
    }
    outcome.map(|_| passes)
}

fn run_data<D: DataFeature>(
    mut data: D,
    camera: &dyn Camera,
    stop: &StopFlag,
    config: &SessionConfig,
) -> Result<usize> {
    let mut frames = 0;
    let mut empty_polls = 0;
    let outcome = (|| -> Result<()> {
        loop {
            if stop.is_set() {
                debug!("data thread stopping");
                data.cancel();
                return Ok(());
            }
            let ready = camera.get_new_frame(config.poll_interval);
            if ready.is_empty() && data.awaiting_frames() {
                empty_polls += 1;
                if empty_polls >= config.camera_wait_iterations {
                    return Err(AcquisitionError::CameraTimeout(empty_polls));
                }
            } else {
                empty_polls = 0;
            }
            frames += ready.len();
            if data.consume(&ready, camera)? == DataStatus::Done {
                return Ok(());
            }
        }
    })();
    if let Err(err) = &outcome {
        error!(%err, "data thread failed");
        stop.set();
        data.cancel();
    }
    outcome.map(|_| frames)
}

#[cfg(test)]
mod test {
    use crate::feature::*;
    use crate::synthetic::{SyntheticCamera, SyntheticTrigger};
    use parking_lot::Mutex;

    struct CountingSignal {
        steps: usize,
        seen_ids: Arc<Mutex<Vec<usize>>>,
        cleaned: Arc<AtomicBool>,
    }
    impl SignalFeature for CountingSignal {
        fn name(&self) -> &str {
            "counting"
        }

        fn step(&mut self, frame_id: usize, _stop: &StopFlag) -> Result<SignalStatus> {
            if self.seen_ids.lock().len() == self.steps {
                return Ok(SignalStatus::Done);
            }
            self.seen_ids.lock().push(frame_id);
            Ok(SignalStatus::Continue { trigger: true })
        }

        fn cleanup(&mut self) -> Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingData {
        expected: usize,
        received: usize,
    }
    impl DataFeature for CountingData {
        fn consume(&mut self, ready: &[usize], _camera: &dyn Camera) -> Result<DataStatus> {
            self.received += ready.len();
            Ok(if self.received >= self.expected {
                DataStatus::Done
            } else {
                DataStatus::Continue
            })
        }
    }

    fn counting(steps: usize) -> (CountingSignal, Arc<Mutex<Vec<usize>>>, Arc<AtomicBool>) {
        let seen_ids = Arc::new(Mutex::new(Vec::new()));
        let cleaned = Arc::new(AtomicBool::new(false));
        (
            CountingSignal {
                steps,
                seen_ids: seen_ids.clone(),
                cleaned: cleaned.clone(),
            },
            seen_ids,
            cleaned,
        )
    }

    fn fast() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(2),
            camera_wait_iterations: 50,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn frame_ids_wrap_around_the_ring_buffer() {
        let camera = Arc::new(SyntheticCamera::new(3));
        let session = AcquisitionSession::new(camera.clone(), Arc::new(SyntheticTrigger::new(camera)))
            .with_config(fast());
        let (signal, seen_ids, cleaned) = counting(5);

        let report = session
            .run(signal, CountingData { expected: 5, received: 0 })
            .unwrap();
        assert_eq!(
            report,
            SessionReport {
                passes: 5,
                frames: 5,
                cancelled: false
            }
        );
        assert_eq!(*seen_ids.lock(), vec![0, 1, 2, 0, 1]);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    /// Fires into the void: no frame ever arrives.
    struct IdleTrigger;
    impl Trigger for IdleTrigger {
        fn fire(&self) -> Result<()> {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }
    }

    #[test]
    fn silent_camera_times_out_and_stops_the_signal_side() {
        let camera = Arc::new(SyntheticCamera::new(4));
        let session = AcquisitionSession::new(camera, Arc::new(IdleTrigger)).with_config(fast());
        let (signal, _, cleaned) = counting(usize::MAX);

        let err = session
            .run(signal, CountingData { expected: 1, received: 0 })
            .unwrap_err();
        assert_eq!(err, AcquisitionError::CameraTimeout(50));
        assert!(session.stop_flag().is_set());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn external_stop_cancels_both_threads() {
        let camera = Arc::new(SyntheticCamera::new(4));
        let session = AcquisitionSession::new(camera, Arc::new(IdleTrigger)).with_config(SessionConfig {
            poll_interval: Duration::from_millis(2),
            camera_wait_iterations: usize::MAX,
            ..SessionConfig::default()
        });
        let stop = session.stop_flag();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stop.set();
        });
        let (signal, _, cleaned) = counting(usize::MAX);

        let report = session
            .run(signal, CountingData { expected: 1, received: 0 })
            .unwrap();
        stopper.join().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.frames, 0);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    struct FailingSignal;
    impl SignalFeature for FailingSignal {
        fn name(&self) -> &str {
            "failing"
        }

        fn step(&mut self, _frame_id: usize, _stop: &StopFlag) -> Result<SignalStatus> {
            Err(AcquisitionError::QueueTimeout(Duration::from_secs(1)))
        }
    }

    #[test]
    fn signal_error_is_returned_and_stops_data() {
        let camera = Arc::new(SyntheticCamera::new(4));
        let session = AcquisitionSession::new(camera, Arc::new(IdleTrigger)).with_config(fast());
        let err = session
            .run(FailingSignal, CountingData { expected: 1, received: 0 })
            .unwrap_err();
        assert_eq!(err, AcquisitionError::QueueTimeout(Duration::from_secs(1)));
    }

    struct PanickingData;
    impl DataFeature for PanickingData {
        fn consume(&mut self, _ready: &[usize], _camera: &dyn Camera) -> Result<DataStatus> {
            panic!("metric blew up");
        }
    }

    #[test]
    fn panic_becomes_thread_error() {
        let camera = Arc::new(SyntheticCamera::new(4));
        let session = AcquisitionSession::new(camera, Arc::new(IdleTrigger)).with_config(fast());
        let stop = session.stop_flag();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stop.set();
        });
        let (signal, _, _) = counting(usize::MAX);
        let err = session.run(signal, PanickingData).unwrap_err();
        stopper.join().unwrap();
        assert_eq!(
            err,
            AcquisitionError::Thread("counting data panicked".to_string())
        );
    }
}
