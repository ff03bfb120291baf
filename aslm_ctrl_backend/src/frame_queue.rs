//! Queues connecting the signal and data threads.
//!
//! The signal thread pushes a [`FrameRecord`] for every frame it triggers. The data thread never
//! blind-pops: [`FrameMatcher`] remembers which frame ids the camera reported ready and only
//! removes the queue head once its id is among them, so frames delivered out of program order
//! are still paired with the right record. Verdicts travel back through a [`ResultQueue`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{AcquisitionError, Result};
use crate::feature::StopFlag;

/// One triggered frame and the parameter (position, offset, tile index) it was taken at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameRecord {
    pub frame_id: usize,
    /// Frames left in the record's group, this one included.
    pub remaining: usize,
    pub parameter: f64,
}

#[derive(Default)]
pub struct FrameQueue {
    records: Mutex<VecDeque<FrameRecord>>,
    pushed: Condvar,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: FrameRecord) {
        self.records.lock().push_back(record);
        self.pushed.notify_all();
    }

    pub fn peek(&self) -> Option<FrameRecord> {
        self.records.lock().front().copied()
    }

    /// Pops the head only if `accept` holds for it.
    pub fn pop_if(&self, accept: impl FnOnce(&FrameRecord) -> bool) -> Option<FrameRecord> {
        let mut records = self.records.lock();
        match records.front() {
            Some(head) if accept(head) => records.pop_front(),
            _ => None,
        }
    }

    /// Pops the head, waiting up to `timeout` for one to be pushed.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameRecord> {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock();
        while records.is_empty() {
            if self.pushed.wait_until(&mut records, deadline).timed_out() {
                break;
            }
        }
        records.pop_front()
    }

    /// Drops every queued record and returns how many there were.
    pub fn drain(&self) -> usize {
        let mut records = self.records.lock();
        let n = records.len();
        records.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Records popped by one [`FrameMatcher::poll`].
#[derive(Debug, Default, PartialEq)]
pub struct MatchOutcome {
    /// Records whose frame was reported ready, in queue order.
    pub matched: Vec<FrameRecord>,
    /// Records given up on after staying unmatched for too many polls.
    pub lost: Vec<FrameRecord>,
}

/// Pairs queued records with the frame ids the camera reports.
pub struct FrameMatcher {
    queue: Arc<FrameQueue>,
    ready: BTreeSet<usize>,
    /// Ids of dropped records whose frame may still be reported late.
    abandoned: BTreeSet<usize>,
    unmatched_polls: usize,
    max_unmatched_polls: usize,
}

impl FrameMatcher {
    pub fn new(queue: Arc<FrameQueue>, max_unmatched_polls: usize) -> Self {
        Self {
            queue,
            ready: BTreeSet::new(),
            abandoned: BTreeSet::new(),
            unmatched_polls: 0,
            max_unmatched_polls,
        }
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Registers `new_ids` as ready and pops every head record whose frame is ready.
    ///
    /// When the head stays unmatched for more than `max_unmatched_polls` consecutive polls it
    /// is dropped as lost and matching continues behind it. A late report for a lost record is
    /// swallowed, so it cannot pair with a later record that reuses the id.
    pub fn poll(&mut self, new_ids: &[usize]) -> MatchOutcome {
        for &id in new_ids {
            if !self.abandoned.remove(&id) {
                self.ready.insert(id);
            }
        }
        let mut outcome = MatchOutcome::default();
        loop {
            self.pop_ready(&mut outcome.matched);
            if self.queue.is_empty() || !outcome.matched.is_empty() {
                self.unmatched_polls = 0;
                break;
            }
            self.unmatched_polls += 1;
            if self.unmatched_polls <= self.max_unmatched_polls {
                break;
            }
            self.unmatched_polls = 0;
            match self.queue.pop_if(|_| true) {
                Some(record) => {
                    warn!(
                        frame_id = record.frame_id,
                        polls = self.max_unmatched_polls,
                        "frame never reported by the camera, dropping its record"
                    );
                    self.ready.remove(&record.frame_id);
                    self.abandoned.insert(record.frame_id);
                    outcome.lost.push(record);
                }
                None => break,
            }
        }
        outcome
    }

    fn pop_ready(&mut self, matched: &mut Vec<FrameRecord>) {
        let ready = &mut self.ready;
        while let Some(record) = self.queue.pop_if(|head| ready.contains(&head.frame_id)) {
            ready.remove(&record.frame_id);
            matched.push(record);
        }
    }

    /// Forgets ready ids and drains the queue. Returns the number of dropped records.
    pub fn clear(&mut self) -> usize {
        self.ready.clear();
        self.abandoned.clear();
        self.unmatched_polls = 0;
        self.queue.drain()
    }
}

/// Data-to-signal verdict channel.
#[derive(Clone)]
pub struct ResultQueue {
    tx: Sender<f64>,
    rx: Receiver<f64>,
}

impl ResultQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn put(&self, value: f64) {
        // Both ends live in `self`, so the send cannot fail.
        let _ = self.tx.send(value);
    }

    pub fn try_get(&self) -> Option<f64> {
        self.rx.try_recv().ok()
    }

    /// Blocks until a value arrives, checking `stop` every `poll_interval`.
    ///
    /// Returns `Ok(None)` when `stop` is raised first and a timeout error after `timeout`.
    pub fn get(&self, stop: &StopFlag, poll_interval: Duration, timeout: Duration) -> Result<Option<f64>> {
        let deadline = Instant::now() + timeout;
        loop {
            if stop.is_set() {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AcquisitionError::QueueTimeout(timeout));
            }
            match self.rx.recv_timeout(poll_interval.min(deadline - now)) {
                Ok(value) => return Ok(Some(value)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

impl Default for ResultQueue {
    fn default() -> Self {
        Self::new()
    }
}
