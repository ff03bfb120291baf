//! Events published by acquisition features for the GUI/event layer.

use std::collections::HashMap;

use aslm_compiler_backend::Axis;
use crossbeam::channel::{unbounded, Receiver, Sender};

#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    /// `(position, metric)` points of the last sweep group.
    Autofocus {
        plot_data: Vec<(f64, f64)>,
        is_fit: bool,
        is_done: bool,
    },
    UpdateStage(HashMap<Axis, f64>),
    Warning(String),
}

/// Sending end of the event queue. A dropped receiver silently discards events.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<Sender<ModelEvent>>,
}

impl EventSender {
    pub fn channel() -> (Self, Receiver<ModelEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sender that drops everything.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: ModelEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("event receiver dropped");
            }
        }
    }
}
