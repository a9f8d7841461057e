//! Worker → controller event stream
//!
//! A worker runs on its own thread and reports through a bounded channel of
//! [`WorkerEvent`]s: any number of `Log`s, then exactly one `Error` or one
//! `Complete`. The controller only observes; there is no way to cancel a
//! running worker.

use crate::error::{InstallError, Result};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;
use tracing::{error, info};

/// Default number of undelivered events before a worker blocks
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Log(String),
    Error(String),
    Complete,
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Complete)
    }
}

/// Sending half handed to a worker
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: SyncSender<WorkerEvent>,
}

impl EventSender {
    /// A dropped receiver just means nobody is watching; the worker carries on
    fn send(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(WorkerEvent::Log(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.send(WorkerEvent::Error(message));
    }

    pub fn complete(&self) {
        self.send(WorkerEvent::Complete);
    }
}

/// Receiving half held by the controller
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<WorkerEvent>,
}

impl EventReceiver {
    /// Next event, or `None` once the worker is gone and the queue is empty
    pub fn recv(&self) -> Option<WorkerEvent> {
        self.rx.recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = WorkerEvent> + '_ {
        self.rx.iter()
    }

    /// Everything until the worker drops its sender
    pub fn drain(&self) -> Vec<WorkerEvent> {
        self.rx.iter().collect()
    }
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (EventSender { tx }, EventReceiver { rx })
}

/// A worker running on a dedicated thread
#[derive(Debug)]
pub struct WorkerHandle<T> {
    pub events: EventReceiver,
    thread: JoinHandle<T>,
}

impl<T> WorkerHandle<T> {
    /// Wait for the worker's return value
    pub fn join(self) -> Result<T> {
        self.thread
            .join()
            .map_err(|_| InstallError::worker("worker thread panicked"))
    }
}

/// Run `work` on a named thread; its events arrive on the handle.
pub fn spawn_worker<T, F>(name: &str, capacity: usize, work: F) -> Result<WorkerHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(&EventSender) -> T + Send + 'static,
{
    let (tx, events) = channel(capacity);
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || work(&tx))
        .map_err(|e| InstallError::worker(format!("could not start {}: {}", name, e)))?;
    Ok(WorkerHandle { events, thread })
}
