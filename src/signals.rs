//! # Stage: Lifecycle Signals
//!
//! ## Responsibility
//! Broadcast observable engine milestones (test committed, event complete,
//! per-backend delivery and failure, trapped runtime errors) to any number of
//! subscribers.
//!
//! ## Guarantees
//! - Non-blocking: `emit` never waits; with no subscribers signals are dropped
//! - Bounded: the channel holds at most `capacity` signals; a slow subscriber
//!   observes `RecvError::Lagged` instead of stalling the engine
//!
//! ## NOT Responsible For
//! - Running subscriber callbacks (subscribers poll their own receivers)

use tokio::sync::broadcast;

use crate::events::{EventRecord, RuntimeErrorReport};
use crate::experiment::SelectionSource;

/// Default number of signals buffered per subscriber.
pub const SIGNAL_CHANNEL_CAP: usize = 256;

/// One engine milestone.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A test was assigned a version and marked running.
    TestCommitted {
        test: String,
        version: String,
        source: SelectionSource,
    },
    /// The selector failed; the test stays not running.
    AssignmentFailed { test: String, error: String },
    /// A record was appended to the event log.
    EventComplete(EventRecord),
    EventSentToBackend { event: String, backend: String },
    BackendFailed {
        backend: String,
        /// Event name, or `None` for an identify call.
        event: Option<String>,
        error: String,
    },
    /// A runtime error was trapped, before it is dispatched as an event.
    ErrorTrapped(RuntimeErrorReport),
    Identified { id: String },
}

/// Fan-out channel for [`Signal`]s.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(SIGNAL_CHANNEL_CAP)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn emit(&self, signal: Signal) {
        // Err only means nobody is listening.
        let _ = self.tx.send(signal);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Drain everything currently buffered on `rx`, skipping over lag gaps.
pub fn drain(rx: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
    use broadcast::error::TryRecvError;
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(signal) => out.push(signal),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    out
}
