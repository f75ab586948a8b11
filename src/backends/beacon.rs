//! Host-side command queues the built-in adapters write to.
//!
//! A beacon stands in for the analytics snippet's queue (`_gaq`, `mpq`,
//! `_kmq`): adapters push JSON commands and the host ships them whenever it
//! likes. The core never waits on delivery.

use std::io;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{Result, TuneError};

pub trait Beacon: Send {
    fn push(&mut self, command: Value) -> Result<()>;
}

/// The attached beacon, or a delivery error naming `backend`.
pub(crate) fn attached<'a>(
    beacon: &'a mut Option<Box<dyn Beacon>>,
    backend: &str,
) -> Result<&'a mut Box<dyn Beacon>> {
    beacon
        .as_mut()
        .ok_or_else(|| TuneError::delivery(backend, "no beacon attached"))
}

#[derive(Debug, Default)]
struct QueueState {
    commands: Vec<Value>,
    closed: bool,
}

/// Shared in-memory command queue. Clones push to and drain the same queue.
#[derive(Debug, Clone, Default)]
pub struct QueueBeacon {
    state: Arc<Mutex<QueueState>>,
}

impl QueueBeacon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued command, oldest first.
    pub fn drain(&self) -> Vec<Value> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut guard.commands)
    }

    /// Copy of the queued commands, leaving them in place.
    pub fn snapshot(&self) -> Vec<Value> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.commands.clone()
    }

    pub fn len(&self) -> usize {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further pushes, as when the host tears down its queue.
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.closed = true;
    }
}

impl Beacon for QueueBeacon {
    fn push(&mut self, command: Value) -> Result<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.closed {
            return Err(TuneError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "beacon queue is closed",
            )));
        }
        guard.commands.push(command);
        Ok(())
    }
}
