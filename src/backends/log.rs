//! Adapter that writes every event to the `tracing` log.

use crate::backends::{Backend, Capabilities};
use crate::error::Result;
use crate::events::EventRecord;

/// Logs events at `info` under the `abtune::events` target.
#[derive(Debug, Clone, Default)]
pub struct LogBackend {
    with_tests: bool,
}

impl LogBackend {
    pub const NAME: &'static str = "log";

    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for events with test statuses embedded.
    pub fn with_tests(mut self) -> Self {
        self.with_tests = true;
        self
    }
}

impl Backend for LogBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        if self.with_tests {
            Capabilities::NONE.tests_with_events()
        } else {
            Capabilities::NONE
        }
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<()> {
        let info = serde_json::to_string(&event.info)?;
        tracing::info!(
            target: "abtune::events",
            event = %event.name,
            category = %event.category,
            timestamp_ms = event.timestamp_ms,
            info = %info,
            "event"
        );
        Ok(())
    }
}
