//! Adapter that keeps delivered events in a shared buffer.

use std::sync::{Arc, Mutex};

use crate::backends::{Backend, Capabilities};
use crate::error::{Result, TuneError};
use crate::events::EventRecord;

#[derive(Debug, Default)]
struct Delivered {
    events: Vec<EventRecord>,
    identities: Vec<String>,
    failing: Option<String>,
}

/// In-memory sink. Clones share one buffer, so a handle kept by the host sees
/// what the engine delivered to the registered copy.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    name: String,
    capabilities: Capabilities,
    inner: Arc<Mutex<Delivered>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Self::NAME)
    }
}

impl MemoryBackend {
    pub const NAME: &'static str = "memory";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::NONE,
            inner: Arc::new(Mutex::new(Delivered::default())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make every subsequent call fail with `detail`.
    pub fn fail_with(&self, detail: impl Into<String>) {
        self.lock().failing = Some(detail.into());
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.lock().events.clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.lock().events.iter().map(|e| e.name.clone()).collect()
    }

    pub fn identities(&self) -> Vec<String> {
        self.lock().identities.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Delivered> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<()> {
        match &self.lock().failing {
            Some(detail) => Err(TuneError::delivery(self.name.clone(), detail.clone())),
            None => Ok(()),
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<()> {
        self.check()?;
        self.lock().events.push(event.clone());
        Ok(())
    }

    fn identify(&mut self, id: &str) -> Result<()> {
        self.check()?;
        self.lock().identities.push(id.to_string());
        Ok(())
    }
}
