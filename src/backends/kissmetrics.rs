//! KISSmetrics (`_kmq`) adapter.

use serde_json::{json, Value};

use crate::backends::beacon::{attached, Beacon};
use crate::backends::{Backend, Capabilities};
use crate::error::Result;
use crate::events::EventRecord;

pub struct KissMetrics {
    beacon: Option<Box<dyn Beacon>>,
}

impl KissMetrics {
    pub const NAME: &'static str = "kissmetrics";

    pub fn new(beacon: impl Beacon + 'static) -> Self {
        Self { beacon: Some(Box::new(beacon)) }
    }

    pub fn detached() -> Self {
        Self { beacon: None }
    }

    pub fn payload(event: &EventRecord) -> Value {
        json!(["record", event.name, event.info])
    }
}

impl Backend for KissMetrics {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_available(&self) -> bool {
        self.beacon.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.tests_with_events().identifies()
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<()> {
        attached(&mut self.beacon, Self::NAME)?.push(Self::payload(event))
    }

    fn identify(&mut self, id: &str) -> Result<()> {
        attached(&mut self.beacon, Self::NAME)?.push(json!(["identify", id]))
    }
}
