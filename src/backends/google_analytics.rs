//! Google Analytics classic (`_gaq`) adapter.
//!
//! GA has no notion of per-event custom properties, so tests reach it as
//! their own "(Test) name / version" events.

use serde_json::{json, Value};

use crate::backends::beacon::{attached, Beacon};
use crate::backends::{Backend, Capabilities};
use crate::error::Result;
use crate::events::EventRecord;

pub struct GoogleAnalytics {
    beacon: Option<Box<dyn Beacon>>,
}

impl GoogleAnalytics {
    pub const NAME: &'static str = "google_analytics";

    pub fn new(beacon: impl Beacon + 'static) -> Self {
        Self { beacon: Some(Box::new(beacon)) }
    }

    /// An adapter with no tracker on the page; reports itself unavailable.
    pub fn detached() -> Self {
        Self { beacon: None }
    }

    /// `["_trackEvent", category, action, label, value]`.
    pub fn payload(event: &EventRecord) -> Value {
        json!([
            "_trackEvent",
            event.category,
            event.name,
            event.description,
            event.info.get("value").cloned().unwrap_or(Value::Null),
        ])
    }
}

impl Backend for GoogleAnalytics {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_available(&self) -> bool {
        self.beacon.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.tests_as_events()
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<()> {
        attached(&mut self.beacon, Self::NAME)?.push(Self::payload(event))
    }
}
