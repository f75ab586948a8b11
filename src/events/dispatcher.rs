//! # Stage: Event Dispatcher
//!
//! ## Responsibility
//! Turn caller input into a normalized [`EventRecord`], suppress repeats of
//! events marked `ignore_duplicates`, fan the record out to every registered
//! backend, and keep the append-only event log.
//!
//! ## Guarantees
//! - Inactive engine: nothing is normalized, logged or sent
//! - A suppressed event touches no backend and is not logged
//! - Backends declaring `sends_tests_with_events` get a copy with every test
//!   status embedded; the rest get the plain record
//! - One failing or panicking backend never blocks the others, and dispatch
//!   itself never fails
//!
//! ## NOT Responsible For
//! - Deciding test versions (it only reads the snapshot it is handed)
//! - Retrying failed deliveries

use crate::backends::{call_isolated, BackendRegistry};
use crate::events::context::PageContextProvider;
use crate::events::record::{Audience, EventInput, EventRecord, EventSchema, TestSnapshot};
use crate::signals::{Signal, SignalBus};

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Every record dispatched this session, oldest first.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    fn append(&mut self, record: EventRecord) {
        self.records.push(record);
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of handing one event to one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub backend: String,
    /// `Err` carries the rendered delivery error.
    pub result: std::result::Result<(), String>,
}

impl Delivery {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The engine is switched off.
    Inactive,
    /// Same-named event already logged and this one asked to be dropped.
    Suppressed,
    /// Logged and offered to the backends.
    Dispatched(Vec<Delivery>),
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched(_))
    }

    pub fn deliveries(&self) -> &[Delivery] {
        match self {
            DispatchOutcome::Dispatched(d) => d,
            _ => &[],
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &Delivery> {
        self.deliveries().iter().filter(|d| !d.is_ok())
    }
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

pub struct EventDispatcher {
    schema: EventSchema,
    page: Box<dyn PageContextProvider>,
    log: EventLog,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("schema", &self.schema)
            .field("logged", &self.log.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(schema: EventSchema, page: Box<dyn PageContextProvider>) -> Self {
        Self { schema, page, log: EventLog::default() }
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Layer `input` over a freshly captured page context over the schema.
    pub fn normalize(&self, input: EventInput) -> EventRecord {
        EventRecord::normalize(&self.schema, self.page.capture(), input)
    }

    pub fn dispatch(
        &mut self,
        input: impl Into<EventInput>,
        snapshot: &TestSnapshot,
        registry: &mut BackendRegistry,
        signals: &SignalBus,
        active: bool,
    ) -> DispatchOutcome {
        let input = input.into();
        if !active {
            tracing::debug!(event = %input.name, "engine inactive, event dropped");
            return DispatchOutcome::Inactive;
        }

        let record = self.normalize(input);
        if record.options.ignore_duplicates && self.log.contains(&record.name) {
            tracing::debug!(event = %record.name, "duplicate event suppressed");
            return DispatchOutcome::Suppressed;
        }

        self.log.append(record.clone());

        let mut embedded: Option<EventRecord> = None;
        let mut deliveries = Vec::new();
        for backend in registry.iter_mut() {
            let caps = backend.capabilities();
            if record.options.audience == Audience::TestsAsEvents && !caps.sends_tests_as_events {
                continue;
            }
            let name = backend.name().to_string();
            let result = if caps.sends_tests_with_events {
                let copy: &EventRecord = embedded.get_or_insert_with(|| record.with_tests(snapshot));
                call_isolated(&name, || backend.handle_event(copy))
            } else {
                call_isolated(&name, || backend.handle_event(&record))
            };

            match result {
                Ok(()) => {
                    tracing::debug!(event = %record.name, backend = %name, "event delivered");
                    signals.emit(Signal::EventSentToBackend {
                        event: record.name.clone(),
                        backend: name.clone(),
                    });
                    deliveries.push(Delivery { backend: name, result: Ok(()) });
                }
                Err(e) => {
                    tracing::warn!(event = %record.name, backend = %name, error = %e, "backend delivery failed");
                    signals.emit(Signal::BackendFailed {
                        backend: name.clone(),
                        event: Some(record.name.clone()),
                        error: e.to_string(),
                    });
                    deliveries.push(Delivery { backend: name, result: Err(e.to_string()) });
                }
            }
        }

        signals.emit(Signal::EventComplete(record));
        DispatchOutcome::Dispatched(deliveries)
    }
}
