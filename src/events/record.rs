//! Event input, the normalized [`EventRecord`], and the layering between them.
//!
//! Precedence, lowest first: [`EventSchema`] defaults, then the page context
//! captured for this call, then whatever the caller set on [`EventInput`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::context::PageContext;

/// Prefix of the per-test keys embedded for `sends_tests_with_events` backends.
pub const TEST_KEY_PREFIX: &str = "(Test) ";

/// Status of one test as embedded in an event.
///
/// Serialized as the version string, or `null` when the test is not running,
/// so any version name (including the info marker) round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum TestStatus {
    Running(String),
    NotRunning,
}

impl TestStatus {
    /// Marker written into `info` for tests that are not running.
    pub const NOT_RUNNING: &'static str = "not running";

    pub fn version(&self) -> Option<&str> {
        match self {
            TestStatus::Running(v) => Some(v),
            TestStatus::NotRunning => None,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Running(v) => write!(f, "{v}"),
            TestStatus::NotRunning => write!(f, "{}", Self::NOT_RUNNING),
        }
    }
}

impl From<TestStatus> for Option<String> {
    fn from(status: TestStatus) -> Self {
        match status {
            TestStatus::Running(v) => Some(v),
            TestStatus::NotRunning => None,
        }
    }
}

impl From<Option<String>> for TestStatus {
    fn from(version: Option<String>) -> Self {
        match version {
            Some(v) => TestStatus::Running(v),
            None => TestStatus::NotRunning,
        }
    }
}

/// Test name → status, for every loaded test.
pub type TestSnapshot = BTreeMap<String, TestStatus>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Which backends an event fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Audience {
    #[default]
    All,
    /// Only backends declaring `sends_tests_as_events`. Used for the
    /// synthetic "(Test) name / version" events.
    TestsAsEvents,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventOptions {
    /// Drop this event if one with the same name is already in the log.
    pub ignore_duplicates: bool,
    #[serde(skip)]
    pub audience: Audience,
}

// ---------------------------------------------------------------------------
// EventSchema
// ---------------------------------------------------------------------------

/// Defaults merged under every event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventSchema {
    pub category: String,
    pub description: String,
    pub info: Map<String, Value>,
    pub options: EventOptions,
}

// ---------------------------------------------------------------------------
// EventInput
// ---------------------------------------------------------------------------

/// A bare name or a partial record. Unset fields fall back to the schema and
/// the page context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventInput {
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub info: Map<String, Value>,
    pub page_context: BTreeMap<String, String>,
    pub timestamp_ms: Option<u64>,
    pub ignore_duplicates: Option<bool>,
    pub audience: Option<Audience>,
}

impl EventInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    pub fn with_info(mut self, info: Map<String, Value>) -> Self {
        self.info.extend(info);
        self
    }

    pub fn page(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.page_context.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn ignore_duplicates(mut self) -> Self {
        self.ignore_duplicates = Some(true);
        self
    }

    pub fn with_options(mut self, options: EventOptions) -> Self {
        self.ignore_duplicates = Some(options.ignore_duplicates);
        self.audience = Some(options.audience);
        self
    }

    pub fn audience(mut self, audience: Audience) -> Self {
        self.audience = Some(audience);
        self
    }
}

impl From<&str> for EventInput {
    fn from(name: &str) -> Self {
        EventInput::named(name)
    }
}

impl From<String> for EventInput {
    fn from(name: String) -> Self {
        EventInput::named(name)
    }
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// A normalized event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub category: String,
    pub description: String,
    pub info: Map<String, Value>,
    pub timestamp_ms: u64,
    pub page_context: BTreeMap<String, String>,
    /// Filled only on copies sent to `sends_tests_with_events` backends.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub test_snapshot: TestSnapshot,
    pub options: EventOptions,
}

impl EventRecord {
    /// Layer `input` over the page context over `schema`.
    pub fn normalize(schema: &EventSchema, page: PageContext, input: EventInput) -> Self {
        let mut info = schema.info.clone();
        info.extend(input.info);

        let mut page_context = page.values;
        page_context.extend(input.page_context);

        EventRecord {
            name: input.name,
            category: input.category.unwrap_or_else(|| schema.category.clone()),
            description: input.description.unwrap_or_else(|| schema.description.clone()),
            info,
            timestamp_ms: input.timestamp_ms.unwrap_or(page.timestamp_ms),
            page_context,
            test_snapshot: TestSnapshot::new(),
            options: EventOptions {
                ignore_duplicates: input
                    .ignore_duplicates
                    .unwrap_or(schema.options.ignore_duplicates),
                audience: input.audience.unwrap_or(schema.options.audience),
            },
        }
    }

    /// Copy embedding every test's status, under `"(Test) {name}"` in `info`
    /// and in `test_snapshot`. Keys the caller already set are kept.
    pub fn with_tests(&self, snapshot: &TestSnapshot) -> Self {
        let mut record = self.clone();
        for (name, status) in snapshot {
            record
                .info
                .entry(format!("{TEST_KEY_PREFIX}{name}"))
                .or_insert_with(|| Value::String(status.to_string()));
        }
        record.test_snapshot = snapshot.clone();
        record
    }
}
