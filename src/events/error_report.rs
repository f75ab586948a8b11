//! Trapped runtime errors, converted into ordinary events.
//!
//! The host wires its error trap to [`crate::Tuner::report_error`]; the
//! resulting event goes through normal dispatch, so duplicate suppression
//! and fan-out apply to it unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::record::EventInput;

/// Event name used for trapped runtime errors.
pub const RUNTIME_ERROR_EVENT: &str = "runtime-error";
pub const RUNTIME_ERROR_CATEGORY: &str = "Error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeErrorReport {
    pub message: String,
    pub source_url: String,
    pub line: Option<u32>,
}

impl RuntimeErrorReport {
    pub fn new(message: impl Into<String>, source_url: impl Into<String>, line: Option<u32>) -> Self {
        Self { message: message.into(), source_url: source_url.into(), line }
    }

    /// `url:line`, or just the url when the line is unknown.
    pub fn source_location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.source_url, line),
            None => self.source_url.clone(),
        }
    }

    pub fn to_event(&self) -> EventInput {
        EventInput::named(RUNTIME_ERROR_EVENT)
            .category(RUNTIME_ERROR_CATEGORY)
            .description(self.message.clone())
            .info("sourceLocation", self.source_location())
            .info("url", self.source_url.clone())
            .info("line", self.line.map(Value::from).unwrap_or(Value::Null))
    }
}
