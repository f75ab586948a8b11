//! Presentation hook: how a committed version reaches the page.
//!
//! The engine never touches markup itself. It describes the change with a
//! [`Presentation`] derived from the test's [`TestKind`] and hands it to the
//! host's [`VariantApplier`].

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::Result;
use crate::experiment::definition::{TestDefinition, TestKind};

/// The concrete change for one committed test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Presentation {
    /// Add `class` and the applied marker to the target's class list.
    Class {
        target: Option<String>,
        class: String,
        marker: String,
    },
    /// Set `attribute = value` on the target and add the applied marker.
    Attribute {
        target: Option<String>,
        attribute: String,
        value: String,
        marker: String,
    },
}

impl Presentation {
    pub fn for_test(test: &TestDefinition, version: &str, marker: &str) -> Self {
        match &test.kind {
            TestKind::Class => Presentation::Class {
                target: test.target.clone(),
                class: version.to_string(),
                marker: marker.to_string(),
            },
            TestKind::Attribute(attribute) => Presentation::Attribute {
                target: test.target.clone(),
                attribute: attribute.clone(),
                value: version.to_string(),
                marker: marker.to_string(),
            },
        }
    }
}

pub trait VariantApplier {
    fn apply(&mut self, test: &TestDefinition, presentation: &Presentation) -> Result<()>;
}

/// Discards every change. The default when the host has no presentation layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplier;

impl VariantApplier for NoopApplier {
    fn apply(&mut self, _test: &TestDefinition, _presentation: &Presentation) -> Result<()> {
        Ok(())
    }
}

/// Records every change; clones share the record.
#[derive(Debug, Default, Clone)]
pub struct RecordingApplier {
    applied: Arc<Mutex<Vec<(String, Presentation)>>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(test name, change)` pairs in application order.
    pub fn applied(&self) -> Vec<(String, Presentation)> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl VariantApplier for RecordingApplier {
    fn apply(&mut self, test: &TestDefinition, presentation: &Presentation) -> Result<()> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((test.name.clone(), presentation.clone()));
        Ok(())
    }
}
