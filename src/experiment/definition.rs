//! Test definitions and their layered defaults.
//!
//! A test is configured as a partial [`TestEntry`]; the configuration's
//! [`TestSchema`] supplies every field the entry leaves out. Explicit entry
//! fields always win. The resolved [`TestDefinition`] is validated before any
//! assignment runs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How a chosen version is applied to the presentation layer.
///
/// TOML: `kind = "class"` or `kind = { attribute = "data-variant" }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// The version is a class name toggled on the target.
    #[default]
    Class,
    /// The version is written to the named attribute of the target.
    Attribute(String),
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Class => write!(f, "class"),
            TestKind::Attribute(attr) => write!(f, "attribute:{attr}"),
        }
    }
}

/// What gets persisted for a persistent test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStorePolicy {
    /// The index into `versions`. Survives renaming a version, not reordering.
    #[default]
    ByIndex,
    /// The version string itself.
    ByValue,
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Custom version picker. `None` or an empty string falls through to a
/// uniform random draw.
pub type Picker = Arc<dyn Fn(&TestDefinition) -> Option<String> + Send + Sync>;

/// Eligibility predicate. `false` skips the test for this session.
pub type Eligibility = Arc<dyn Fn(&TestDefinition) -> bool + Send + Sync>;

/// Called with the committed version right after a test starts running.
pub type OnSelected = Arc<dyn Fn(&TestDefinition, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// TestSchema
// ---------------------------------------------------------------------------

/// Defaults merged into every configured test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestSchema {
    pub description: String,
    pub kind: TestKind,
    pub sample_size: f64,
    pub always_run: bool,
    pub persistent: bool,
    pub version_store_policy: VersionStorePolicy,
}

impl Default for TestSchema {
    fn default() -> Self {
        Self {
            description: String::new(),
            kind: TestKind::Class,
            sample_size: 1.0,
            always_run: false,
            persistent: false,
            version_store_policy: VersionStorePolicy::ByIndex,
        }
    }
}

// ---------------------------------------------------------------------------
// TestEntry
// ---------------------------------------------------------------------------

/// A test as written in the configuration; unset fields come from the schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestEntry {
    pub name: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TestKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_run: Option<bool>,
    #[serde(default, alias = "persist", skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_store_policy: Option<VersionStorePolicy>,
    /// Presentation target handed to the applier (e.g. a CSS selector).
    #[serde(default, alias = "element", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl TestEntry {
    /// Merge this entry over `schema`. Explicit fields win.
    pub fn resolve(&self, schema: &TestSchema) -> TestDefinition {
        TestDefinition {
            name: self.name.clone(),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| schema.description.clone()),
            kind: self.kind.clone().unwrap_or_else(|| schema.kind.clone()),
            sample_size: self.sample_size.unwrap_or(schema.sample_size),
            always_run: self.always_run.unwrap_or(schema.always_run),
            persistent: self.persistent.unwrap_or(schema.persistent),
            version_store_policy: self
                .version_store_policy
                .unwrap_or(schema.version_store_policy),
            versions: self.versions.clone(),
            target: self.target.clone(),
            picker: None,
            should_run: None,
            on_selected: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TestDefinition
// ---------------------------------------------------------------------------

/// A fully resolved, immutable test.
#[derive(Clone)]
pub struct TestDefinition {
    pub name: String,
    pub description: String,
    pub kind: TestKind,
    /// Probability in `[0, 1]` that a session is included.
    pub sample_size: f64,
    /// Evaluated in the sweep after the capped pass even if the cap excluded it.
    pub always_run: bool,
    pub persistent: bool,
    pub version_store_policy: VersionStorePolicy,
    /// Ordered, non-empty.
    pub versions: Vec<String>,
    pub target: Option<String>,
    pub picker: Option<Picker>,
    pub should_run: Option<Eligibility>,
    pub on_selected: Option<OnSelected>,
}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("sample_size", &self.sample_size)
            .field("always_run", &self.always_run)
            .field("persistent", &self.persistent)
            .field("version_store_policy", &self.version_store_policy)
            .field("versions", &self.versions)
            .field("target", &self.target)
            .field("picker", &self.picker.is_some())
            .field("should_run", &self.should_run.is_some())
            .field("on_selected", &self.on_selected.is_some())
            .finish()
    }
}

impl TestDefinition {
    /// A test with schema defaults: always sampled, not persistent, class kind.
    pub fn new<I, S>(name: impl Into<String>, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TestEntry {
            name: name.into(),
            versions: versions.into_iter().map(Into::into).collect(),
            ..TestEntry::default()
        }
        .resolve(&TestSchema::default())
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_kind(mut self, kind: TestKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_sample_size(mut self, sample_size: f64) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn persistent(mut self, policy: VersionStorePolicy) -> Self {
        self.persistent = true;
        self.version_store_policy = policy;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_picker<F>(mut self, picker: F) -> Self
    where
        F: Fn(&TestDefinition) -> Option<String> + Send + Sync + 'static,
    {
        self.picker = Some(Arc::new(picker));
        self
    }

    pub fn with_should_run<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TestDefinition) -> bool + Send + Sync + 'static,
    {
        self.should_run = Some(Arc::new(predicate));
        self
    }

    pub fn with_on_selected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestDefinition, &str) + Send + Sync + 'static,
    {
        self.on_selected = Some(Arc::new(hook));
        self
    }

    /// `true` when `version` is one of the declared versions.
    pub fn has_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    /// Validate one definition in isolation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TuneError::configuration("test name must not be empty"));
        }
        if self.versions.is_empty() {
            return Err(TuneError::configuration(format!(
                "test '{}' must declare at least one version",
                self.name
            )));
        }
        if !self.sample_size.is_finite() || !(0.0..=1.0).contains(&self.sample_size) {
            return Err(TuneError::configuration(format!(
                "test '{}': sample_size must be in [0, 1], got {}",
                self.name, self.sample_size
            )));
        }
        if let TestKind::Attribute(attr) = &self.kind {
            if attr.trim().is_empty() {
                return Err(TuneError::configuration(format!(
                    "test '{}': attribute kind needs an attribute name",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Validate a whole run: every definition, plus name uniqueness.
pub fn validate_all(tests: &[TestDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for test in tests {
        test.validate()?;
        if !seen.insert(test.name.as_str()) {
            return Err(TuneError::configuration(format!(
                "duplicate test name '{}'",
                test.name
            )));
        }
    }
    Ok(())
}
