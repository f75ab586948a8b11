//! # Stage: Configuration
//!
//! ## Responsibility
//! The engine's options as one `serde` struct, loadable from TOML, with every
//! field defaulted so an empty file is a valid configuration.
//!
//! ```toml
//! tests_at_once = 2
//! persistence_duration_days = 30
//!
//! [test_schema]
//! persistent = true
//!
//! [[tests]]
//! name = "cta-color"
//! versions = ["red", "blue"]
//! element = "#signup"
//! ```
//!
//! ## Guarantees
//! - Tests are resolved against `test_schema` once, at load time
//! - Unknown keys are rejected at every level (top level, `test_schema`,
//!   each `[[tests]]` entry, `event_schema`), so a typo fails loudly instead
//!   of silently falling back to a default
//!
//! ## NOT Responsible For
//! - Validating individual tests (that happens when the runner is built)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};
use crate::events::EventSchema;
use crate::experiment::{TestDefinition, TestEntry, TestSchema, DEFAULT_APPLIED_MARKER};
use crate::session::{
    DEFAULT_IDENTITY_DAYS, DEFAULT_IDENTITY_KEY, DEFAULT_VARIANTS_DAYS, DEFAULT_VARIANTS_KEY,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuneConfig {
    /// Kill switch for event emission and test-as-event forwarding.
    pub active: bool,
    /// Route trapped runtime errors into the event pipeline.
    pub report_errors: bool,
    /// Cap on tests evaluated in the first pass; `None` evaluates all.
    pub tests_at_once: Option<usize>,
    pub use_url_overrides: bool,
    /// Marker handed to the applier alongside every applied version.
    pub test_applied_class: String,
    pub tests: Vec<TestEntry>,
    pub test_schema: TestSchema,
    pub event_schema: EventSchema,
    pub persistence_key_name: String,
    pub persistence_duration_days: u32,
    pub identity_key_name: String,
    pub identity_duration_days: u32,
    /// Explicit backend names. Bypasses availability detection.
    pub backends: Option<Vec<String>>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            active: true,
            report_errors: true,
            tests_at_once: None,
            use_url_overrides: true,
            test_applied_class: DEFAULT_APPLIED_MARKER.to_string(),
            tests: Vec::new(),
            test_schema: TestSchema::default(),
            event_schema: EventSchema::default(),
            persistence_key_name: DEFAULT_VARIANTS_KEY.to_string(),
            persistence_duration_days: DEFAULT_VARIANTS_DAYS,
            identity_key_name: DEFAULT_IDENTITY_KEY.to_string(),
            identity_duration_days: DEFAULT_IDENTITY_DAYS,
            backends: None,
        }
    }
}

impl TuneConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TuneConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            TuneError::Toml(inner) => {
                TuneError::configuration(format!("{}: {}", path.display(), inner))
            }
            other => other,
        })
    }

    /// Checks that span the whole file. Per-test checks run later.
    pub fn validate(&self) -> Result<()> {
        if self.persistence_key_name.is_empty() || self.identity_key_name.is_empty() {
            return Err(TuneError::configuration("persistence key names must not be empty"));
        }
        if self.persistence_key_name == self.identity_key_name {
            return Err(TuneError::configuration(format!(
                "persistence_key_name and identity_key_name are both '{}'",
                self.persistence_key_name
            )));
        }
        Ok(())
    }

    /// Configured tests with `test_schema` filled in.
    pub fn resolve_tests(&self) -> Vec<TestDefinition> {
        self.tests.iter().map(|e| e.resolve(&self.test_schema)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{TestKind, VersionStorePolicy};
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        let c = TuneConfig::from_toml_str("").unwrap();
        assert_eq!(c, TuneConfig::default());
        assert!(c.active);
        assert!(c.report_errors);
        assert!(c.use_url_overrides);
        assert_eq!(c.test_applied_class, "tuned");
        assert_eq!(c.persistence_key_name, "tuned_tests");
        assert_eq!(c.persistence_duration_days, 100);
        assert_eq!(c.identity_key_name, "tuned_identity");
        assert_eq!(c.identity_duration_days, 365);
        assert!(c.backends.is_none());
    }

    #[test]
    fn test_full_file() {
        let c = TuneConfig::from_toml_str(
            r##"
            active = false
            tests_at_once = 1
            backends = ["mixpanel"]

            [test_schema]
            persistent = true
            version_store_policy = "by_value"

            [event_schema]
            category = "Site"

            [[tests]]
            name = "cta-color"
            versions = ["red", "blue"]

            [[tests]]
            name = "hero"
            versions = ["a.png", "b.png"]
            persistent = false
            kind = { attribute = "src" }
            "##,
        )
        .unwrap();

        assert!(!c.active);
        assert_eq!(c.tests_at_once, Some(1));
        assert_eq!(c.backends, Some(vec!["mixpanel".to_string()]));
        assert_eq!(c.event_schema.category, "Site");

        let tests = c.resolve_tests();
        assert!(tests[0].persistent);
        assert_eq!(tests[0].version_store_policy, VersionStorePolicy::ByValue);
        assert!(!tests[1].persistent);
        assert_eq!(tests[1].kind, TestKind::Attribute("src".into()));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = TuneConfig::from_toml_str("tests_at_onse = 2").unwrap_err();
        assert!(matches!(err, TuneError::Toml(_)));
    }

    #[test]
    fn test_mistyped_test_key_rejected() {
        let err = TuneConfig::from_toml_str(
            r#"
            [[tests]]
            name = "cta-color"
            versions = ["red", "blue"]
            sample_sise = 0.1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, TuneError::Toml(_)));
        assert!(err.to_string().contains("sample_sise"));
    }

    #[test]
    fn test_mistyped_schema_keys_rejected() {
        assert!(TuneConfig::from_toml_str("[test_schema]\nalways_runs = true").is_err());
        assert!(TuneConfig::from_toml_str("[event_schema]\ncatgory = \"x\"").is_err());
    }

    #[test]
    fn test_entry_aliases_still_accepted() {
        let c = TuneConfig::from_toml_str(
            "[[tests]]\nname = \"t\"\nversions = [\"a\"]\npersist = true\nelement = \".hero\"",
        )
        .unwrap();
        assert_eq!(c.tests[0].persistent, Some(true));
        assert_eq!(c.tests[0].target.as_deref(), Some(".hero"));
    }

    #[test]
    fn test_same_key_names_rejected() {
        let err = TuneConfig::from_toml_str(
            r#"
            persistence_key_name = "k"
            identity_key_name = "k"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, TuneError::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[[tests]]\nname = \"t\"\nversions = [\"a\"]").unwrap();
        let c = TuneConfig::load(f.path()).unwrap();
        assert_eq!(c.tests.len(), 1);
    }

    #[test]
    fn test_load_parse_error_names_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "tests = 5").unwrap();
        let err = TuneConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, TuneError::Configuration(_)));
        assert!(err.to_string().contains(&f.path().display().to_string()));
    }

    #[test]
    fn test_load_missing_file_is_io() {
        let err = TuneConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, TuneError::Io(_)));
    }
}
