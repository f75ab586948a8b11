//! Test definitions, version selection and the per-session test run.

pub mod applier;
pub mod definition;
pub mod runner;
pub mod selector;

pub use applier::{NoopApplier, Presentation, RecordingApplier, VariantApplier};
pub use definition::{
    validate_all, Eligibility, OnSelected, Picker, TestDefinition, TestEntry, TestKind, TestSchema,
    VersionStorePolicy,
};
pub use runner::{ExperimentRunner, RunContext, TestRunState, DEFAULT_APPLIED_MARKER, TEST_EVENT_CATEGORY};
pub use selector::{select, select_version, Selection, SelectionSource};
