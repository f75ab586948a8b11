//! # Stage: Variant Selector
//!
//! ## Responsibility
//! Map one test definition plus the session context to the version this
//! session sees. Resolution order, first applicable branch wins:
//!
//! 1. URL override (numeric → index into `versions`, otherwise the literal)
//! 2. Persisted assignment for persistent tests (drawn and persisted if absent)
//! 3. Custom picker, when it yields a non-empty version
//! 4. Uniform random draw over `versions`
//!
//! ## Guarantees
//! - Deterministic for a fixed random source and fixed override/persisted state
//! - Only branch 2 writes to persistence
//! - An out-of-range numeric override is a [`TuneError::Assignment`], never a
//!   silent fallthrough
//!
//! ## NOT Responsible For
//! - Sampling (`sample_size`) and eligibility (that is the runner)
//! - Committing run state

use std::fmt;

use crate::error::{Result, TuneError};
use crate::experiment::definition::{TestDefinition, VersionStorePolicy};
use crate::random::RandomSource;
use crate::session::{SessionContext, StoredVersion};

/// Which resolution branch produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    UrlOverride,
    /// A previously persisted assignment was reused.
    Persisted,
    /// A persistent test had no usable assignment; one was drawn and stored.
    PersistedFresh,
    Picker,
    Random,
}

impl fmt::Display for SelectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionSource::UrlOverride => "url_override",
            SelectionSource::Persisted => "persisted",
            SelectionSource::PersistedFresh => "persisted_fresh",
            SelectionSource::Picker => "picker",
            SelectionSource::Random => "random",
        };
        write!(f, "{s}")
    }
}

/// A chosen version and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub version: String,
    pub source: SelectionSource,
}

/// Choose the version `test` shows in this session.
pub fn select_version(
    test: &TestDefinition,
    session: &mut SessionContext,
    rng: &mut dyn RandomSource,
) -> Result<String> {
    select(test, session, rng).map(|s| s.version)
}

/// Like [`select_version`], also reporting the branch taken.
pub fn select(
    test: &TestDefinition,
    session: &mut SessionContext,
    rng: &mut dyn RandomSource,
) -> Result<Selection> {
    if let Some(raw) = session.url_override(&test.name).map(str::to_owned) {
        let version = resolve_override(test, &raw)?;
        return Ok(Selection { version, source: SelectionSource::UrlOverride });
    }

    if test.persistent {
        if let Some(version) = session
            .persisted_variant(&test.name)
            .and_then(|stored| resolve_stored(test, stored))
        {
            return Ok(Selection { version, source: SelectionSource::Persisted });
        }

        let idx = rng.next_index(test.versions.len());
        let version = version_at(test, idx)?;
        let stored = match test.version_store_policy {
            VersionStorePolicy::ByIndex => StoredVersion::Index(idx),
            VersionStorePolicy::ByValue => StoredVersion::Value(version.clone()),
        };
        if let Err(e) = session.persist_variant(&test.name, stored) {
            tracing::warn!(test = %test.name, error = %e, "could not persist assignment");
        }
        return Ok(Selection { version, source: SelectionSource::PersistedFresh });
    }

    if let Some(picker) = &test.picker {
        if let Some(version) = picker(test).filter(|v| !v.is_empty()) {
            return Ok(Selection { version, source: SelectionSource::Picker });
        }
    }

    let idx = rng.next_index(test.versions.len());
    Ok(Selection { version: version_at(test, idx)?, source: SelectionSource::Random })
}

/// Numeric overrides index into `versions`; anything else is used verbatim.
/// A digit string too large for `usize` is out of range, not a literal.
fn resolve_override(test: &TestDefinition, raw: &str) -> Result<String> {
    let digits = raw.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(raw.to_string());
    }
    let index = digits.parse::<usize>().unwrap_or(usize::MAX);
    test.versions.get(index).cloned().ok_or_else(|| TuneError::Assignment {
        test: test.name.clone(),
        index,
        len: test.versions.len(),
    })
}

/// A stored value whose shape does not match the policy, or an index past
/// the end of `versions`, is unusable.
fn resolve_stored(test: &TestDefinition, stored: StoredVersion) -> Option<String> {
    match (test.version_store_policy, stored) {
        (VersionStorePolicy::ByIndex, StoredVersion::Index(idx)) => test.versions.get(idx).cloned(),
        (VersionStorePolicy::ByValue, StoredVersion::Value(v)) => Some(v),
        _ => None,
    }
}

fn version_at(test: &TestDefinition, idx: usize) -> Result<String> {
    test.versions.get(idx).cloned().ok_or_else(|| {
        TuneError::configuration(format!("test '{}' has no versions", test.name))
    })
}
