//! # Stage: Session Context
//!
//! ## Responsibility
//! Everything the selector may consult about the current visit: URL
//! overrides parsed once from the query string, the persisted variant blob,
//! and the lazily created session identity.
//!
//! ## Guarantees
//! - The variant blob lives under one key: `{testName: index | "value"}`
//! - The identity is created at most once per session and persisted with its
//!   own expiry the first time it is read
//! - Malformed persisted values read as absent rather than failing
//!
//! ## NOT Responsible For
//! - Choosing versions (that is [`crate::experiment::selector`])
//! - Storage mechanics (that is [`crate::store`])

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::random::IdGenerator;
use crate::store::{days, MemoryStore, PersistenceAdapter};

pub const DEFAULT_VARIANTS_KEY: &str = "tuned_tests";
pub const DEFAULT_VARIANTS_DAYS: u32 = 100;
pub const DEFAULT_IDENTITY_KEY: &str = "tuned_identity";
pub const DEFAULT_IDENTITY_DAYS: u32 = 365;

/// One persisted assignment, in the shape chosen by the test's
/// [`crate::experiment::VersionStorePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredVersion {
    Index(usize),
    Value(String),
}

/// Per-visit state consulted and updated during assignment.
pub struct SessionContext {
    url_overrides: HashMap<String, String>,
    store: Box<dyn PersistenceAdapter>,
    variants_key: String,
    variants_ttl: Duration,
    identity_key: String,
    identity_ttl: Duration,
    identity: Option<String>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("url_overrides", &self.url_overrides)
            .field("variants_key", &self.variants_key)
            .field("identity_key", &self.identity_key)
            .field("identity", &self.identity)
            .finish()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }
}

impl SessionContext {
    pub fn new(store: Box<dyn PersistenceAdapter>) -> Self {
        Self {
            url_overrides: HashMap::new(),
            store,
            variants_key: DEFAULT_VARIANTS_KEY.to_string(),
            variants_ttl: days(DEFAULT_VARIANTS_DAYS),
            identity_key: DEFAULT_IDENTITY_KEY.to_string(),
            identity_ttl: days(DEFAULT_IDENTITY_DAYS),
            identity: None,
        }
    }

    /// Use the parameters of `query` (`a=1&b=x`, optional leading `?`) as
    /// URL overrides.
    pub fn with_query(self, query: &str) -> Self {
        self.with_overrides(parse_query(query))
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.url_overrides = overrides;
        self
    }

    pub fn with_variants_key(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.variants_key = key.into();
        self.variants_ttl = ttl;
        self
    }

    pub fn with_identity_key(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.identity_key = key.into();
        self.identity_ttl = ttl;
        self
    }

    // -----------------------------------------------------------------------
    // URL overrides
    // -----------------------------------------------------------------------

    pub fn url_override(&self, test: &str) -> Option<&str> {
        self.url_overrides.get(test).map(String::as_str)
    }

    pub fn url_overrides(&self) -> &HashMap<String, String> {
        &self.url_overrides
    }

    // -----------------------------------------------------------------------
    // Persisted variants
    // -----------------------------------------------------------------------

    fn variant_blob(&self) -> Map<String, Value> {
        match self.store.read(&self.variants_key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Previously persisted assignment for `test`, if any.
    pub fn persisted_variant(&self, test: &str) -> Option<StoredVersion> {
        let value = self.variant_blob().remove(test)?;
        serde_json::from_value(value).ok()
    }

    /// Persist `stored` for `test`, refreshing the blob's expiry.
    pub fn persist_variant(&mut self, test: &str, stored: StoredVersion) -> Result<()> {
        let mut blob = self.variant_blob();
        blob.insert(test.to_string(), serde_json::to_value(stored)?);
        self.store
            .write(&self.variants_key, Value::Object(blob), self.variants_ttl)
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// The session identity: cached, else persisted, else newly generated
    /// and persisted. A failed write still yields the generated id.
    pub fn identity(&mut self, generator: &mut dyn IdGenerator) -> String {
        if let Some(id) = &self.identity {
            return id.clone();
        }
        let id = match self.store.read(&self.identity_key) {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => {
                let id = generator.generate();
                if let Err(e) = self.store.write(
                    &self.identity_key,
                    Value::String(id.clone()),
                    self.identity_ttl,
                ) {
                    tracing::warn!(error = %e, "could not persist session identity");
                }
                id
            }
        };
        self.identity = Some(id.clone());
        id
    }

    /// Adopt a caller-supplied identity and persist it.
    pub fn set_identity(&mut self, id: &str) -> Result<()> {
        self.identity = Some(id.to_string());
        self.store
            .write(&self.identity_key, Value::String(id.to_string()), self.identity_ttl)
    }
}

// ---------------------------------------------------------------------------
// Query parsing
// ---------------------------------------------------------------------------

/// Parse `a=1&b=two` into a map. Later duplicates win; a bare key maps to
/// the empty string.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Form-style decoding: `+` is a space, `%XX` a byte. Malformed escapes are
/// kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
