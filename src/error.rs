//! Crate-level error type.
//!
//! Duplicate suppression has no variant here: a suppressed event is a
//! normal [`crate::events::DispatchOutcome`], not a failure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuneError {
    /// Invalid test definition or configuration file. Raised while the engine
    /// is built, never mid-session.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A numeric URL override pointed past the end of the test's versions.
    #[error("assignment error for test '{test}': override index {index} out of range for {len} versions")]
    Assignment {
        test: String,
        index: usize,
        len: usize,
    },

    /// A backend adapter returned an error or panicked while handling a call.
    #[error("backend '{backend}' failed to deliver: {detail}")]
    BackendDelivery { backend: String, detail: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TuneError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        TuneError::Configuration(msg.into())
    }

    pub fn delivery(backend: impl Into<String>, detail: impl Into<String>) -> Self {
        TuneError::BackendDelivery {
            backend: backend.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TuneError>;
