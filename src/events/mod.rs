//! Event normalization, dispatch and the session event log.

pub mod context;
pub mod dispatcher;
pub mod error_report;
pub mod record;

pub use context::{PageContext, PageContextProvider, StaticPageContext};
pub use dispatcher::{Delivery, DispatchOutcome, EventDispatcher, EventLog};
pub use error_report::{RuntimeErrorReport, RUNTIME_ERROR_CATEGORY, RUNTIME_ERROR_EVENT};
pub use record::{
    Audience, EventInput, EventOptions, EventRecord, EventSchema, TestSnapshot, TestStatus,
    TEST_KEY_PREFIX,
};
