//! # Stage: Backend Registry
//!
//! ## Responsibility
//! Hold the analytics adapters active for this session. Adapters are checked
//! once with [`Backend::is_available`] when the registry is built, unless an
//! explicit list of names is configured, which bypasses detection.
//!
//! ## Guarantees
//! - Capability flags are read from [`Capabilities`], never inferred
//! - Every adapter call made through [`call_isolated`] is contained: an `Err`
//!   or a panic becomes a [`TuneError::BackendDelivery`] for that adapter only
//!
//! ## NOT Responsible For
//! - Event normalization or duplicate suppression (that is the dispatcher)
//! - Network transport (adapters hand payloads to a [`beacon::Beacon`])

pub mod beacon;
pub mod google_analytics;
pub mod kissmetrics;
pub mod log;
pub mod memory;
pub mod mixpanel;

use std::panic::{self, AssertUnwindSafe};

use crate::error::{Result, TuneError};
use crate::events::EventRecord;

pub use beacon::{Beacon, QueueBeacon};
pub use google_analytics::GoogleAnalytics;
pub use kissmetrics::KissMetrics;
pub use log::LogBackend;
pub use memory::MemoryBackend;
pub use mixpanel::Mixpanel;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// What an adapter wants from the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Receive each test selection as its own "(Test) name / version" event.
    pub sends_tests_as_events: bool,
    /// Receive every event with all test statuses embedded.
    pub sends_tests_with_events: bool,
    /// Implements [`Backend::identify`].
    pub identifies: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        sends_tests_as_events: false,
        sends_tests_with_events: false,
        identifies: false,
    };

    pub fn tests_as_events(mut self) -> Self {
        self.sends_tests_as_events = true;
        self
    }

    pub fn tests_with_events(mut self) -> Self {
        self.sends_tests_with_events = true;
        self
    }

    pub fn identifies(mut self) -> Self {
        self.identifies = true;
        self
    }
}

/// An analytics sink.
pub trait Backend: Send {
    /// Stable name used in logs and in the configured `backends` list.
    fn name(&self) -> &str;

    /// Whether the underlying service is present in this session.
    fn is_available(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn handle_event(&mut self, event: &EventRecord) -> Result<()>;

    /// Link subsequent events to `id`. Only called when
    /// [`Capabilities::identifies`] is set.
    fn identify(&mut self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Run one adapter call, converting errors and panics into
/// [`TuneError::BackendDelivery`] attributed to `backend`.
pub fn call_isolated<F>(backend: &str, call: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ TuneError::BackendDelivery { .. })) => Err(e),
        Ok(Err(other)) => Err(TuneError::delivery(backend, other.to_string())),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "adapter panicked".to_string());
            Err(TuneError::delivery(backend, format!("panicked: {detail}")))
        }
    }
}

// ---------------------------------------------------------------------------
// BackendRegistry
// ---------------------------------------------------------------------------

/// The active adapters for one session.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry").field("backends", &self.names()).finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the candidates whose service is available.
    pub fn detect(candidates: Vec<Box<dyn Backend>>) -> Self {
        let backends = candidates
            .into_iter()
            .filter(|b| {
                let available = b.is_available();
                if !available {
                    tracing::debug!(backend = b.name(), "backend unavailable, skipped");
                }
                available
            })
            .collect();
        Self { backends }
    }

    /// Keep exactly the candidates named in `names`, in `names` order,
    /// without checking availability.
    pub fn explicit(mut candidates: Vec<Box<dyn Backend>>, names: &[String]) -> Self {
        let mut backends = Vec::with_capacity(names.len());
        for name in names {
            match candidates.iter().position(|b| b.name() == name) {
                Some(pos) => backends.push(candidates.remove(pos)),
                None => tracing::warn!(backend = %name, "configured backend has no adapter"),
            }
        }
        Self { backends }
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn any_sends_tests_as_events(&self) -> bool {
        self.backends.iter().any(|b| b.capabilities().sends_tests_as_events)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Backend>> {
        self.backends.iter_mut()
    }

    /// Forward `id` to every identifying adapter. Returns the per-adapter
    /// failures; the remaining adapters are still called.
    pub fn identify_all(&mut self, id: &str) -> Vec<TuneError> {
        let mut failures = Vec::new();
        for backend in self.backends.iter_mut() {
            if !backend.capabilities().identifies {
                continue;
            }
            let name = backend.name().to_string();
            if let Err(e) = call_isolated(&name, || backend.identify(id)) {
                tracing::warn!(backend = %name, error = %e, "identify failed");
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubBackend {
        name: &'static str,
        available: bool,
        caps: Capabilities,
        fail_identify: bool,
    }

    impl StubBackend {
        fn boxed(name: &'static str, available: bool) -> Box<dyn Backend> {
            Box::new(StubBackend { name, available, caps: Capabilities::NONE, fail_identify: false })
        }
    }

    impl Backend for StubBackend {
        fn name(&self) -> &str { self.name }
        fn is_available(&self) -> bool { self.available }
        fn capabilities(&self) -> Capabilities { self.caps }
        fn handle_event(&mut self, _event: &EventRecord) -> Result<()> { Ok(()) }
        fn identify(&mut self, _id: &str) -> Result<()> {
            if self.fail_identify {
                panic!("identify exploded");
            }
            Ok(())
        }
    }

    #[test]
    fn test_detect_keeps_available_only() {
        let reg = BackendRegistry::detect(vec![StubBackend::boxed("a", true), StubBackend::boxed("b", false)]);
        assert_eq!(reg.names(), vec!["a"]);
    }

    #[test]
    fn test_explicit_bypasses_detection_and_orders_by_names() {
        let reg = BackendRegistry::explicit(
            vec![StubBackend::boxed("a", true), StubBackend::boxed("b", false)],
            &["b".to_string(), "a".to_string(), "missing".to_string()],
        );
        assert_eq!(reg.names(), vec!["b", "a"]);
    }

    #[test]
    fn test_any_sends_tests_as_events() {
        let mut reg = BackendRegistry::new();
        reg.register(StubBackend::boxed("plain", true));
        assert!(!reg.any_sends_tests_as_events());
        reg.register(Box::new(StubBackend {
            name: "ga",
            available: true,
            caps: Capabilities::NONE.tests_as_events(),
            fail_identify: false,
        }));
        assert!(reg.any_sends_tests_as_events());
    }

    #[test]
    fn test_call_isolated_maps_error() {
        let err = call_isolated("x", || Err(TuneError::Persistence("disk".into()))).unwrap_err();
        assert!(matches!(err, TuneError::BackendDelivery { ref backend, .. } if backend == "x"));
    }

    #[test]
    fn test_call_isolated_catches_panic() {
        let err = call_isolated("x", || panic!("kaboom")).unwrap_err();
        assert!(err.to_string().contains("panicked: kaboom"));
    }

    #[test]
    fn test_identify_all_isolates_failures() {
        let mut reg = BackendRegistry::new();
        reg.register(Box::new(StubBackend {
            name: "bad",
            available: true,
            caps: Capabilities::NONE.identifies(),
            fail_identify: true,
        }));
        reg.register(Box::new(StubBackend {
            name: "good",
            available: true,
            caps: Capabilities::NONE.identifies(),
            fail_identify: false,
        }));
        reg.register(StubBackend::boxed("silent", true));
        let failures = reg.identify_all("user-1");
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("'bad'"));
    }

    #[test]
    fn test_capability_builders() {
        let c = Capabilities::default().tests_with_events().identifies();
        assert!(c.sends_tests_with_events);
        assert!(c.identifies);
        assert!(!c.sends_tests_as_events);
    }
}
