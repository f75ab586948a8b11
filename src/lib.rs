//! Client-session A/B test assignment and multi-backend event dispatch.
//!
//! A [`Tuner`] owns one session: it decides which version of each configured
//! test the visitor sees, remembers persistent assignments, and fans every
//! recorded event out to the analytics backends that are present.
//!
//! ```no_run
//! use abtune::{TuneConfig, Tuner};
//! use abtune::backends::{Mixpanel, QueueBeacon};
//!
//! # fn main() -> abtune::Result<()> {
//! let config = TuneConfig::load("tune.toml")?;
//! let mpq = QueueBeacon::new();
//! let mut tuner = Tuner::builder(config)
//!     .query("cta-color=1")
//!     .backend(Mixpanel::new(mpq.clone()))
//!     .build()?;
//! tuner.run_tests();
//! tuner.record_event("signup");
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod experiment;
pub mod random;
pub mod session;
pub mod signals;
pub mod store;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use backends::{Backend, BackendRegistry};
use events::{
    DispatchOutcome, EventDispatcher, EventInput, EventLog, PageContextProvider,
    RuntimeErrorReport, StaticPageContext, TestSnapshot,
};
use experiment::{
    Eligibility, ExperimentRunner, NoopApplier, OnSelected, Picker, RunContext, TestDefinition, TestRunState,
    VariantApplier,
};
use random::{IdGenerator, RandomSource, ThreadRandom, UuidGenerator};
use session::SessionContext;
use signals::{Signal, SignalBus, SIGNAL_CHANNEL_CAP};
use store::{days, MemoryStore, PersistenceAdapter};

pub use config::TuneConfig;
pub use error::{Result, TuneError};

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tuner
// ---------------------------------------------------------------------------

/// One session's engine: tests, session state, backends and the event log.
pub struct Tuner {
    active: bool,
    report_errors: bool,
    session: SessionContext,
    rng: Box<dyn RandomSource>,
    ids: Box<dyn IdGenerator>,
    runner: ExperimentRunner,
    dispatcher: EventDispatcher,
    registry: BackendRegistry,
    signals: SignalBus,
}

impl std::fmt::Debug for Tuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tuner")
            .field("active", &self.active)
            .field("report_errors", &self.report_errors)
            .field("session", &self.session)
            .field("runner", &self.runner)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Tuner {
    pub fn builder(config: TuneConfig) -> TunerBuilder {
        TunerBuilder::new(config)
    }

    /// Evaluate the tests for this session. Tests that are already running
    /// keep their version, so calling this again only gives idle tests
    /// another chance. Returns the states committed by this call.
    pub fn run_tests(&mut self) -> Vec<TestRunState> {
        let mut ctx = RunContext {
            session: &mut self.session,
            rng: self.rng.as_mut(),
            dispatcher: &mut self.dispatcher,
            registry: &mut self.registry,
            signals: &self.signals,
            active: self.active,
        };
        self.runner.run(&mut ctx)
    }

    /// Normalize and dispatch one event. Accepts a bare name or an
    /// [`EventInput`].
    pub fn record_event(&mut self, input: impl Into<EventInput>) -> DispatchOutcome {
        let snapshot = self.runner.snapshot();
        self.dispatcher.dispatch(
            input,
            &snapshot,
            &mut self.registry,
            &self.signals,
            self.active,
        )
    }

    /// Host error trap. `None` when error reporting is disabled.
    pub fn report_error(&mut self, report: RuntimeErrorReport) -> Option<DispatchOutcome> {
        if !self.report_errors {
            return None;
        }
        tracing::debug!(message = %report.message, source = %report.source_location(), "runtime error trapped");
        self.signals.emit(Signal::ErrorTrapped(report.clone()));
        Some(self.record_event(report.to_event()))
    }

    /// Link this session to an identity and tell every identifying backend.
    ///
    /// Uses `id` when given (and persists it), otherwise the persisted
    /// identity, otherwise a freshly generated one. Backend failures are
    /// logged and signalled; the resolved id is always returned.
    pub fn identify(&mut self, id: Option<&str>) -> String {
        let id = match id {
            Some(id) => {
                if let Err(e) = self.session.set_identity(id) {
                    tracing::warn!(error = %e, "could not persist session identity");
                }
                id.to_string()
            }
            None => self.session.identity(self.ids.as_mut()),
        };

        for failure in self.registry.identify_all(&id) {
            let backend = match &failure {
                TuneError::BackendDelivery { backend, .. } => backend.clone(),
                _ => String::new(),
            };
            self.signals.emit(Signal::BackendFailed {
                backend,
                event: None,
                error: failure.to_string(),
            });
        }
        tracing::debug!(id = %id, "session identified");
        self.signals.emit(Signal::Identified { id: id.clone() });
        id
    }

    pub fn running_tests(&self) -> Vec<TestRunState> {
        self.runner.running()
    }

    pub fn test_state(&self, name: &str) -> Option<&TestRunState> {
        self.runner.state(name)
    }

    pub fn test_states(&self) -> &[TestRunState] {
        self.runner.states()
    }

    pub fn tests(&self) -> &[TestDefinition] {
        self.runner.tests()
    }

    pub fn snapshot(&self) -> TestSnapshot {
        self.runner.snapshot()
    }

    pub fn set_active(&mut self, active: bool) {
        tracing::debug!(active, "engine switched");
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn event_log(&self) -> &EventLog {
        self.dispatcher.log()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }
}

// ---------------------------------------------------------------------------
// TunerBuilder
// ---------------------------------------------------------------------------

/// Wires configuration and host collaborators into a [`Tuner`].
pub struct TunerBuilder {
    config: TuneConfig,
    extra_tests: Vec<TestDefinition>,
    pickers: HashMap<String, Picker>,
    eligibility: HashMap<String, Eligibility>,
    hooks: HashMap<String, OnSelected>,
    query: Option<String>,
    rng: Option<Box<dyn RandomSource>>,
    ids: Option<Box<dyn IdGenerator>>,
    store: Option<Box<dyn PersistenceAdapter>>,
    page: Option<Box<dyn PageContextProvider>>,
    applier: Option<Box<dyn VariantApplier>>,
    backends: Vec<Box<dyn Backend>>,
    signal_capacity: usize,
}

impl TunerBuilder {
    pub fn new(config: TuneConfig) -> Self {
        Self {
            config,
            extra_tests: Vec::new(),
            pickers: HashMap::new(),
            eligibility: HashMap::new(),
            hooks: HashMap::new(),
            query: None,
            rng: None,
            ids: None,
            store: None,
            page: None,
            applier: None,
            backends: Vec::new(),
            signal_capacity: SIGNAL_CHANNEL_CAP,
        }
    }

    /// Add a test defined in code, after the configured ones.
    pub fn test(mut self, test: TestDefinition) -> Self {
        self.extra_tests.push(test);
        self
    }

    /// Custom version picker for the named test.
    pub fn picker<F>(mut self, test: impl Into<String>, picker: F) -> Self
    where
        F: Fn(&TestDefinition) -> Option<String> + Send + Sync + 'static,
    {
        self.pickers.insert(test.into(), std::sync::Arc::new(picker));
        self
    }

    /// Eligibility predicate for the named test.
    pub fn should_run<F>(mut self, test: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&TestDefinition) -> bool + Send + Sync + 'static,
    {
        self.eligibility.insert(test.into(), std::sync::Arc::new(predicate));
        self
    }

    /// Hook called with the version once the named test starts running.
    pub fn on_selected<F>(mut self, test: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&TestDefinition, &str) + Send + Sync + 'static,
    {
        self.hooks.insert(test.into(), std::sync::Arc::new(hook));
        self
    }

    /// Query string the URL overrides are read from.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn random_source(mut self, rng: impl RandomSource + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Box::new(ids));
        self
    }

    pub fn store(mut self, store: impl PersistenceAdapter + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn page_context(mut self, page: impl PageContextProvider + 'static) -> Self {
        self.page = Some(Box::new(page));
        self
    }

    pub fn applier(mut self, applier: impl VariantApplier + 'static) -> Self {
        self.applier = Some(Box::new(applier));
        self
    }

    /// Offer a backend candidate. Whether it is kept depends on its
    /// availability, or on the configured `backends` list when present.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    pub fn boxed_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn signal_capacity(mut self, capacity: usize) -> Self {
        self.signal_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Tuner> {
        let config = self.config;
        config.validate()?;

        let mut tests = config.resolve_tests();
        tests.extend(self.extra_tests);

        let mut pickers = self.pickers;
        let mut eligibility = self.eligibility;
        let mut hooks = self.hooks;
        for test in tests.iter_mut() {
            if let Some(picker) = pickers.remove(&test.name) {
                test.picker = Some(picker);
            }
            if let Some(predicate) = eligibility.remove(&test.name) {
                test.should_run = Some(predicate);
            }
            if let Some(hook) = hooks.remove(&test.name) {
                test.on_selected = Some(hook);
            }
        }
        if let Some(name) = pickers
            .keys()
            .chain(eligibility.keys())
            .chain(hooks.keys())
            .next()
        {
            return Err(TuneError::configuration(format!(
                "callback registered for unknown test '{name}'"
            )));
        }

        let runner = ExperimentRunner::new(tests)?
            .with_tests_at_once(config.tests_at_once)
            .with_applied_marker(config.test_applied_class.clone())
            .with_applier(self.applier.unwrap_or_else(|| Box::new(NoopApplier)));

        let store = self.store.unwrap_or_else(|| Box::new(MemoryStore::new()));
        let mut session = SessionContext::new(store)
            .with_variants_key(
                config.persistence_key_name.clone(),
                days(config.persistence_duration_days),
            )
            .with_identity_key(
                config.identity_key_name.clone(),
                days(config.identity_duration_days),
            );
        if config.use_url_overrides {
            if let Some(query) = &self.query {
                session = session.with_query(query);
            }
        }

        let registry = match &config.backends {
            Some(names) => BackendRegistry::explicit(self.backends, names),
            None => BackendRegistry::detect(self.backends),
        };

        let dispatcher = EventDispatcher::new(
            config.event_schema.clone(),
            self.page
                .unwrap_or_else(|| Box::new(StaticPageContext::default())),
        );

        tracing::debug!(
            tests = runner.tests().len(),
            backends = ?registry.names(),
            active = config.active,
            "tuner built"
        );

        Ok(Tuner {
            active: config.active,
            report_errors: config.report_errors,
            session,
            rng: self.rng.unwrap_or_else(|| Box::new(ThreadRandom)),
            ids: self.ids.unwrap_or_else(|| Box::new(UuidGenerator)),
            runner,
            dispatcher,
            registry,
            signals: SignalBus::new(self.signal_capacity),
        })
    }
}
