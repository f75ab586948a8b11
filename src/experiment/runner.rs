//! # Stage: Experiment Runner
//!
//! ## Responsibility
//! Walk the loaded tests once per session, decide which ones run, commit the
//! chosen versions and announce them (signals, synthetic test events, the
//! presentation hook).
//!
//! ## Guarantees
//! - Definitions are validated before the first assignment
//! - A state is committed at most once: `running` flips to `true` together
//!   with `selected_version` and never changes afterwards
//! - `should_run == false` skips a test with no draw and no side effects
//! - `on_selected` fires once per commit, after the state is recorded
//! - With `tests_at_once = n`, the first pass evaluates at most `n` shuffled
//!   tests; a second pass then evaluates every still-idle `always_run` test,
//!   so always-run tests may exceed the cap
//! - A selector failure leaves the test idle and does not stop the run
//!
//! ## NOT Responsible For
//! - Choosing the version itself (that is [`crate::experiment::selector`])
//! - Delivering events (that is [`crate::events::EventDispatcher`])

use serde::{Deserialize, Serialize};

use crate::backends::BackendRegistry;
use crate::error::Result;
use crate::events::{Audience, EventDispatcher, EventInput, TestSnapshot, TestStatus, TEST_KEY_PREFIX};
use crate::experiment::applier::{NoopApplier, Presentation, VariantApplier};
use crate::experiment::definition::{validate_all, TestDefinition};
use crate::experiment::selector::select;
use crate::random::{shuffle, RandomSource};
use crate::session::SessionContext;
use crate::signals::{Signal, SignalBus};

/// Category of the synthetic per-test events.
pub const TEST_EVENT_CATEGORY: &str = "Test";
pub const DEFAULT_APPLIED_MARKER: &str = "tuned";

/// Run state of one test within the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunState {
    pub name: String,
    pub running: bool,
    pub selected_version: Option<String>,
}

impl TestRunState {
    fn idle(name: &str) -> Self {
        Self { name: name.to_string(), running: false, selected_version: None }
    }

    pub fn status(&self) -> TestStatus {
        match (&self.selected_version, self.running) {
            (Some(v), true) => TestStatus::Running(v.clone()),
            _ => TestStatus::NotRunning,
        }
    }
}

/// Collaborators borrowed for one run.
pub struct RunContext<'a> {
    pub session: &'a mut SessionContext,
    pub rng: &'a mut dyn RandomSource,
    pub dispatcher: &'a mut EventDispatcher,
    pub registry: &'a mut BackendRegistry,
    pub signals: &'a SignalBus,
    pub active: bool,
}

pub struct ExperimentRunner {
    tests: Vec<TestDefinition>,
    /// Parallel to `tests`.
    states: Vec<TestRunState>,
    tests_at_once: Option<usize>,
    applied_marker: String,
    applier: Box<dyn VariantApplier>,
}

impl std::fmt::Debug for ExperimentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRunner")
            .field("tests", &self.tests)
            .field("states", &self.states)
            .field("tests_at_once", &self.tests_at_once)
            .field("applied_marker", &self.applied_marker)
            .finish()
    }
}

impl ExperimentRunner {
    pub fn new(tests: Vec<TestDefinition>) -> Result<Self> {
        validate_all(&tests)?;
        let states = tests.iter().map(|t| TestRunState::idle(&t.name)).collect();
        Ok(Self {
            tests,
            states,
            tests_at_once: None,
            applied_marker: DEFAULT_APPLIED_MARKER.to_string(),
            applier: Box::new(NoopApplier),
        })
    }

    pub fn with_tests_at_once(mut self, cap: Option<usize>) -> Self {
        self.tests_at_once = cap;
        self
    }

    pub fn with_applied_marker(mut self, marker: impl Into<String>) -> Self {
        self.applied_marker = marker.into();
        self
    }

    pub fn with_applier(mut self, applier: Box<dyn VariantApplier>) -> Self {
        self.applier = applier;
        self
    }

    pub fn tests(&self) -> &[TestDefinition] {
        &self.tests
    }

    pub fn states(&self) -> &[TestRunState] {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&TestRunState> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn running(&self) -> Vec<TestRunState> {
        self.states.iter().filter(|s| s.running).cloned().collect()
    }

    /// Status of every loaded test, as embedded in events.
    pub fn snapshot(&self) -> TestSnapshot {
        self.states.iter().map(|s| (s.name.clone(), s.status())).collect()
    }

    /// Evaluate the tests for this session. Returns the states committed by
    /// this call; tests already running are left untouched.
    pub fn run(&mut self, ctx: &mut RunContext<'_>) -> Vec<TestRunState> {
        let mut candidates: Vec<usize> = (0..self.tests.len()).collect();
        if let Some(cap) = self.tests_at_once {
            shuffle(&mut candidates, ctx.rng);
            candidates.truncate(cap);
        }

        let mut committed = Vec::new();
        for idx in candidates {
            committed.extend(self.evaluate(idx, ctx));
        }

        for idx in 0..self.tests.len() {
            if self.tests[idx].always_run && !self.states[idx].running {
                committed.extend(self.evaluate(idx, ctx));
            }
        }

        tracing::debug!(
            committed = committed.len(),
            running = self.states.iter().filter(|s| s.running).count(),
            "test run finished"
        );
        committed
    }

    fn evaluate(&mut self, idx: usize, ctx: &mut RunContext<'_>) -> Option<TestRunState> {
        if self.states[idx].running {
            return None;
        }
        let test = &self.tests[idx];

        if let Some(should_run) = &test.should_run {
            if !should_run(test) {
                tracing::debug!(test = %test.name, "not eligible this session");
                return None;
            }
        }

        let sample = ctx.rng.next_f64();
        if sample >= test.sample_size {
            tracing::debug!(test = %test.name, sample, sample_size = test.sample_size, "not sampled");
            return None;
        }

        let selection = match select(test, ctx.session, ctx.rng) {
            Ok(selection) => selection,
            Err(e) => {
                tracing::warn!(test = %test.name, error = %e, "assignment failed");
                ctx.signals.emit(Signal::AssignmentFailed {
                    test: test.name.clone(),
                    error: e.to_string(),
                });
                return None;
            }
        };

        let state = TestRunState {
            name: test.name.clone(),
            running: true,
            selected_version: Some(selection.version.clone()),
        };
        self.states[idx] = state.clone();
        if let Some(on_selected) = &test.on_selected {
            on_selected(test, &selection.version);
        }
        tracing::info!(test = %test.name, version = %selection.version, source = %selection.source, "test committed");
        ctx.signals.emit(Signal::TestCommitted {
            test: test.name.clone(),
            version: selection.version.clone(),
            source: selection.source,
        });

        if ctx.active && ctx.registry.any_sends_tests_as_events() {
            let input = EventInput::named(format!("{TEST_KEY_PREFIX}{} / {}", test.name, selection.version))
                .category(TEST_EVENT_CATEGORY)
                .description(test.description.clone())
                .audience(Audience::TestsAsEvents);
            let snapshot = self.snapshot();
            ctx.dispatcher
                .dispatch(input, &snapshot, ctx.registry, ctx.signals, ctx.active);
        }

        let presentation = Presentation::for_test(test, &selection.version, &self.applied_marker);
        if let Err(e) = self.applier.apply(test, &presentation) {
            tracing::warn!(test = %test.name, error = %e, "could not apply version");
        }

        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Capabilities, MemoryBackend};
    use crate::error::TuneError;
    use crate::events::{EventSchema, StaticPageContext};
    use crate::experiment::applier::RecordingApplier;
    use crate::experiment::definition::VersionStorePolicy;
    use crate::random::ScriptedRandom;
    use crate::signals::drain;
    use crate::store::MemoryStore;

    struct Harness {
        session: SessionContext,
        rng: ScriptedRandom,
        dispatcher: EventDispatcher,
        registry: BackendRegistry,
        signals: SignalBus,
        active: bool,
    }

    impl Harness {
        fn new(script: Vec<f64>) -> Self {
            Self {
                session: SessionContext::new(Box::new(MemoryStore::new())),
                rng: ScriptedRandom::new(script),
                dispatcher: EventDispatcher::new(
                    EventSchema::default(),
                    Box::new(StaticPageContext::new("https://a.test").at(1)),
                ),
                registry: BackendRegistry::new(),
                signals: SignalBus::default(),
                active: true,
            }
        }

        fn run(&mut self, runner: &mut ExperimentRunner) -> Vec<TestRunState> {
            let mut ctx = RunContext {
                session: &mut self.session,
                rng: &mut self.rng,
                dispatcher: &mut self.dispatcher,
                registry: &mut self.registry,
                signals: &self.signals,
                active: self.active,
            };
            runner.run(&mut ctx)
        }
    }

    #[test]
    fn test_invalid_definitions_fail_before_assignment() {
        let err = ExperimentRunner::new(vec![
            TestDefinition::new("a", ["x"]),
            TestDefinition::new("a", ["y"]),
        ])
        .unwrap_err();
        assert!(matches!(err, TuneError::Configuration(_)));
    }

    #[test]
    fn test_full_sample_commits_member_version() {
        let mut runner = ExperimentRunner::new(vec![TestDefinition::new("cta-color", ["red", "blue"])]).unwrap();
        let mut h = Harness::new(vec![0.0]);
        let committed = h.run(&mut runner);
        assert_eq!(committed.len(), 1);
        let state = runner.state("cta-color").unwrap();
        assert!(state.running);
        assert_eq!(state.selected_version.as_deref(), Some("red"));
    }

    #[test]
    fn test_zero_sample_never_runs() {
        let mut runner = ExperimentRunner::new(vec![
            TestDefinition::new("t", ["a"]).with_sample_size(0.0),
        ])
        .unwrap();
        let mut h = Harness::new(vec![0.0]);
        assert!(h.run(&mut runner).is_empty());
        assert!(runner.running().is_empty());
        assert_eq!(runner.snapshot()["t"], TestStatus::NotRunning);
    }

    #[test]
    fn test_sampling_is_strict_less_than() {
        let mut runner = ExperimentRunner::new(vec![
            TestDefinition::new("t", ["a"]).with_sample_size(0.5),
        ])
        .unwrap();
        let mut h = Harness::new(vec![0.5]);
        assert!(h.run(&mut runner).is_empty());
    }

    #[test]
    fn test_should_run_false_skips_without_draw() {
        let mut runner = ExperimentRunner::new(vec![
            TestDefinition::new("t", ["a"]).with_should_run(|_| false),
        ])
        .unwrap();
        let mut h = Harness::new(vec![0.0]);
        h.run(&mut runner);
        assert_eq!(h.rng.draws(), 0);
        assert!(runner.running().is_empty());
    }

    #[test]
    fn test_committed_state_never_changes() {
        let mut runner = ExperimentRunner::new(vec![TestDefinition::new("t", ["a", "b"])]).unwrap();
        let mut h = Harness::new(vec![0.0, 0.0, 0.9, 0.9]);
        h.run(&mut runner);
        let again = h.run(&mut runner);
        assert!(again.is_empty());
        assert_eq!(runner.state("t").unwrap().selected_version.as_deref(), Some("a"));
    }

    #[test]
    fn test_on_selected_called_once_with_committed_version() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut runner = ExperimentRunner::new(vec![
            TestDefinition::new("cta", ["red", "blue"])
                .with_on_selected(move |t, v| sink.lock().unwrap().push((t.name.clone(), v.to_string()))),
            TestDefinition::new("off", ["x"])
                .with_sample_size(0.0)
                .with_on_selected(|_, _| panic!("not committed, must not fire")),
        ])
        .unwrap();
        let mut h = Harness::new(vec![0.0, 0.9]);
        h.run(&mut runner);
        h.run(&mut runner);
        assert_eq!(*seen.lock().unwrap(), vec![("cta".to_string(), "blue".to_string())]);
    }

    #[test]
    fn test_tests_at_once_caps_first_pass() {
        let tests = (0..5).map(|i| TestDefinition::new(format!("t{i}"), ["a"])).collect();
        let mut runner = ExperimentRunner::new(tests).unwrap().with_tests_at_once(Some(2));
        let mut h = Harness::new(vec![0.0]);
        h.run(&mut runner);
        assert_eq!(runner.running().len(), 2);
    }

    #[test]
    fn test_cap_larger_than_tests_runs_all() {
        let tests = (0..3).map(|i| TestDefinition::new(format!("t{i}"), ["a"])).collect();
        let mut runner = ExperimentRunner::new(tests).unwrap().with_tests_at_once(Some(10));
        let mut h = Harness::new(vec![0.0]);
        h.run(&mut runner);
        assert_eq!(runner.running().len(), 3);
    }

    #[test]
    fn test_always_run_exceeds_cap() {
        let tests = vec![
            TestDefinition::new("t0", ["a"]),
            TestDefinition::new("t1", ["a"]),
            TestDefinition::new("t2", ["a"]).always_run(),
        ];
        let mut runner = ExperimentRunner::new(tests).unwrap().with_tests_at_once(Some(0));
        let mut h = Harness::new(vec![0.0]);
        h.run(&mut runner);
        let names: Vec<_> = runner.running().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["t2"]);
    }

    #[test]
    fn test_assignment_failure_leaves_idle_and_continues() {
        let tests = vec![TestDefinition::new("bad", ["a"]), TestDefinition::new("good", ["a"])];
        let mut runner = ExperimentRunner::new(tests).unwrap();
        let mut h = Harness::new(vec![0.0]);
        h.session = SessionContext::new(Box::new(MemoryStore::new())).with_query("bad=7");
        let mut rx = h.signals.subscribe();
        h.run(&mut runner);
        assert!(!runner.state("bad").unwrap().running);
        assert!(runner.state("good").unwrap().running);
        assert!(drain(&mut rx)
            .iter()
            .any(|s| matches!(s, Signal::AssignmentFailed { test, .. } if test == "bad")));
    }

    #[test]
    fn test_tests_as_events_emitted_when_backend_wants_them() {
        let ga = MemoryBackend::new("ga").with_capabilities(Capabilities::NONE.tests_as_events());
        let other = MemoryBackend::new("other");
        let mut runner = ExperimentRunner::new(vec![
            TestDefinition::new("cta-color", ["red", "blue"]).with_description("button colour"),
        ])
        .unwrap();
        let mut h = Harness::new(vec![0.0]);
        h.registry.register(Box::new(ga.clone()));
        h.registry.register(Box::new(other.clone()));
        h.run(&mut runner);

        let sent = ga.events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "(Test) cta-color / red");
        assert_eq!(sent[0].category, "Test");
        assert_eq!(sent[0].description, "button colour");
        assert!(other.events().is_empty());
        assert!(h.dispatcher.log().contains("(Test) cta-color / red"));
    }

    #[test]
    fn test_no_test_events_when_inactive() {
        let ga = MemoryBackend::new("ga").with_capabilities(Capabilities::NONE.tests_as_events());
        let mut runner = ExperimentRunner::new(vec![TestDefinition::new("t", ["a"])]).unwrap();
        let mut h = Harness::new(vec![0.0]);
        h.active = false;
        h.registry.register(Box::new(ga.clone()));
        h.run(&mut runner);
        assert!(runner.state("t").unwrap().running, "commit still happens");
        assert!(ga.events().is_empty());
        assert!(h.dispatcher.log().is_empty());
    }

    #[test]
    fn test_applier_receives_presentation() {
        let applier = RecordingApplier::new();
        let mut runner = ExperimentRunner::new(vec![TestDefinition::new("t", ["a"]).with_target(".hero")])
            .unwrap()
            .with_applied_marker("ab-on")
            .with_applier(Box::new(applier.clone()));
        let mut h = Harness::new(vec![0.0]);
        h.run(&mut runner);
        assert_eq!(
            applier.applied(),
            vec![(
                "t".to_string(),
                Presentation::Class { target: Some(".hero".into()), class: "a".into(), marker: "ab-on".into() }
            )]
        );
    }

    #[test]
    fn test_failing_applier_keeps_commit() {
        struct Broken;
        impl VariantApplier for Broken {
            fn apply(&mut self, _t: &TestDefinition, _p: &Presentation) -> Result<()> {
                Err(TuneError::configuration("no target on page"))
            }
        }
        let mut runner = ExperimentRunner::new(vec![TestDefinition::new("t", ["a"])])
            .unwrap()
            .with_applier(Box::new(Broken));
        let mut h = Harness::new(vec![0.0]);
        h.run(&mut runner);
        assert!(runner.state("t").unwrap().running);
    }

    #[test]
    fn test_persistent_selection_reproduced_across_runners() {
        let store = MemoryStore::new();
        let def = || TestDefinition::new("p", ["a", "b"]).persistent(VersionStorePolicy::ByIndex);

        let mut first = ExperimentRunner::new(vec![def()]).unwrap();
        let mut h = Harness::new(vec![0.0, 0.75]);
        h.session = SessionContext::new(Box::new(store.clone()));
        h.run(&mut first);

        let mut second = ExperimentRunner::new(vec![def()]).unwrap();
        let mut h2 = Harness::new(vec![0.0, 0.0]);
        h2.session = SessionContext::new(Box::new(store));
        h2.run(&mut second);

        assert_eq!(first.state("p").unwrap().selected_version.as_deref(), Some("b"));
        assert_eq!(second.state("p").unwrap().selected_version.as_deref(), Some("b"));
    }

    #[test]
    fn test_commit_signal_carries_source() {
        let mut runner = ExperimentRunner::new(vec![TestDefinition::new("t", ["a", "b"])]).unwrap();
        let mut h = Harness::new(vec![0.0]);
        h.session = SessionContext::default().with_query("t=1");
        let mut rx = h.signals.subscribe();
        h.run(&mut runner);
        let signals = drain(&mut rx);
        assert!(signals.iter().any(|s| matches!(
            s,
            Signal::TestCommitted { version, source: crate::experiment::SelectionSource::UrlOverride, .. }
                if version == "b"
        )));
    }
}
