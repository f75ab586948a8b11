//! Command-line simulation of one visit: load a config, run the tests,
//! record events, and report what every backend would have been sent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use colored::*;
use serde::Serialize;
use serde_json::Value;

use crate::backends::{
    Backend, GoogleAnalytics, KissMetrics, LogBackend, Mixpanel, QueueBeacon,
};
use crate::error::Result;
use crate::events::{EventRecord, StaticPageContext};
use crate::experiment::{Presentation, RecordingApplier, TestRunState};
use crate::random::SeededRandom;
use crate::store::{FileStore, MemoryStore};
use crate::{TuneConfig, Tuner, TunerBuilder};

#[derive(Parser, Debug)]
#[command(name = "abtune")]
#[command(version)]
#[command(about = "Simulate one visitor session against an A/B test configuration")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    pub config: PathBuf,

    /// Query string read for URL overrides (e.g. "cta-color=1&layout=wide")
    #[arg(long, default_value = "")]
    pub query: String,

    /// JSON file persisting assignments and identity between runs
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Seed for reproducible sampling and draws
    #[arg(long)]
    pub seed: Option<u64>,

    /// Backend to attach; repeatable
    #[arg(long = "backend", value_enum)]
    pub backends: Vec<BackendKind>,

    /// Event to record after the tests run; repeatable
    #[arg(long = "event")]
    pub events: Vec<String>,

    /// Identify the session with the identifying backends
    #[arg(long)]
    pub identify: bool,

    /// Page URL reported in the event context
    #[arg(long, default_value = "https://localhost/")]
    pub url: String,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ga,
    Mixpanel,
    Kissmetrics,
    Log,
}

impl BackendKind {
    fn build(self, beacon: &QueueBeacon) -> Box<dyn Backend> {
        match self {
            BackendKind::Ga => Box::new(GoogleAnalytics::new(beacon.clone())),
            BackendKind::Mixpanel => Box::new(Mixpanel::new(beacon.clone())),
            BackendKind::Kissmetrics => Box::new(KissMetrics::new(beacon.clone())),
            BackendKind::Log => Box::new(LogBackend::new()),
        }
    }

    pub fn adapter_name(self) -> &'static str {
        match self {
            BackendKind::Ga => GoogleAnalytics::NAME,
            BackendKind::Mixpanel => Mixpanel::NAME,
            BackendKind::Kissmetrics => KissMetrics::NAME,
            BackendKind::Log => LogBackend::NAME,
        }
    }
}

/// Everything one simulated visit produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub tests: Vec<TestRunState>,
    pub identity: Option<String>,
    pub applied: Vec<(String, Presentation)>,
    pub events: Vec<EventRecord>,
    /// Adapter name → commands pushed to its beacon.
    pub beacons: BTreeMap<String, Vec<Value>>,
}

pub fn run(args: &Args) -> Result<Report> {
    let config = TuneConfig::load(&args.config)?;
    simulate(args, config)
}

/// [`run`] with an already loaded configuration.
pub fn simulate(args: &Args, config: TuneConfig) -> Result<Report> {
    let applier = RecordingApplier::new();
    let mut builder = TunerBuilder::new(config)
        .query(args.query.clone())
        .applier(applier.clone())
        .page_context(StaticPageContext::new(args.url.clone()));

    builder = match &args.store {
        Some(path) => builder.store(FileStore::new(path)),
        None => builder.store(MemoryStore::new()),
    };
    if let Some(seed) = args.seed {
        builder = builder.random_source(SeededRandom::new(seed));
    }

    let mut beacons = Vec::new();
    for kind in &args.backends {
        let beacon = QueueBeacon::new();
        builder = builder.boxed_backend(kind.build(&beacon));
        if *kind != BackendKind::Log {
            beacons.push((kind.adapter_name().to_string(), beacon));
        }
    }

    let mut tuner: Tuner = builder.build()?;
    tuner.run_tests();
    let identity = args.identify.then(|| tuner.identify(None));
    for event in &args.events {
        tuner.record_event(event.as_str());
    }

    Ok(Report {
        tests: tuner.test_states().to_vec(),
        identity,
        applied: applier.applied(),
        events: tuner.event_log().records().to_vec(),
        beacons: beacons.into_iter().map(|(name, b)| (name, b.drain())).collect(),
    })
}

/// Human-readable rendering of a report.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Tests".bold()));
    for state in &report.tests {
        let line = match (&state.selected_version, state.running) {
            (Some(v), true) => format!("  {} {} {}", "●".green(), state.name, v.bright_green()),
            _ => format!("  {} {} {}", "○".dimmed(), state.name, "not running".dimmed()),
        };
        out.push_str(&line);
        out.push('\n');
    }

    for (test, change) in &report.applied {
        let detail = match change {
            Presentation::Class { target, class, .. } => {
                format!("class {class} on {}", target.as_deref().unwrap_or("(no target)"))
            }
            Presentation::Attribute { target, attribute, value, .. } => format!(
                "{attribute}={value} on {}",
                target.as_deref().unwrap_or("(no target)")
            ),
        };
        out.push_str(&format!("  {} {} {}\n", "→".blue(), test, detail.dimmed()));
    }

    if let Some(id) = &report.identity {
        out.push_str(&format!("{} {}\n", "Identity".bold(), id.cyan()));
    }

    out.push_str(&format!("{} ({})\n", "Events".bold(), report.events.len()));
    for event in &report.events {
        out.push_str(&format!(
            "  {} {}\n",
            event.name.yellow(),
            format!("[{}]", event.category).dimmed()
        ));
    }

    for (name, commands) in &report.beacons {
        out.push_str(&format!("{} {}\n", "Beacon".bold(), name.magenta()));
        for cmd in commands {
            out.push_str(&format!("  {cmd}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONFIG: &str = r##"
        [[tests]]
        name = "cta-color"
        versions = ["red", "blue"]
        element = "#buy"
    "##;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["abtune", "--config", "tune.toml"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_parse_defaults() {
        let a = args(&[]);
        assert_eq!(a.config, PathBuf::from("tune.toml"));
        assert_eq!(a.query, "");
        assert!(a.backends.is_empty());
        assert!(a.seed.is_none());
        assert!(!a.json);
    }

    #[test]
    fn test_parse_repeatable_flags() {
        let a = args(&["--backend", "ga", "--backend", "mixpanel", "--event", "a", "--event", "b"]);
        assert_eq!(a.backends, vec![BackendKind::Ga, BackendKind::Mixpanel]);
        assert_eq!(a.events, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let r = Args::try_parse_from(["abtune", "--config", "x", "--backend", "segment"]);
        assert!(r.is_err());
    }

    #[test]
    fn test_simulate_override_and_beacons() {
        let a = args(&["--query", "cta-color=1", "--backend", "ga", "--backend", "mixpanel", "--event", "signup"]);
        let report = simulate(&a, TuneConfig::from_toml_str(CONFIG).unwrap()).unwrap();

        assert_eq!(report.tests[0].selected_version.as_deref(), Some("blue"));
        assert_eq!(
            report.beacons["google_analytics"],
            vec![
                json!(["_trackEvent", "Test", "(Test) cta-color / blue", "", null]),
                json!(["_trackEvent", "", "signup", "", null]),
            ]
        );
        assert_eq!(
            report.beacons["mixpanel"],
            vec![json!(["track", "signup", {"(Test) cta-color": "blue"}])]
        );
        assert_eq!(report.applied[0].0, "cta-color");
    }

    #[test]
    fn test_simulate_seed_is_reproducible() {
        let a = args(&["--seed", "11"]);
        let first = simulate(&a, TuneConfig::from_toml_str(CONFIG).unwrap()).unwrap();
        let second = simulate(&a, TuneConfig::from_toml_str(CONFIG).unwrap()).unwrap();
        assert_eq!(first.tests, second.tests);
    }

    #[test]
    fn test_file_store_keeps_persistent_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("state.json");
        let cfg = "[[tests]]\nname = \"p\"\nversions = [\"a\", \"b\", \"c\"]\npersistent = true";
        let store_arg = store.to_string_lossy().to_string();

        let first = simulate(&args(&["--store", &store_arg, "--seed", "1"]), TuneConfig::from_toml_str(cfg).unwrap()).unwrap();
        for seed in ["2", "3", "4"] {
            let again = simulate(&args(&["--store", &store_arg, "--seed", seed]), TuneConfig::from_toml_str(cfg).unwrap()).unwrap();
            assert_eq!(again.tests[0].selected_version, first.tests[0].selected_version);
        }
    }

    #[test]
    fn test_identify_flag() {
        let a = args(&["--identify", "--backend", "kissmetrics"]);
        let report = simulate(&a, TuneConfig::default()).unwrap();
        let id = report.identity.clone().unwrap();
        assert_eq!(report.beacons["kissmetrics"], vec![json!(["identify", id])]);
    }

    #[test]
    fn test_render_text_lists_everything() {
        colored::control::set_override(false);
        let a = args(&["--query", "cta-color=0", "--event", "signup"]);
        let report = simulate(&a, TuneConfig::from_toml_str(CONFIG).unwrap()).unwrap();
        let text = render_text(&report);
        assert!(text.contains("cta-color red"));
        assert!(text.contains("Events (1)"));
        assert!(text.contains("signup []"));
    }

    #[test]
    fn test_missing_config_file_errors() {
        let a = Args::parse_from(["abtune", "--config", "/no/such/tune.toml"]);
        assert!(run(&a).is_err());
    }
}
