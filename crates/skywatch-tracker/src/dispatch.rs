//! Action dispatcher
//!
//! Runs a matched rule's actions in order. Callback failures are counted and
//! logged; they never propagate into ingestion.

use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use serde::Serialize;
use skywatch_core::{Altitude, Flight, Stats};
use skywatch_rules::{Action, Callback, CallbackRegistry, CallbackResult, Rule};
use tracing::{debug, info, warn};

use crate::registry::FlightRegistry;

/// Tracing target for post-processing records
pub const CSV_TARGET: &str = "skywatch::csv";

/// Prefix downstream tooling greps for
pub const CSV_PREFIX: &str = "CSV OUTPUT FOR POSTPROCESSING:";

// ============================================================================
// CSV RECORDS
// ============================================================================

/// One `print_csv` record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvRecord {
    pub now: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: Altitude,
    pub tail: String,
    pub label: String,
    /// Replay link centred on the aircraft at `now`
    pub url: String,
}

impl CsvRecord {
    pub fn new(flight: &Flight, label: &str, replay_url_base: &str) -> Self {
        let loc = &flight.lastloc;
        Self {
            now: loc.now,
            lat: loc.lat,
            lon: loc.lon,
            alt: loc.alt,
            tail: flight.flight_id.clone(),
            label: label.to_string(),
            url: replay_url(replay_url_base, &flight.hex, loc.lat, loc.lon, loc.now),
        }
    }
}

impl fmt::Display for CsvRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{}",
            self.now, self.lat, self.lon, self.alt, self.tail, self.label, self.url
        )
    }
}

pub fn replay_url(base: &str, hex: &str, lat: f64, lon: f64, now: i64) -> String {
    let mut url = format!("{}?icao={}&lat={}&lon={}&zoom=13", base, hex, lat, lon);
    if let Some(date) = DateTime::from_timestamp(now, 0) {
        url.push_str(&format!("&showTrace={}", date.format("%Y-%m-%d")));
    }
    url.push_str(&format!("&timestamp={}", now));
    url
}

/// Destination of `print_csv` records
#[cfg_attr(test, mockall::automock)]
pub trait CsvSink: Send + Sync {
    fn emit(&self, record: &CsvRecord);
}

/// Writes records to the `skywatch::csv` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCsvSink;

impl CsvSink for TracingCsvSink {
    fn emit(&self, record: &CsvRecord) {
        info!(target: CSV_TARGET, "{} {}", CSV_PREFIX, record);
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct ActionDispatcher {
    callbacks: CallbackRegistry,
    csv: Arc<dyn CsvSink>,
    stats: Arc<Stats>,
    replay_url_base: String,
}

impl ActionDispatcher {
    pub fn new(
        callbacks: CallbackRegistry,
        csv: Arc<dyn CsvSink>,
        stats: Arc<Stats>,
        replay_url_base: impl Into<String>,
    ) -> Self {
        Self {
            callbacks,
            csv,
            stats,
            replay_url_base: replay_url_base.into(),
        }
    }

    /// Run a single-flight rule's actions
    ///
    /// `flight` is the caller's snapshot; tags and expire callbacks are
    /// written both to it and to the registry so later actions see them.
    pub fn dispatch(&self, rule: &Rule, flight: &mut Flight, registry: &FlightRegistry) {
        self.stats.record_rule_match();
        debug!(rule = %rule.name, hex = %flight.hex, "Rule matched");

        for action in &rule.actions {
            match action {
                Action::Callback(name) => {
                    self.invoke(rule, name, |cb| cb.invoke_flight(flight));
                }
                Action::PrintCsv(label) => self.print_csv(flight, label),
                Action::Print => {
                    info!(rule = %rule.name, "{}", flight);
                }
                Action::Note(text) => {
                    tag(flight, registry, |f| {
                        f.flags.insert(text.clone());
                    });
                }
                Action::ExpireCallback(name) => {
                    tag(flight, registry, |f| {
                        f.expire_callbacks.insert(name.clone());
                    });
                }
            }
        }
    }

    /// Run a proximity rule's actions for a newly detected pair
    pub fn dispatch_pair(&self, rule: &Rule, a: &Flight, b: &Flight, registry: &FlightRegistry) {
        self.stats.record_rule_match();
        debug!(rule = %rule.name, a = %a.hex, b = %b.hex, "Proximity rule matched");

        for action in &rule.actions {
            match action {
                Action::Callback(name) => {
                    self.invoke(rule, name, |cb| cb.invoke_pair(a, b));
                }
                Action::PrintCsv(label) => {
                    self.print_csv(a, label);
                    self.print_csv(b, label);
                }
                Action::Print => {
                    info!(rule = %rule.name, "{} / {}", a, b);
                }
                Action::Note(text) => {
                    for flight in [a, b] {
                        registry.with_flight_mut(&flight.hex, |f| f.flags.insert(text.clone()));
                    }
                }
                Action::ExpireCallback(name) => {
                    for flight in [a, b] {
                        registry.with_flight_mut(&flight.hex, |f| {
                            f.expire_callbacks.insert(name.clone())
                        });
                    }
                }
            }
        }
    }

    /// Invoke the expire callbacks a flight collected while it was tracked
    pub fn dispatch_expired(&self, flight: &Flight) {
        for name in &flight.expire_callbacks {
            let Some(callback) = self.callbacks.get(name) else {
                warn!(callback = %name, hex = %flight.hex, "Expire callback not registered");
                self.stats.record_callback_error();
                continue;
            };
            self.stats.record_callback();
            if let Err(e) = callback.invoke_flight(flight) {
                self.stats.record_callback_error();
                warn!(callback = %name, hex = %flight.hex, error = %e, "Expire callback failed");
            }
        }
    }

    fn invoke(&self, rule: &Rule, name: &str, call: impl FnOnce(&Callback) -> CallbackResult) {
        let Some(callback) = self.callbacks.get(name) else {
            // compile() resolves every name, so this only trips on a stale registry
            warn!(rule = %rule.name, callback = %name, "Callback not registered");
            self.stats.record_callback_error();
            return;
        };

        self.stats.record_callback();
        if let Err(e) = call(callback) {
            self.stats.record_callback_error();
            warn!(rule = %rule.name, callback = %name, error = %e, "Callback failed");
        }
    }

    fn print_csv(&self, flight: &Flight, label: &str) {
        let record = CsvRecord::new(flight, label, &self.replay_url_base);
        self.csv.emit(&record);
        self.stats.record_csv();
    }
}

fn tag(flight: &mut Flight, registry: &FlightRegistry, apply: impl Fn(&mut Flight)) {
    apply(flight);
    registry.with_flight_mut(&flight.hex, &apply);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::{PositionReport, RegionResolver};
    use skywatch_rules::{CallbackError, RuleDocument, RuleSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        rules: RuleSet,
        registry: FlightRegistry,
        stats: Arc<Stats>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(yaml: &str, csv: Arc<dyn CsvSink>) -> (Fixture, ActionDispatcher) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callbacks = CallbackRegistry::new();
        let counter = calls.clone();
        callbacks
            .register(
                "count",
                Callback::flight(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        callbacks
            .register("fail", Callback::flight(|_| Err(CallbackError::new("nope"))))
            .unwrap();

        let doc = RuleDocument::from_yaml_str(yaml).unwrap();
        let rules = RuleSet::compile(&doc, &callbacks, &RegionResolver::empty()).unwrap();
        let stats = Arc::new(Stats::new());
        let dispatcher =
            ActionDispatcher::new(callbacks, csv, stats.clone(), "https://replay.test/");
        let registry = FlightRegistry::new(Arc::new(RegionResolver::empty()));

        (
            Fixture {
                rules,
                registry,
                stats,
                calls,
            },
            dispatcher,
        )
    }

    #[test]
    fn test_replay_url() {
        let url = replay_url(
            "https://globe.adsbexchange.com/",
            "a1b2c3",
            40.5,
            -105.25,
            1700000000,
        );
        assert_eq!(
            url,
            "https://globe.adsbexchange.com/?icao=a1b2c3&lat=40.5&lon=-105.25&zoom=13\
             &showTrace=2023-11-14&timestamp=1700000000"
        );
    }

    #[test]
    fn test_print_csv_emits_exact_fields() {
        let mut sink = MockCsvSink::new();
        sink.expect_emit()
            .withf(|record| {
                record.now == 1700000000
                    && record.lat == 40.1234
                    && record.lon == -105.5678
                    && record.alt == Altitude::Feet(7500)
                    && record.tail == "N12345"
                    && record.label == "landing"
                    && record.url.contains("icao=abc123")
            })
            .times(1)
            .return_const(());

        let (fx, dispatcher) = fixture(
            "rules:\n  r:\n    conditions: {}\n    actions:\n      print_csv: landing\n",
            Arc::new(sink),
        );
        let report =
            PositionReport::new(1700000000, "abc123", 40.1234, -105.5678, Altitude::Feet(7500))
                .with_flight("N12345");
        let mut flight = fx.registry.update(&report).flight;

        dispatcher.dispatch(&fx.rules.rules()[0], &mut flight, &fx.registry);
        assert_eq!(fx.stats.snapshot().csv_records, 1);
    }

    #[test]
    fn test_csv_line_format() {
        let report = PositionReport::new(10, "abc123", 40.5, -105.0, Altitude::Ground);
        let flight = Flight::new(&report, Default::default());
        let record = CsvRecord::new(&flight, "ground", "https://replay.test/");

        let line = record.to_string();
        assert!(line.starts_with("10,40.5,-105,ground,abc123,ground,"));
        assert!(line.contains("https://replay.test/?icao=abc123"));
    }

    #[test]
    fn test_callbacks_counted_and_failures_isolated() {
        let (fx, dispatcher) = fixture(
            r#"
rules:
  r:
    conditions: {}
    actions:
      - callback: fail
      - callback: count
      - note: seen
      - expire_callback: count
"#,
            Arc::new(TracingCsvSink),
        );
        let report = PositionReport::new(0, "abc123", 40.0, -105.0, Altitude::Feet(3000));
        let mut flight = fx.registry.update(&report).flight;

        dispatcher.dispatch(&fx.rules.rules()[0], &mut flight, &fx.registry);

        let snap = fx.stats.snapshot();
        assert_eq!(snap.callbacks_fired, 2);
        assert_eq!(snap.callback_errors, 1);
        assert_eq!(snap.rules_matched, 1);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert!(flight.has_flag("seen"));

        let stored = fx.registry.get("abc123").unwrap();
        assert!(stored.has_flag("seen"));
        assert!(stored.expire_callbacks.contains("count"));

        dispatcher.dispatch_expired(&stored);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }
}
