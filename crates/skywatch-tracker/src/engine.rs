//! Stream engine
//!
//! The public entry point. Each report goes through the registry, every rule,
//! the dispatcher and, for proximity rules, the live pair scan. Ingestion is
//! a single ordered path; background work (the sweeper and the optional pair
//! worker) is started with [`StreamEngine::start`] and stopped with
//! [`StreamEngine::shutdown`].

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use skywatch_core::{
    Flight, PositionReport, ProximityEvent, ProximityMode, RegionResolver, Stats, Transition,
};
use skywatch_rules::{
    Callback, CallbackRegistry, EvalContext, ProximityThresholds, Rule, RuleDocument, RuleSet,
    Settings,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{ActionDispatcher, CsvSink, TracingCsvSink};
use crate::error::{TrackerError, TrackerResult};
use crate::proximity::{self, Observation, ProximityTracker};
use crate::registry::{FlightRegistry, FlightUpdate};
use crate::resample::Resampler;
use crate::sweeper::Sweeper;

const NO_TIME: i64 = i64::MIN;

// ============================================================================
// BUILDER
// ============================================================================

/// Collects callbacks and collaborators, then validates a rule document
pub struct EngineBuilder {
    callbacks: CallbackRegistry,
    csv: Arc<dyn CsvSink>,
    stats: Arc<Stats>,
    resolver: Option<Arc<RegionResolver>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            callbacks: CallbackRegistry::new(),
            csv: Arc::new(TracingCsvSink),
            stats: Arc::new(Stats::new()),
            resolver: None,
        }
    }

    /// Bind a callback name; binding a name twice is an error
    pub fn register_callback(
        mut self,
        name: impl Into<String>,
        callback: Callback,
    ) -> TrackerResult<Self> {
        self.callbacks.register(name, callback)?;
        Ok(self)
    }

    /// Bind a callback name, replacing any earlier binding
    pub fn replace_callback(mut self, name: impl Into<String>, callback: Callback) -> Self {
        self.callbacks.replace(name, callback);
        self
    }

    pub fn csv_sink(mut self, sink: Arc<dyn CsvSink>) -> Self {
        self.csv = sink;
        self
    }

    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = stats;
        self
    }

    /// Use these regions instead of loading the document's KML files
    pub fn resolver(mut self, resolver: Arc<RegionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validate `doc` and construct the engine
    pub fn build(self, doc: RuleDocument) -> TrackerResult<StreamEngine> {
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(RegionResolver::load(&doc.kml_paths())?),
        };
        let rules = Arc::new(RuleSet::compile(&doc, &self.callbacks, &resolver)?);
        let settings = doc.config;

        let dispatcher = ActionDispatcher::new(
            self.callbacks,
            self.csv,
            self.stats.clone(),
            settings.replay_url_base.clone(),
        );
        let proximity = ProximityTracker::new(
            ProximityMode::Live,
            settings.proximity_grace_secs,
            self.stats.clone(),
        );
        let resampler = settings
            .resample
            .then(|| {
                Resampler::new(settings.resample_interval_secs, settings.resample_max_gap_secs)
            });
        let (event_tx, _) = broadcast::channel(1024);

        info!(
            rules = rules.len(),
            regions = resolver.len(),
            async_dispatch = settings.async_dispatch,
            resample = settings.resample,
            "Stream engine built"
        );

        Ok(StreamEngine {
            registry: Arc::new(FlightRegistry::new(resolver.clone())),
            resolver,
            rules,
            dispatcher: Arc::new(dispatcher),
            proximity,
            resampler,
            stats: self.stats,
            settings,
            clock: AtomicI64::new(NO_TIME),
            last_housekeeping: AtomicI64::new(NO_TIME),
            cooldowns: DashMap::new(),
            event_tx,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            pair_tx: Mutex::new(None),
        })
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// What one report did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportOutcome {
    pub hex: String,
    pub created: bool,
    pub transition: Transition,
    /// Single-flight rules that matched, in document order
    pub matched: Vec<String>,
    /// Proximity encounters opened by this report
    pub encounters: usize,
}

/// Totals for a batch of reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub processed: u64,
    pub skipped: u64,
    pub rules_matched: u64,
    pub encounters: u64,
}

impl StreamSummary {
    fn record(&mut self, result: &TrackerResult<ReportOutcome>) {
        match result {
            Ok(outcome) => {
                self.processed += 1;
                self.rules_matched += outcome.matched.len() as u64;
                self.encounters += outcome.encounters as u64;
            }
            Err(_) => self.skipped += 1,
        }
    }
}

/// Result of one housekeeping round
#[derive(Debug, Clone, Default)]
pub struct Housekeeping {
    pub now: i64,
    pub expired: usize,
    pub retired: Vec<ProximityEvent>,
}

struct PairJob {
    rule: usize,
    a: Flight,
    b: Flight,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct StreamEngine {
    settings: Settings,
    rules: Arc<RuleSet>,
    resolver: Arc<RegionResolver>,
    registry: Arc<FlightRegistry>,
    dispatcher: Arc<ActionDispatcher>,
    proximity: ProximityTracker,
    resampler: Option<Resampler>,
    stats: Arc<Stats>,
    /// Latest report timestamp seen
    clock: AtomicI64,
    last_housekeeping: AtomicI64,
    /// (rule, hex) -> data time the rule last fired
    cooldowns: DashMap<(String, String), i64>,
    event_tx: broadcast::Sender<ProximityEvent>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pair_tx: Mutex<Option<mpsc::UnboundedSender<PairJob>>>,
}

impl StreamEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Process one report
    ///
    /// An invalid report is counted as skipped and returned as an error; it
    /// leaves every flight untouched.
    pub fn process(&self, report: &PositionReport) -> TrackerResult<ReportOutcome> {
        if let Err(e) = report.validate() {
            self.stats.record_skipped();
            warn!(hex = %report.hex, error = %e, "Skipping report");
            return Err(e.into());
        }

        self.stats.record_report();
        self.clock.fetch_max(report.now, Ordering::Relaxed);
        if let Some(resampler) = &self.resampler {
            resampler.record(report);
        }

        let FlightUpdate {
            mut flight,
            created,
            transition,
        } = self.registry.update(report);
        if created {
            self.stats.record_flight_created();
        }
        match transition {
            Transition::Takeoff => {
                self.stats.record_takeoff();
                debug!(hex = %flight.hex, flight_id = %flight.flight_id, "Takeoff");
            }
            Transition::Landing => {
                self.stats.record_landing();
                debug!(hex = %flight.hex, flight_id = %flight.flight_id, "Landing");
            }
            Transition::None => {}
        }

        let mut outcome = ReportOutcome {
            hex: flight.hex.clone(),
            created,
            transition,
            ..Default::default()
        };

        for (index, rule) in self.rules.rules().iter().enumerate() {
            let cooldown_key = rule
                .has_cooldown()
                .then(|| (rule.name.clone(), flight.hex.clone()));
            let last_fired = cooldown_key
                .as_ref()
                .and_then(|key| self.cooldowns.get(key).map(|t| *t));

            let ctx = EvalContext::new(&flight)
                .with_transition(transition)
                .with_last_fired(last_fired);
            if !rule.matches(&ctx) {
                continue;
            }

            match rule.proximity {
                Some(thresholds) => {
                    let opened = self.scan_pairs(index, rule, &thresholds, &flight);
                    if opened > 0 {
                        if let Some(key) = cooldown_key {
                            self.cooldowns.insert(key, report.now);
                        }
                    }
                    outcome.encounters += opened;
                }
                None => {
                    if let Some(key) = cooldown_key {
                        self.cooldowns.insert(key, report.now);
                    }
                    self.dispatcher.dispatch(rule, &mut flight, &self.registry);
                    outcome.matched.push(rule.name.clone());
                }
            }
        }

        self.maybe_housekeep(report.now);
        Ok(outcome)
    }

    /// Process reports in order; bad reports are skipped
    pub fn process_stream<I>(&self, reports: I) -> StreamSummary
    where
        I: IntoIterator<Item = PositionReport>,
    {
        let mut summary = StreamSummary::default();
        for report in reports {
            summary.record(&self.process(&report));
        }
        summary
    }

    /// Process newline-delimited JSON reports
    ///
    /// Undecodable lines are counted and skipped; a read failure ends the
    /// batch with an error.
    pub fn process_json_lines<R: BufRead>(&self, reader: R) -> TrackerResult<StreamSummary> {
        let mut summary = StreamSummary::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match PositionReport::from_json(&line) {
                Ok(report) => summary.record(&self.process(&report)),
                Err(e) => {
                    self.stats.record_skipped();
                    summary.skipped += 1;
                    warn!(line = lineno + 1, error = %e, "Skipping undecodable report");
                }
            }
        }
        Ok(summary)
    }

    /// Process an async stream until it ends or `cancel` fires
    pub async fn run_stream<S>(&self, stream: S, cancel: &CancellationToken) -> StreamSummary
    where
        S: Stream<Item = PositionReport>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut summary = StreamSummary::default();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(processed = summary.processed, "Stream ingestion cancelled");
                    break;
                }

                next = stream.next() => match next {
                    Some(report) => summary.record(&self.process(&report)),
                    None => break,
                },
            }
        }
        summary
    }

    // ------------------------------------------------------------------------
    // Proximity
    // ------------------------------------------------------------------------

    fn scan_pairs(
        &self,
        index: usize,
        rule: &Rule,
        thresholds: &ProximityThresholds,
        flight: &Flight,
    ) -> usize {
        let partners = proximity::find_partners(
            rule,
            thresholds,
            flight,
            &self.registry,
            self.settings.proximity_time_window_secs,
        );

        let mut opened = 0;
        for (partner, separation) in partners {
            let obs = Observation::new(flight, &partner, separation);
            let observed = self.proximity.observe(&rule.name, &obs);
            if observed.is_opened() {
                opened += 1;
                self.dispatch_pair(index, rule, flight.clone(), partner);
            }
            if let Some(event) = observed.into_retired() {
                let _ = self.event_tx.send(event);
            }
        }
        opened
    }

    fn dispatch_pair(&self, index: usize, rule: &Rule, a: Flight, b: Flight) {
        let job = PairJob { rule: index, a, b };
        let job = match self.pair_tx.lock().as_ref() {
            Some(tx) if self.settings.async_dispatch => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            _ => job,
        };
        self.dispatcher.dispatch_pair(rule, &job.a, &job.b, &self.registry);
    }

    /// Batch proximity pass over the resampled history
    pub fn trigger_resampled_proximity_pass(&self) -> TrackerResult<Vec<ProximityEvent>> {
        self.trigger_resampled_proximity_pass_with(&self.cancel)
    }

    /// Batch proximity pass that stops at the next tick once `cancel` fires
    pub fn trigger_resampled_proximity_pass_with(
        &self,
        cancel: &CancellationToken,
    ) -> TrackerResult<Vec<ProximityEvent>> {
        let resampler = self
            .resampler
            .as_ref()
            .filter(|r| !r.is_empty())
            .ok_or(TrackerError::NoResampleData)?;
        let timeline = resampler
            .resample(self.resolver.clone())
            .ok_or(TrackerError::NoResampleData)?;

        let rules: Vec<&Rule> = self.rules.pairwise_rules().collect();
        if rules.is_empty() {
            info!("No proximity rules; resampled pass skipped");
            return Ok(Vec::new());
        }

        info!(
            aircraft = resampler.aircraft_count(),
            samples = resampler.sample_count(),
            ticks = timeline.tick_count(),
            "Starting resampled proximity pass"
        );
        let events = proximity::batch_pass(
            &rules,
            &timeline,
            self.settings.proximity_grace_secs,
            self.stats.clone(),
            cancel,
            |rule, a, b| self.dispatcher.dispatch_pair(rule, a, b, &self.registry),
        )?;

        info!(events = events.len(), "Resampled proximity pass complete");
        Ok(events)
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    fn maybe_housekeep(&self, now: i64) {
        let last = self.last_housekeeping.load(Ordering::Relaxed);
        if last == NO_TIME {
            let _ = self.last_housekeeping.compare_exchange(
                NO_TIME,
                now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            return;
        }
        if now - last < self.settings.expire_interval_secs {
            return;
        }
        if self
            .last_housekeeping
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.housekeep_at(now);
        }
    }

    /// Expire stale flights and retire quiet encounters at the current data time
    pub fn housekeeping(&self) -> Option<Housekeeping> {
        self.data_clock().map(|now| self.housekeep_at(now))
    }

    fn housekeep_at(&self, now: i64) -> Housekeeping {
        let expired = self.expire_flights(now).len();
        let retired = self.sweep_proximity(now);
        Housekeeping {
            now,
            expired,
            retired,
        }
    }

    /// Remove flights idle longer than `flight_expire_secs` and run their expire callbacks
    pub fn expire_flights(&self, now: i64) -> Vec<Flight> {
        let expired = self.registry.expire(now, self.settings.flight_expire_secs);
        for flight in &expired {
            self.stats.record_flight_expired();
            debug!(hex = %flight.hex, flight_id = %flight.flight_id, "Flight expired");
            self.dispatcher.dispatch_expired(flight);
        }
        if !expired.is_empty() && !self.cooldowns.is_empty() {
            self.cooldowns
                .retain(|(_, hex), _| !expired.iter().any(|f| &f.hex == hex));
        }
        expired
    }

    /// Retire live encounters quiet for longer than the grace period
    pub fn sweep_proximity(&self, now: i64) -> Vec<ProximityEvent> {
        let retired = self.proximity.sweep(now);
        for event in &retired {
            let _ = self.event_tx.send(event.clone());
        }
        retired
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn the sweeper and, with `async_dispatch`, the pair worker
    pub fn start(self: &Arc<Self>) -> TrackerResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.cancel.is_cancelled() {
            return Err(TrackerError::AlreadyStarted);
        }

        let interval = Duration::from_millis(self.settings.sweep_interval_ms.max(1));
        let sweeper = Sweeper::new(Arc::clone(self), interval);
        workers.push(tokio::spawn(sweeper.run(self.cancel.clone())));

        if self.settings.async_dispatch && self.rules.has_pairwise_rules() {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.pair_tx.lock() = Some(tx);
            workers.push(tokio::spawn(pair_worker(
                rx,
                self.rules.clone(),
                self.dispatcher.clone(),
                self.registry.clone(),
            )));
        }

        info!(workers = workers.len(), "Stream engine started");
        Ok(())
    }

    /// Cancel background work and wait for it to finish
    ///
    /// Pair jobs already queued are still delivered.
    pub async fn shutdown(&self) -> TrackerResult<()> {
        self.cancel.cancel();
        self.pair_tx.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        let results = futures::future::join_all(workers).await;
        info!("Stream engine stopped");
        for result in results {
            result?;
        }
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn flight(&self, hex: &str) -> Option<Flight> {
        self.registry.get(hex)
    }

    pub fn flights(&self) -> Vec<Flight> {
        self.registry.snapshot()
    }

    pub fn flight_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_encounters(&self) -> usize {
        self.proximity.active_count()
    }

    /// Retired live encounters as they happen
    pub fn subscribe(&self) -> broadcast::Receiver<ProximityEvent> {
        self.event_tx.subscribe()
    }

    /// Latest report timestamp, `None` before the first report
    pub fn data_clock(&self) -> Option<i64> {
        Some(self.clock.load(Ordering::Relaxed)).filter(|&t| t != NO_TIME)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

async fn pair_worker(
    mut rx: mpsc::UnboundedReceiver<PairJob>,
    rules: Arc<RuleSet>,
    dispatcher: Arc<ActionDispatcher>,
    registry: Arc<FlightRegistry>,
) {
    debug!("Pair dispatch worker started");
    while let Some(job) = rx.recv().await {
        match rules.rules().get(job.rule) {
            Some(rule) => dispatcher.dispatch_pair(rule, &job.a, &job.b, &registry),
            None => warn!(index = job.rule, "Pair job for unknown rule"),
        }
    }
    debug!("Pair dispatch worker finished");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::Altitude;
    use std::sync::atomic::AtomicUsize;

    fn counting(builder: EngineBuilder, name: &str) -> (EngineBuilder, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let builder = builder
            .register_callback(
                name,
                Callback::flight(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        (builder, count)
    }

    fn doc(yaml: &str) -> RuleDocument {
        RuleDocument::from_yaml_str(yaml).unwrap()
    }

    fn report(now: i64, hex: &str, alt: Altitude) -> PositionReport {
        PositionReport::new(now, hex, 40.0, -105.0, alt)
    }

    const EVERYTHING: &str = r#"
rules:
  everything:
    conditions: {}
    actions:
      callback: cb
"#;

    #[test]
    fn test_unconditional_rule_fires_every_report() {
        let (builder, count) = counting(EngineBuilder::new(), "cb");
        let engine = builder.build(doc(EVERYTHING)).unwrap();

        for t in 0..5 {
            let outcome = engine.process(&report(t, "abc", Altitude::Feet(1000))).unwrap();
            assert_eq!(outcome.matched, vec!["everything"]);
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(engine.stats().snapshot().reports_processed, 5);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (builder, _) = counting(EngineBuilder::new(), "cb");
        let err = builder
            .register_callback("cb", Callback::flight(|_| Ok(())))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TrackerError::Rules(skywatch_rules::RulesError::DuplicateCallback(_))
        ));
    }

    #[test]
    fn test_replace_callback_rebinds() {
        let (builder, first) = counting(EngineBuilder::new(), "cb");
        let second = Arc::new(AtomicUsize::new(0));
        let counter = second.clone();
        let engine = builder
            .replace_callback(
                "cb",
                Callback::flight(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .build(doc(EVERYTHING))
            .unwrap();

        engine.process(&report(0, "abc", Altitude::Feet(1000))).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_callback_fails_build() {
        let err = EngineBuilder::new().build(doc(EVERYTHING)).err().unwrap();
        assert!(matches!(
            err,
            TrackerError::Rules(skywatch_rules::RulesError::UnknownCallback { .. })
        ));
    }

    #[test]
    fn test_invalid_report_skipped() {
        let (builder, count) = counting(EngineBuilder::new(), "cb");
        let engine = builder.build(doc(EVERYTHING)).unwrap();

        let reports = vec![
            report(0, "abc", Altitude::Feet(1000)),
            PositionReport::new(1, "abc", 123.0, -105.0, Altitude::Feet(1000)),
            report(2, "", Altitude::Feet(1000)),
            report(3, "abc", Altitude::Feet(1000)),
        ];
        let summary = engine.process_stream(reports);

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().snapshot().reports_skipped, 2);
    }

    #[test]
    fn test_json_lines_skip_bad_lines() {
        let (builder, count) = counting(EngineBuilder::new(), "cb");
        let engine = builder.build(doc(EVERYTHING)).unwrap();

        let input = concat!(
            r#"{"now": 1, "alt_baro": 1200, "gscp": 90, "lat": 40.0, "lon": -105.0, "track": 10, "hex": "abc", "flight": "N1"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"now": 2, "alt_baro": "ground", "gscp": 0, "lat": 40.0, "lon": -105.0, "track": 10, "hex": "abc", "flight": null}"#,
            "\n",
        );
        let summary = engine.process_json_lines(input.as_bytes()).unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.flight("abc").unwrap().flight_id, "N1");
        assert_eq!(engine.stats().snapshot().landings, 1);
    }

    #[test]
    fn test_transition_rule_and_cooldown() {
        let (builder, count) = counting(EngineBuilder::new(), "cb");
        let engine = builder
            .build(doc(
                r#"
rules:
  takeoff:
    conditions:
      transition: takeoff
      cooldown: 10
    actions:
      callback: cb
"#,
            ))
            .unwrap();

        let seq = [
            (0, Altitude::Ground),
            (10, Altitude::Feet(500)),
            (20, Altitude::Ground),
            (30, Altitude::Feet(500)),
            (700, Altitude::Ground),
            (710, Altitude::Feet(500)),
        ];
        for (t, alt) in seq {
            engine.process(&report(t, "abc", alt)).unwrap();
        }

        // the takeoff at t=30 falls inside the ten-minute cooldown
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().snapshot().takeoffs, 3);
    }

    #[test]
    fn test_data_time_expiry_runs_expire_callbacks() {
        let (builder, count) = counting(EngineBuilder::new(), "gone");
        let engine = builder
            .build(doc(
                r#"
config:
  flight_expire_secs: 100
  expire_interval_secs: 50
rules:
  track:
    conditions: {}
    actions:
      expire_callback: gone
"#,
            ))
            .unwrap();

        engine.process(&report(0, "old", Altitude::Feet(1000))).unwrap();
        engine.process(&report(90, "new", Altitude::Feet(1000))).unwrap();
        assert_eq!(engine.flight_count(), 2);

        engine.process(&report(160, "new", Altitude::Feet(1000))).unwrap();
        assert!(engine.flight("old").is_none());
        assert_eq!(engine.flight_count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().snapshot().flights_expired, 1);
    }

    #[test]
    fn test_resampled_pass_without_data() {
        let engine = EngineBuilder::new().build(doc("rules: {}")).unwrap();
        assert!(matches!(
            engine.trigger_resampled_proximity_pass(),
            Err(TrackerError::NoResampleData)
        ));

        let engine = EngineBuilder::new()
            .build(doc("config:\n  resample: true\nrules: {}"))
            .unwrap();
        assert!(matches!(
            engine.trigger_resampled_proximity_pass(),
            Err(TrackerError::NoResampleData)
        ));
    }

    #[test]
    fn test_data_clock() {
        let engine = EngineBuilder::new().build(doc("rules: {}")).unwrap();
        assert_eq!(engine.data_clock(), None);
        assert!(engine.housekeeping().is_none());

        engine.process(&report(50, "abc", Altitude::Feet(1000))).unwrap();
        engine.process(&report(40, "def", Altitude::Feet(1000))).unwrap();
        assert_eq!(engine.data_clock(), Some(50));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = Arc::new(EngineBuilder::new().build(doc("rules: {}")).unwrap());
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(TrackerError::AlreadyStarted)));

        let result = tokio::time::timeout(Duration::from_secs(1), engine.shutdown()).await;
        assert!(matches!(result, Ok(Ok(()))));
        assert!(engine.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_every_worker() {
        let engine = Arc::new(EngineBuilder::new().build(doc("rules: {}")).unwrap());
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        {
            let mut workers = engine.workers.lock();
            workers.push(tokio::spawn(async { panic!("worker failed") }));
            workers.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let result = tokio::time::timeout(Duration::from_secs(1), engine.shutdown()).await;
        assert!(matches!(result, Ok(Err(TrackerError::Task(_)))));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(engine.workers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_stream_stops_on_cancel() {
        let (builder, count) = counting(EngineBuilder::new(), "cb");
        let engine = builder.build(doc(EVERYTHING)).unwrap();

        let reports = tokio_stream::iter((0..3).map(|t| report(t, "abc", Altitude::Feet(1000))));
        let cancel = CancellationToken::new();
        let summary = engine.run_stream(reports, &cancel).await;
        assert_eq!(summary.processed, 3);

        cancel.cancel();
        let more = tokio_stream::iter((3..6).map(|t| report(t, "abc", Altitude::Feet(1000))));
        let summary = engine.run_stream(more, &cancel).await;
        assert_eq!(summary.processed, 0);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
