//! Proximity detection (loss of separation)
//!
//! Encounters are keyed by rule and the sorted hex pair. The first qualifying
//! observation of a pair opens an encounter and is the only one that fires
//! the rule's actions; later observations refresh it. An encounter quiet for
//! longer than the grace period is retired, by the sweeper or by the next
//! observation of the pair, after which the pair can fire again.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use skywatch_core::{Flight, ProximityEvent, ProximityMode, Separation, Stats};
use skywatch_rules::{ProximityThresholds, Rule};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{TrackerError, TrackerResult};
use crate::registry::FlightRegistry;
use crate::resample::Timeline;

/// Tracing target for retired encounters
pub const PROXIMITY_TARGET: &str = "skywatch::proximity";

/// Encounter identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub rule: String,
    pub hexes: (String, String),
}

impl PairKey {
    pub fn new(rule: &str, a: &str, b: &str) -> Self {
        let hexes = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        Self {
            rule: rule.to_string(),
            hexes,
        }
    }
}

#[derive(Debug, Clone)]
struct Encounter {
    id: Uuid,
    mode: ProximityMode,
    flight_ids: (String, String),
    first_seen: i64,
    last_seen: i64,
    min_separation: Separation,
    closest: (f64, f64),
    closest_at: i64,
}

impl Encounter {
    fn open(obs: &Observation<'_>, mode: ProximityMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            flight_ids: obs.flight_ids(),
            first_seen: obs.now,
            last_seen: obs.now,
            min_separation: obs.separation,
            closest: obs.midpoint(),
            closest_at: obs.now,
        }
    }

    fn refresh(&mut self, obs: &Observation<'_>) {
        self.last_seen = self.last_seen.max(obs.now);
        if obs.separation.is_closer_than(&self.min_separation) {
            self.min_separation = obs.separation;
            self.closest = obs.midpoint();
            self.closest_at = obs.now;
        }
    }

    fn into_event(self, key: PairKey) -> ProximityEvent {
        ProximityEvent {
            id: self.id,
            rule: key.rule,
            mode: self.mode,
            hexes: key.hexes,
            flight_ids: self.flight_ids,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            min_separation: self.min_separation,
            closest_lat: self.closest.0,
            closest_lon: self.closest.1,
            closest_at: self.closest_at,
        }
    }
}

/// Two flights seen within a rule's thresholds
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub a: &'a Flight,
    pub b: &'a Flight,
    pub separation: Separation,
    pub now: i64,
}

impl<'a> Observation<'a> {
    pub fn new(a: &'a Flight, b: &'a Flight, separation: Separation) -> Self {
        Self {
            a,
            b,
            separation,
            now: a.lastloc.now.max(b.lastloc.now),
        }
    }

    fn ordered(&self) -> (&'a Flight, &'a Flight) {
        if self.a.hex <= self.b.hex {
            (self.a, self.b)
        } else {
            (self.b, self.a)
        }
    }

    fn flight_ids(&self) -> (String, String) {
        let (first, second) = self.ordered();
        (first.flight_id.clone(), second.flight_id.clone())
    }

    fn midpoint(&self) -> (f64, f64) {
        let (a, b) = (&self.a.lastloc, &self.b.lastloc);
        ((a.lat + b.lat) / 2.0, (a.lon + b.lon) / 2.0)
    }
}

/// Separation if `a` and `b` are both airborne and within `thresholds`
pub fn within_thresholds(
    a: &Flight,
    b: &Flight,
    thresholds: &ProximityThresholds,
) -> Option<Separation> {
    Separation::between(&a.lastloc, &b.lastloc)
        .filter(|sep| sep.within(thresholds.lat_sep_nm, thresholds.alt_sep_ft))
}

// ============================================================================
// TRACKER
// ============================================================================

/// Outcome of [`ProximityTracker::observe`]
#[derive(Debug, Clone)]
pub enum Observed {
    /// First sighting of the pair
    Opened,
    /// Same encounter, still inside the grace period
    Refreshed,
    /// The previous encounter went quiet past the grace period and was retired
    Reopened(ProximityEvent),
}

impl Observed {
    /// True when a new encounter was opened and its actions should fire
    pub fn is_opened(&self) -> bool {
        !matches!(self, Self::Refreshed)
    }

    pub fn into_retired(self) -> Option<ProximityEvent> {
        match self {
            Self::Reopened(event) => Some(event),
            _ => None,
        }
    }
}

pub struct ProximityTracker {
    encounters: DashMap<PairKey, Encounter>,
    mode: ProximityMode,
    grace_secs: i64,
    stats: Arc<Stats>,
}

impl ProximityTracker {
    pub fn new(mode: ProximityMode, grace_secs: i64, stats: Arc<Stats>) -> Self {
        Self {
            encounters: DashMap::new(),
            mode,
            grace_secs,
            stats,
        }
    }

    /// Record an observation of a pair within thresholds
    ///
    /// The entry lock makes the open-or-refresh decision atomic, so
    /// concurrent observers of the same pair see exactly one opening. An
    /// encounter that has been quiet past the grace period is retired here
    /// and replaced, without waiting for the next sweep.
    pub fn observe(&self, rule: &str, obs: &Observation<'_>) -> Observed {
        let key = PairKey::new(rule, &obs.a.hex, &obs.b.hex);
        match self.encounters.entry(key) {
            Entry::Occupied(mut entry) => {
                if obs.now - entry.get().last_seen <= self.grace_secs {
                    entry.get_mut().refresh(obs);
                    return Observed::Refreshed;
                }
                let stale = std::mem::replace(entry.get_mut(), self.open(rule, obs));
                let key = entry.key().clone();
                drop(entry);
                Observed::Reopened(self.retire(key, stale))
            }
            Entry::Vacant(entry) => {
                entry.insert(self.open(rule, obs));
                Observed::Opened
            }
        }
    }

    fn open(&self, rule: &str, obs: &Observation<'_>) -> Encounter {
        debug!(
            rule = %rule,
            a = %obs.a.hex,
            b = %obs.b.hex,
            distance_nm = obs.separation.distance_nm,
            alt_sep_ft = obs.separation.alt_sep_ft,
            "Proximity encounter opened"
        );
        self.stats.record_encounter();
        Encounter::open(obs, self.mode)
    }

    /// Retire encounters quiet for longer than the grace period at data time `now`
    pub fn sweep(&self, now: i64) -> Vec<ProximityEvent> {
        let quiet: Vec<PairKey> = self
            .encounters
            .iter()
            .filter(|entry| now - entry.last_seen > self.grace_secs)
            .map(|entry| entry.key().clone())
            .collect();

        quiet
            .into_iter()
            .filter_map(|key| {
                self.encounters
                    .remove_if(&key, |_, enc| now - enc.last_seen > self.grace_secs)
            })
            .map(|(key, enc)| self.retire(key, enc))
            .collect()
    }

    /// Retire every open encounter
    pub fn drain(&self) -> Vec<ProximityEvent> {
        let keys: Vec<PairKey> = self.encounters.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.encounters.remove(&key))
            .map(|(key, enc)| self.retire(key, enc))
            .collect()
    }

    fn retire(&self, key: PairKey, encounter: Encounter) -> ProximityEvent {
        let event = encounter.into_event(key);
        self.stats.record_encounter_retired();
        info!(
            target: PROXIMITY_TARGET,
            rule = %event.rule,
            a = %event.flight_ids.0,
            b = %event.flight_ids.1,
            first_seen = event.first_seen,
            last_seen = event.last_seen,
            min_distance_nm = event.min_separation.distance_nm,
            min_alt_sep_ft = event.min_separation.alt_sep_ft,
            "Proximity encounter retired"
        );
        event
    }

    pub fn is_active(&self, rule: &str, a: &str, b: &str) -> bool {
        self.encounters.contains_key(&PairKey::new(rule, a, b))
    }

    pub fn active_count(&self) -> usize {
        self.encounters.len()
    }
}

// ============================================================================
// LIVE SCAN
// ============================================================================

/// Partners of `flight` under `rule`, checked against the registry's current state
///
/// Only `flight` is compared with the rest of the population. Partners must
/// be airborne, satisfy the rule's position conditions and have reported
/// within `time_window_secs` of `flight`.
pub fn find_partners(
    rule: &Rule,
    thresholds: &ProximityThresholds,
    flight: &Flight,
    registry: &FlightRegistry,
    time_window_secs: i64,
) -> Vec<(Flight, Separation)> {
    if !flight.lastloc.is_airborne() {
        return Vec::new();
    }

    let mut partners = Vec::new();
    registry.for_each(|other| {
        if other.hex == flight.hex
            || (other.lastloc.now - flight.lastloc.now).abs() > time_window_secs
        {
            return;
        }
        if let Some(sep) = within_thresholds(flight, other, thresholds) {
            partners.push((other.clone(), sep));
        }
    });

    // Rule evaluation happens outside the registry iteration
    partners.retain(|(other, _)| rule.matches_stateless(other));
    partners
}

// ============================================================================
// BATCH PASS
// ============================================================================

/// Run pairwise rules over a resampled timeline
///
/// `on_open` is called for every new encounter with the rule and both
/// flights at that tick. Cancellation is checked before each tick.
pub fn batch_pass<F>(
    rules: &[&Rule],
    timeline: &Timeline,
    grace_secs: i64,
    stats: Arc<Stats>,
    cancel: &CancellationToken,
    mut on_open: F,
) -> TrackerResult<Vec<ProximityEvent>>
where
    F: FnMut(&Rule, &Flight, &Flight),
{
    let tracker = ProximityTracker::new(ProximityMode::Resampled, grace_secs, stats);
    let mut events = Vec::new();

    for tick in timeline.ticks() {
        if cancel.is_cancelled() {
            info!(tick, "Resampled proximity pass cancelled");
            return Err(TrackerError::Cancelled);
        }

        let flights = timeline.flights_at(tick);
        if flights.len() >= 2 {
            for rule in rules {
                let Some(thresholds) = rule.proximity.as_ref() else {
                    continue;
                };
                let eligible: Vec<&Flight> = flights
                    .iter()
                    .filter(|f| f.lastloc.is_airborne() && rule.matches_stateless(f))
                    .collect();

                for (i, j) in CellIndex::build(&eligible, thresholds.lat_sep_nm).candidate_pairs() {
                    let (a, b) = (eligible[i], eligible[j]);
                    let Some(sep) = within_thresholds(a, b, thresholds) else {
                        continue;
                    };
                    let observed = tracker.observe(&rule.name, &Observation::new(a, b, sep));
                    if observed.is_opened() {
                        on_open(rule, a, b);
                    }
                    events.extend(observed.into_retired());
                }
            }
        }

        events.extend(tracker.sweep(tick));
    }

    events.extend(tracker.drain());
    events.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.hexes.cmp(&b.hexes)));
    Ok(events)
}

/// Lat/lon grid with cells at least one horizontal threshold wide
struct CellIndex {
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl CellIndex {
    fn build(flights: &[&Flight], lat_sep_nm: f64) -> Self {
        let lat_cell = lat_sep_nm / 60.0;
        // Longitude degrees shrink with latitude; size cells for the highest one present
        let max_lat = flights
            .iter()
            .map(|f| f.lastloc.lat.abs())
            .fold(0.0_f64, f64::max)
            .min(89.0);
        let lon_cell = lat_cell / max_lat.to_radians().cos();

        let mut cells: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (idx, flight) in flights.iter().enumerate() {
            let cell = (
                (flight.lastloc.lat / lat_cell).floor() as i64,
                (flight.lastloc.lon / lon_cell).floor() as i64,
            );
            cells.entry(cell).or_default().push(idx);
        }
        Self { cells }
    }

    /// Index pairs `(i, j)`, `i < j`, in the same or adjacent cells
    fn candidate_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (&(row, col), members) in &self.cells {
            for d_row in -1..=1 {
                for d_col in -1..=1 {
                    let Some(neighbours) = self.cells.get(&(row + d_row, col + d_col)) else {
                        continue;
                    };
                    for &i in members {
                        for &j in neighbours {
                            if i < j {
                                pairs.push((i, j));
                            }
                        }
                    }
                }
            }
        }
        pairs.sort_unstable();
        pairs
    }
}

// ============================================================================
// TESTS
// ============================================================================
