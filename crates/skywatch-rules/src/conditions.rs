//! Condition engine
//!
//! Conditions are parsed from the raw document once, at load time, into a
//! closed [`Condition`] enum. Evaluation is pure: it reads the already
//! updated [`Flight`] and never touches shared state.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::Value;
use skywatch_core::{Altitude, Flight, GeoPosition, RegionResolver, Transition};
use tracing::warn;

use crate::error::{RulesError, RulesResult};

// ============================================================================
// AIRCRAFT LISTS
// ============================================================================

/// Named set of tail numbers or hex codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AircraftList {
    name: String,
    members: HashSet<String>,
}

impl AircraftList {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(|m| normalize(m.as_ref())).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.members.contains(&normalize(identity))
    }

    /// Membership by tail number/callsign or by hex code
    pub fn contains_flight(&self, flight: &Flight) -> bool {
        self.contains(&flight.flight_id) || self.contains(&flight.hex)
    }
}

fn normalize(identity: &str) -> String {
    identity.trim().to_uppercase()
}

// ============================================================================
// CONDITIONS
// ============================================================================

/// `changed_regions` mode; `true` in a document is read as `Any`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionChange {
    /// Any change of the occupied set, including entering or leaving all regions
    Any,
    /// Only movement from one named region set to another
    Strict,
}

/// Pairwise thresholds that turn a rule into a proximity rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityThresholds {
    pub alt_sep_ft: i32,
    pub lat_sep_nm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    MinAlt { feet: i32, allow_ground: bool },
    MaxAlt { feet: i32, allow_ground: bool },
    AircraftList(Arc<AircraftList>),
    ExcludeAircraftList(Arc<AircraftList>),
    LatLongRing { radius_nm: f64, lat: f64, lon: f64 },
    Regions(BTreeSet<String>),
    ChangedRegions(RegionChange),
    Transition(Transition),
    Cooldown { secs: i64 },
}

/// Everything a condition may look at
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Flight after the current report was applied
    pub flight: &'a Flight,
    /// Air/ground change produced by the current report
    pub transition: Transition,
    /// Data time at which this rule last fired for this flight
    pub last_fired: Option<i64>,
}

impl<'a> EvalContext<'a> {
    pub fn new(flight: &'a Flight) -> Self {
        Self {
            flight,
            transition: Transition::None,
            last_fired: None,
        }
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transition = transition;
        self
    }

    pub fn with_last_fired(mut self, last_fired: Option<i64>) -> Self {
        self.last_fired = last_fired;
        self
    }
}

impl Condition {
    pub fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        let flight = ctx.flight;
        let loc = &flight.lastloc;

        match self {
            Condition::MinAlt { feet, allow_ground } => {
                altitude_for_bounds(loc.alt, *allow_ground).is_some_and(|alt| alt >= *feet)
            }
            Condition::MaxAlt { feet, allow_ground } => {
                altitude_for_bounds(loc.alt, *allow_ground).is_some_and(|alt| alt <= *feet)
            }
            Condition::AircraftList(list) => list.contains_flight(flight),
            Condition::ExcludeAircraftList(list) => !list.contains_flight(flight),
            Condition::LatLongRing {
                radius_nm,
                lat,
                lon,
            } => RegionResolver::ring_contains(loc.lat, loc.lon, *lat, *lon, *radius_nm),
            Condition::Regions(names) => !flight.regions.is_disjoint(names),
            Condition::ChangedRegions(mode) => regions_changed(flight, *mode),
            Condition::Transition(wanted) => ctx.transition == *wanted,
            Condition::Cooldown { secs } => ctx
                .last_fired
                .is_none_or(|fired| loc.now - fired >= *secs),
        }
    }

    /// True for conditions that depend only on the current position
    pub fn is_stateless(&self) -> bool {
        !matches!(
            self,
            Condition::ChangedRegions(_) | Condition::Transition(_) | Condition::Cooldown { .. }
        )
    }

    pub fn is_cooldown(&self) -> bool {
        matches!(self, Condition::Cooldown { .. })
    }
}

fn altitude_for_bounds(alt: Altitude, allow_ground: bool) -> Option<i32> {
    match alt {
        Altitude::Feet(ft) => Some(ft),
        Altitude::Ground if allow_ground => Some(0),
        Altitude::Ground => None,
    }
}

fn regions_changed(flight: &Flight, mode: RegionChange) -> bool {
    // A brand-new flight has nothing to compare against
    let Some(prev) = flight.prev_regions.as_ref() else {
        return false;
    };
    let curr = &flight.regions;
    if prev == curr {
        return false;
    }
    match mode {
        RegionChange::Any => true,
        RegionChange::Strict => !prev.is_empty() && !curr.is_empty(),
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Conditions of one rule, split into per-flight conditions and the
/// optional pairwise thresholds
#[derive(Debug, Clone, Default)]
pub(crate) struct ParsedConditions {
    pub conditions: Vec<Condition>,
    pub proximity: Option<ProximityThresholds>,
}

pub(crate) fn parse_conditions(
    rule: &str,
    value: Option<&Value>,
    lists: &BTreeMap<String, Arc<AircraftList>>,
    resolver: &RegionResolver,
) -> RulesResult<ParsedConditions> {
    let map = match value {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(RulesError::ConditionsNotMapping {
                rule: rule.to_string(),
                found: value_kind(other),
            });
        }
        None => {
            return Err(RulesError::MissingConditions {
                rule: rule.to_string(),
            });
        }
    };

    let allow_ground = match map.get("allow_ground") {
        Some(v) => as_bool(rule, "allow_ground", v)?,
        None => false,
    };

    let mut parsed = ParsedConditions::default();
    for (key, v) in map {
        let condition = match key.as_str() {
            "allow_ground" => continue,
            "min_alt" => Condition::MinAlt {
                feet: as_feet(rule, key, v)?,
                allow_ground,
            },
            "max_alt" => Condition::MaxAlt {
                feet: as_feet(rule, key, v)?,
                allow_ground,
            },
            "aircraft_list" => Condition::AircraftList(lookup_list(rule, key, v, lists)?),
            "exclude_aircraft_list" => {
                Condition::ExcludeAircraftList(lookup_list(rule, key, v, lists)?)
            }
            "latlongring" => parse_ring(rule, key, v)?,
            "regions" => Condition::Regions(parse_regions(rule, key, v, resolver)?),
            "changed_regions" => {
                if resolver.is_empty() {
                    warn!(rule = %rule, "changed_regions used with no geofences loaded");
                }
                Condition::ChangedRegions(parse_region_change(rule, key, v)?)
            }
            "transition" => Condition::Transition(parse_transition(rule, key, v)?),
            "cooldown" => {
                let minutes = as_number(rule, key, v)?;
                if minutes <= 0.0 {
                    return Err(RulesError::invalid_condition(rule, key, "must be positive"));
                }
                Condition::Cooldown {
                    secs: (minutes * 60.0).round() as i64,
                }
            }
            "proximity" => {
                parsed.proximity = Some(parse_proximity(rule, key, v)?);
                continue;
            }
            _ => {
                return Err(RulesError::UnknownCondition {
                    rule: rule.to_string(),
                    key: key.clone(),
                });
            }
        };
        parsed.conditions.push(condition);
    }

    Ok(parsed)
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

fn as_bool(rule: &str, key: &str, value: &Value) -> RulesResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| RulesError::invalid_condition(rule, key, "expected true or false"))
}

fn as_number(rule: &str, key: &str, value: &Value) -> RulesResult<f64> {
    value
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| {
            RulesError::invalid_condition(
                rule,
                key,
                format!("expected a number, found {}", value_kind(value)),
            )
        })
}

fn as_feet(rule: &str, key: &str, value: &Value) -> RulesResult<i32> {
    let feet = as_number(rule, key, value)?;
    if feet.abs() > i32::MAX as f64 {
        return Err(RulesError::invalid_condition(rule, key, "altitude out of range"));
    }
    Ok(feet.round() as i32)
}

fn as_str<'v>(rule: &str, key: &str, value: &'v Value) -> RulesResult<&'v str> {
    value.as_str().ok_or_else(|| {
        RulesError::invalid_condition(
            rule,
            key,
            format!("expected a string, found {}", value_kind(value)),
        )
    })
}

fn lookup_list(
    rule: &str,
    key: &str,
    value: &Value,
    lists: &BTreeMap<String, Arc<AircraftList>>,
) -> RulesResult<Arc<AircraftList>> {
    let name = as_str(rule, key, value)?;
    lists
        .get(name)
        .cloned()
        .ok_or_else(|| RulesError::UnknownAircraftList {
            rule: rule.to_string(),
            list: name.to_string(),
        })
}

fn numbers<const N: usize>(rule: &str, key: &str, value: &Value) -> RulesResult<[f64; N]> {
    let items = value
        .as_array()
        .filter(|items| items.len() == N)
        .ok_or_else(|| {
            RulesError::invalid_condition(rule, key, format!("expected a list of {} numbers", N))
        })?;

    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = as_number(rule, key, item)?;
    }
    Ok(out)
}

fn parse_ring(rule: &str, key: &str, value: &Value) -> RulesResult<Condition> {
    let [radius_nm, lat, lon] = numbers::<3>(rule, key, value)?;
    if radius_nm <= 0.0 {
        return Err(RulesError::invalid_condition(rule, key, "radius must be positive"));
    }
    if !GeoPosition::from_degrees(lat, lon).is_valid() {
        return Err(RulesError::invalid_condition(
            rule,
            key,
            format!("invalid center {}, {}", lat, lon),
        ));
    }
    Ok(Condition::LatLongRing {
        radius_nm,
        lat,
        lon,
    })
}

fn parse_regions(
    rule: &str,
    key: &str,
    value: &Value,
    resolver: &RegionResolver,
) -> RulesResult<BTreeSet<String>> {
    let names: BTreeSet<String> = match value {
        Value::String(name) => BTreeSet::from([name.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| as_str(rule, key, item).map(str::to_string))
            .collect::<RulesResult<_>>()?,
        other => {
            return Err(RulesError::invalid_condition(
                rule,
                key,
                format!("expected a region name or list, found {}", value_kind(other)),
            ));
        }
    };

    if names.is_empty() {
        return Err(RulesError::invalid_condition(rule, key, "no regions given"));
    }
    if let Some(missing) = names.iter().find(|name| !resolver.has_region(name)) {
        return Err(RulesError::UnknownRegion {
            rule: rule.to_string(),
            region: missing.clone(),
        });
    }
    Ok(names)
}

fn parse_region_change(rule: &str, key: &str, value: &Value) -> RulesResult<RegionChange> {
    match value {
        Value::Bool(true) => Ok(RegionChange::Any),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "any" | "true" => Ok(RegionChange::Any),
            "strict" => Ok(RegionChange::Strict),
            _ => Err(RulesError::invalid_condition(
                rule,
                key,
                format!("expected any, strict or true, found '{}'", s),
            )),
        },
        other => Err(RulesError::invalid_condition(
            rule,
            key,
            format!("expected any, strict or true, found {}", value_kind(other)),
        )),
    }
}

fn parse_transition(rule: &str, key: &str, value: &Value) -> RulesResult<Transition> {
    match as_str(rule, key, value)?.to_ascii_lowercase().as_str() {
        "takeoff" => Ok(Transition::Takeoff),
        "landing" => Ok(Transition::Landing),
        other => Err(RulesError::invalid_condition(
            rule,
            key,
            format!("expected takeoff or landing, found '{}'", other),
        )),
    }
}

fn parse_proximity(rule: &str, key: &str, value: &Value) -> RulesResult<ProximityThresholds> {
    let [alt_sep_ft, lat_sep_nm] = numbers::<2>(rule, key, value)?;
    if alt_sep_ft < 0.0 || lat_sep_nm <= 0.0 {
        return Err(RulesError::invalid_condition(
            rule,
            key,
            "thresholds must be positive",
        ));
    }
    Ok(ProximityThresholds {
        alt_sep_ft: alt_sep_ft.round() as i32,
        lat_sep_nm,
    })
}

// ============================================================================
// TESTS
// ============================================================================
