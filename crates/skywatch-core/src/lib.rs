//! # Skywatch Core
//!
//! Core domain models for the skywatch aircraft rule engine.
//! This crate provides the normalized position report, the per-aircraft
//! `Flight` state, geofence regions and the process-wide counters shared by
//! the rule and tracker crates.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

pub mod error;
pub mod events;
pub mod geo;
pub mod regions;
pub mod stats;

pub use error::{CoreError, CoreResult};
pub use events::*;
pub use geo::*;
pub use regions::{Region, RegionResolver};
pub use stats::{Stats, StatsSnapshot};

// ============================================================================
// ALTITUDE
// ============================================================================

/// Barometric altitude as reported by the feed
///
/// Serialized as an integer number of feet or the string `"ground"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Altitude {
    Ground,
    Feet(i32),
}

impl Altitude {
    pub fn is_ground(&self) -> bool {
        matches!(self, Altitude::Ground)
    }

    /// Altitude in feet, `None` on the ground
    pub fn feet(&self) -> Option<i32> {
        match self {
            Altitude::Ground => None,
            Altitude::Feet(ft) => Some(*ft),
        }
    }

    /// Altitude in feet with the ground mapped to zero
    pub fn feet_or_zero(&self) -> i32 {
        self.feet().unwrap_or(0)
    }
}

impl fmt::Display for Altitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Altitude::Ground => write!(f, "ground"),
            Altitude::Feet(ft) => write!(f, "{}", ft),
        }
    }
}

impl Serialize for Altitude {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Altitude::Ground => serializer.serialize_str("ground"),
            Altitude::Feet(ft) => serializer.serialize_i32(*ft),
        }
    }
}

impl<'de> Deserialize<'de> for Altitude {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AltitudeVisitor;

        impl Visitor<'_> for AltitudeVisitor {
            type Value = Altitude;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an altitude in feet or \"ground\"")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Altitude, E> {
                i32::try_from(v)
                    .map(Altitude::Feet)
                    .map_err(|_| E::custom(format!("altitude out of range: {}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Altitude, E> {
                i32::try_from(v)
                    .map(Altitude::Feet)
                    .map_err(|_| E::custom(format!("altitude out of range: {}", v)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Altitude, E> {
                if v.is_finite() && v.abs() < i32::MAX as f64 {
                    Ok(Altitude::Feet(v.round() as i32))
                } else {
                    Err(E::custom(format!("altitude out of range: {}", v)))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Altitude, E> {
                if v.eq_ignore_ascii_case("ground") {
                    Ok(Altitude::Ground)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(AltitudeVisitor)
    }
}

// ============================================================================
// POSITION REPORTS
// ============================================================================

/// Normalized aircraft position report, one per feed line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    /// Report timestamp in epoch seconds
    pub now: i64,
    /// ICAO hex code identifying the aircraft
    pub hex: String,
    pub alt_baro: Altitude,
    /// Ground speed in knots
    #[serde(alias = "gscp", default)]
    pub gs: f64,
    pub lat: f64,
    pub lon: f64,
    /// Track over ground in degrees
    #[serde(default)]
    pub track: f64,
    /// Tail number or callsign, if the feed knows it
    #[serde(default)]
    pub flight: Option<String>,
}

impl PositionReport {
    pub fn new(now: i64, hex: impl Into<String>, lat: f64, lon: f64, alt_baro: Altitude) -> Self {
        Self {
            now,
            hex: hex.into(),
            alt_baro,
            gs: 0.0,
            lat,
            lon,
            track: 0.0,
            flight: None,
        }
    }

    pub fn with_flight(mut self, flight: impl Into<String>) -> Self {
        self.flight = Some(flight.into());
        self
    }

    pub fn with_velocity(mut self, gs: f64, track: f64) -> Self {
        self.gs = gs;
        self.track = track;
        self
    }

    /// Parse one JSON feed line
    pub fn from_json(line: &str) -> CoreResult<Self> {
        let report: PositionReport = serde_json::from_str(line)?;
        report.validate()?;
        Ok(report)
    }

    /// Reject reports that cannot be tracked
    pub fn validate(&self) -> CoreResult<()> {
        if self.hex.trim().is_empty() {
            return Err(CoreError::invalid_report("missing hex code"));
        }
        if self.now < 0 {
            return Err(CoreError::invalid_report(format!(
                "negative timestamp {} for {}",
                self.now, self.hex
            )));
        }
        if !GeoPosition::from_degrees(self.lat, self.lon).is_valid() {
            return Err(CoreError::invalid_position(self.lat, self.lon));
        }
        Ok(())
    }

    /// Trimmed callsign, `None` when absent or blank
    pub fn callsign(&self) -> Option<&str> {
        self.flight
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// ============================================================================
// FLIGHT STATE
// ============================================================================

/// Location snapshot taken from one report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub now: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: Altitude,
    pub gs: f64,
    pub track: f64,
}

impl Location {
    pub fn position(&self) -> GeoPosition {
        GeoPosition::new(self.lat, self.lon, self.alt.feet_or_zero() as f64)
    }

    pub fn is_airborne(&self) -> bool {
        !self.alt.is_ground()
    }
}

impl From<&PositionReport> for Location {
    fn from(report: &PositionReport) -> Self {
        Self {
            now: report.now,
            lat: report.lat,
            lon: report.lon,
            alt: report.alt_baro,
            gs: report.gs,
            track: report.track,
        }
    }
}

/// Air/ground state change produced by a single update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    #[default]
    None,
    Takeoff,
    Landing,
}

/// Tracked state for one aircraft, keyed by hex code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flight {
    pub hex: String,
    /// Tail number or callsign; the hex code until the feed supplies one
    pub flight_id: String,
    pub lastloc: Location,
    pub prevloc: Option<Location>,
    /// Regions containing `lastloc`
    pub regions: BTreeSet<String>,
    /// Regions containing `prevloc`
    pub prev_regions: Option<BTreeSet<String>>,
    /// Free-form tags set by rule actions (e.g. a local-flight marker)
    pub flags: BTreeSet<String>,
    /// Callback names to invoke when this flight expires
    pub expire_callbacks: BTreeSet<String>,
    pub first_seen: i64,
    pub report_count: u64,
}

impl Flight {
    pub fn new(report: &PositionReport, regions: BTreeSet<String>) -> Self {
        Self {
            hex: report.hex.clone(),
            flight_id: report
                .callsign()
                .map(str::to_string)
                .unwrap_or_else(|| report.hex.clone()),
            lastloc: Location::from(report),
            prevloc: None,
            regions,
            prev_regions: None,
            flags: BTreeSet::new(),
            expire_callbacks: BTreeSet::new(),
            first_seen: report.now,
            report_count: 1,
        }
    }

    /// Shift the current location into the previous slot and install the new one
    pub fn update(&mut self, report: &PositionReport, regions: BTreeSet<String>) -> Transition {
        let location = Location::from(report);
        let transition = match (self.lastloc.is_airborne(), location.is_airborne()) {
            (false, true) => Transition::Takeoff,
            (true, false) => Transition::Landing,
            _ => Transition::None,
        };

        if let Some(callsign) = report.callsign() {
            if callsign != self.flight_id {
                self.flight_id = callsign.to_string();
            }
        }

        self.prevloc = Some(self.lastloc);
        self.prev_regions = Some(std::mem::replace(&mut self.regions, regions));
        self.lastloc = location;
        self.report_count += 1;

        transition
    }

    pub fn last_seen(&self) -> i64 {
        self.lastloc.now
    }

    pub fn is_on_ground(&self) -> bool {
        self.lastloc.alt.is_ground()
    }

    /// No report within `max_age_secs` of `now`
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.lastloc.now > max_age_secs
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

impl fmt::Display for Flight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) at {:.4},{:.4} alt {}",
            self.flight_id, self.hex, self.lastloc.lat, self.lastloc.lon, self.lastloc.alt
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
