//! Proximity event types
//!
//! A proximity event summarises one encounter between two aircraft, from the
//! first qualifying observation until the encounter is retired.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Location, haversine_nm};

/// Horizontal and vertical separation between two aircraft
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Separation {
    pub distance_nm: f64,
    pub alt_sep_ft: i32,
}

impl Separation {
    /// Separation between two airborne locations, `None` if either is on the ground
    pub fn between(a: &Location, b: &Location) -> Option<Self> {
        let (alt_a, alt_b) = (a.alt.feet()?, b.alt.feet()?);
        Some(Self {
            distance_nm: haversine_nm(a.lat, a.lon, b.lat, b.lon),
            // saturates for altitudes at opposite ends of the range
            alt_sep_ft: i32::try_from(alt_a.abs_diff(alt_b)).unwrap_or(i32::MAX),
        })
    }

    pub fn within(&self, lat_sep_nm: f64, alt_sep_ft: i32) -> bool {
        self.distance_nm <= lat_sep_nm && self.alt_sep_ft <= alt_sep_ft
    }

    /// Ordering used to keep the closest observation of an encounter
    pub fn is_closer_than(&self, other: &Separation) -> bool {
        self.distance_nm < other.distance_nm
            || (self.distance_nm == other.distance_nm && self.alt_sep_ft < other.alt_sep_ft)
    }
}

/// How an encounter was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProximityMode {
    Live,
    Resampled,
}

/// Completed or retired encounter between two aircraft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub id: Uuid,
    /// Rule whose thresholds the pair satisfied
    pub rule: String,
    pub mode: ProximityMode,
    /// Hex codes, lexicographically ordered
    pub hexes: (String, String),
    pub flight_ids: (String, String),
    pub first_seen: i64,
    pub last_seen: i64,
    /// Closest observed separation
    pub min_separation: Separation,
    /// Midpoint between the two aircraft at closest approach
    pub closest_lat: f64,
    pub closest_lon: f64,
    pub closest_at: i64,
}

impl ProximityEvent {
    pub fn duration_secs(&self) -> i64 {
        self.last_seen - self.first_seen
    }

    pub fn involves(&self, hex: &str) -> bool {
        self.hexes.0 == hex || self.hexes.1 == hex
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Altitude;

    fn loc(lat: f64, lon: f64, alt: Altitude) -> Location {
        Location {
            now: 0,
            lat,
            lon,
            alt,
            gs: 0.0,
            track: 0.0,
        }
    }

    #[test]
    fn test_separation_between_airborne() {
        let a = loc(40.0, -105.0, Altitude::Feet(5000));
        let b = loc(40.0, -105.0, Altitude::Feet(5300));

        let sep = Separation::between(&a, &b).unwrap();
        assert!(sep.distance_nm < 1e-9);
        assert_eq!(sep.alt_sep_ft, 300);
        assert!(sep.within(0.5, 400));
        assert!(!sep.within(0.5, 200));
    }

    #[test]
    fn test_separation_saturates_extreme_altitudes() {
        let high = loc(40.0, -105.0, Altitude::Feet(i32::MAX));
        let low = loc(40.0, -105.0, Altitude::Feet(i32::MIN));

        let sep = Separation::between(&high, &low).unwrap();
        assert_eq!(sep.alt_sep_ft, i32::MAX);
        assert!(!sep.within(0.5, 400));
        assert_eq!(Separation::between(&low, &high).unwrap().alt_sep_ft, i32::MAX);
    }

    #[test]
    fn test_separation_ignores_ground() {
        let a = loc(40.0, -105.0, Altitude::Ground);
        let b = loc(40.0, -105.0, Altitude::Feet(5300));
        assert!(Separation::between(&a, &b).is_none());
    }

    #[test]
    fn test_closer_ordering() {
        let near = Separation { distance_nm: 0.1, alt_sep_ft: 300 };
        let far = Separation { distance_nm: 0.2, alt_sep_ft: 0 };
        assert!(near.is_closer_than(&far));
        assert!(!far.is_closer_than(&near));
    }
}
