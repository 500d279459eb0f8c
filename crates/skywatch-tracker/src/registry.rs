//! Flight registry
//!
//! One [`Flight`] per hex code in a `DashMap`. Shard locks serialize updates
//! to the same aircraft while updates to different aircraft proceed in
//! parallel. Callers get clones, never references into the map, so no lock
//! outlives a registry call.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use skywatch_core::{Flight, PositionReport, RegionResolver, Transition};
use tracing::debug;

/// Result of applying one report
#[derive(Debug, Clone)]
pub struct FlightUpdate {
    /// Flight state after the report
    pub flight: Flight,
    pub created: bool,
    pub transition: Transition,
}

pub struct FlightRegistry {
    flights: DashMap<String, Flight>,
    resolver: Arc<RegionResolver>,
}

impl FlightRegistry {
    pub fn new(resolver: Arc<RegionResolver>) -> Self {
        Self {
            flights: DashMap::new(),
            resolver,
        }
    }

    pub fn resolver(&self) -> &RegionResolver {
        &self.resolver
    }

    /// Create or advance the flight for `report.hex`
    pub fn update(&self, report: &PositionReport) -> FlightUpdate {
        let regions = self.resolver.regions_containing(report.lat, report.lon);

        match self.flights.entry(report.hex.clone()) {
            Entry::Occupied(mut entry) => {
                let transition = entry.get_mut().update(report, regions);
                FlightUpdate {
                    flight: entry.get().clone(),
                    created: false,
                    transition,
                }
            }
            Entry::Vacant(entry) => {
                let flight = Flight::new(report, regions);
                debug!(hex = %flight.hex, flight_id = %flight.flight_id, "New flight");
                entry.insert(flight.clone());
                FlightUpdate {
                    flight,
                    created: true,
                    transition: Transition::None,
                }
            }
        }
    }

    pub fn get(&self, hex: &str) -> Option<Flight> {
        self.flights.get(hex).map(|f| f.value().clone())
    }

    /// Mutate a flight in place under its shard lock
    pub fn with_flight_mut<R>(&self, hex: &str, f: impl FnOnce(&mut Flight) -> R) -> Option<R> {
        self.flights.get_mut(hex).map(|mut flight| f(flight.value_mut()))
    }

    /// Visit every flight; `f` must not call back into the registry
    pub fn for_each(&self, mut f: impl FnMut(&Flight)) {
        for entry in self.flights.iter() {
            f(entry.value());
        }
    }

    /// Remove and return flights with no report within `max_age` of `now`
    pub fn expire(&self, now: i64, max_age: i64) -> Vec<Flight> {
        let stale: Vec<String> = self
            .flights
            .iter()
            .filter(|entry| entry.is_stale(now, max_age))
            .map(|entry| entry.key().clone())
            .collect();

        // A report may have refreshed a flight since the scan
        stale
            .into_iter()
            .filter_map(|hex| {
                self.flights
                    .remove_if(&hex, |_, flight| flight.is_stale(now, max_age))
                    .map(|(_, flight)| flight)
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Flight> {
        self.flights.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::Altitude;

    const KML: &str = r#"<kml><Document><Placemark><name>Box</name><Polygon>
      <outerBoundaryIs><LinearRing><coordinates>
        -105.1,40.0 -105.0,40.0 -105.0,40.1 -105.1,40.1 -105.1,40.0
      </coordinates></LinearRing></outerBoundaryIs></Polygon></Placemark></Document></kml>"#;

    fn registry() -> FlightRegistry {
        let resolver = RegionResolver::from_kml_str("box.kml", KML).unwrap();
        FlightRegistry::new(Arc::new(resolver))
    }

    #[test]
    fn test_update_creates_then_advances() {
        let registry = registry();
        let first =
            registry.update(&PositionReport::new(0, "abc", 40.05, -105.05, Altitude::Ground));
        assert!(first.created);
        assert!(first.flight.regions.contains("Box"));
        assert!(first.flight.prev_regions.is_none());

        let second =
            registry.update(&PositionReport::new(5, "abc", 40.2, -105.05, Altitude::Feet(800)));
        assert!(!second.created);
        assert_eq!(second.transition, Transition::Takeoff);
        assert!(second.flight.regions.is_empty());
        assert_eq!(second.flight.prev_regions.as_ref().map(|r| r.len()), Some(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expire_removes_stale_only() {
        let registry = registry();
        registry.update(&PositionReport::new(0, "old", 40.0, -105.0, Altitude::Feet(1000)));
        registry.update(&PositionReport::new(250, "new", 40.0, -105.0, Altitude::Feet(1000)));

        let expired = registry.expire(301, 300);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].hex, "old");
        assert!(registry.get("old").is_none());
        assert!(registry.get("new").is_some());
    }

    #[test]
    fn test_with_flight_mut() {
        let registry = registry();
        registry.update(&PositionReport::new(0, "abc", 40.0, -105.0, Altitude::Feet(1000)));

        let added = registry.with_flight_mut("abc", |f| f.flags.insert("local".to_string()));
        assert_eq!(added, Some(true));
        assert!(registry.get("abc").unwrap().has_flag("local"));
        assert!(registry.with_flight_mut("zzz", |_| ()).is_none());
    }

    #[test]
    fn test_concurrent_updates_to_distinct_flights() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for t in 0..100 {
                        let hex = format!("hex{}", i);
                        let alt = Altitude::Feet(1000);
                        registry.update(&PositionReport::new(t, hex, 40.0, -105.0, alt));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get("hex2").unwrap().report_count, 100);
    }
}
