//! Geographic types and calculations for aircraft positioning

use serde::{Deserialize, Serialize};

/// Earth's radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometers per nautical mile
pub const KM_PER_NM: f64 = 1.852;

/// Great-circle distance between two lat/lon points in nautical miles (haversine)
pub fn haversine_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * c / KM_PER_NM
}

/// Geographic position with latitude, longitude, and altitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Latitude in degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    pub longitude: f64,
    /// Altitude in feet
    pub altitude: f64,
}

impl Default for GeoPosition {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
        }
    }
}

impl GeoPosition {
    /// Create a new geographic position
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// Create position from degrees
    pub fn from_degrees(lat_deg: f64, lon_deg: f64) -> Self {
        Self::new(lat_deg, lon_deg, 0.0)
    }

    /// Check if this position is valid
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Great-circle distance to another position in nautical miles
    pub fn distance_nm(&self, other: &GeoPosition) -> f64 {
        haversine_nm(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// Calculate a new position given distance and bearing
    /// Distance in nautical miles, bearing in degrees
    pub fn destination_nm(&self, distance_nm: f64, bearing_deg: f64) -> GeoPosition {
        let lat1 = self.latitude.to_radians();
        let lon1 = self.longitude.to_radians();
        let bearing = bearing_deg.to_radians();
        let angular_distance = distance_nm * KM_PER_NM / EARTH_RADIUS_KM;

        let lat2 = (lat1.sin() * angular_distance.cos()
            + lat1.cos() * angular_distance.sin() * bearing.cos())
        .asin();

        let lon2 = lon1
            + (bearing.sin() * angular_distance.sin() * lat1.cos())
                .atan2(angular_distance.cos() - lat1.sin() * lat2.sin());

        GeoPosition::new(lat2.to_degrees(), lon2.to_degrees(), self.altitude)
    }

    /// Interpolate between two positions
    /// fraction: 0.0 = self, 1.0 = other
    pub fn interpolate(&self, other: &GeoPosition, fraction: f64) -> GeoPosition {
        let fraction = fraction.clamp(0.0, 1.0);

        GeoPosition::new(
            self.latitude + (other.latitude - self.latitude) * fraction,
            self.longitude + (other.longitude - self.longitude) * fraction,
            self.altitude + (other.altitude - self.altitude) * fraction,
        )
    }
}

/// Geographic bounding box used to prefilter polygon tests
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Smallest bounds enclosing every vertex
    pub fn from_vertices(vertices: &[GeoPosition]) -> Self {
        let min_lat = vertices.iter().map(|v| v.latitude).fold(f64::MAX, f64::min);
        let max_lat = vertices.iter().map(|v| v.latitude).fold(f64::MIN, f64::max);
        let min_lon = vertices.iter().map(|v| v.longitude).fold(f64::MAX, f64::min);
        let max_lon = vertices.iter().map(|v| v.longitude).fold(f64::MIN, f64::max);

        GeoBounds::new(min_lat, max_lat, min_lon, max_lon)
    }

    /// Check if a point is within these bounds
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Polygon with an outer boundary and optional holes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Polygon {
    outer: Vec<GeoPosition>,
    holes: Vec<Vec<GeoPosition>>,
    bounds: GeoBounds,
}

impl Polygon {
    pub fn new(outer: Vec<GeoPosition>, holes: Vec<Vec<GeoPosition>>) -> Self {
        let bounds = GeoBounds::from_vertices(&outer);
        Self {
            outer,
            holes,
            bounds,
        }
    }

    pub fn bounds(&self) -> GeoBounds {
        self.bounds
    }

    pub fn outer(&self) -> &[GeoPosition] {
        &self.outer
    }

    pub fn holes(&self) -> &[Vec<GeoPosition>] {
        &self.holes
    }

    /// Inside the outer ring and outside every hole
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if self.outer.len() < 3 || !self.bounds.contains(lat, lon) {
            return false;
        }

        ring_contains(&self.outer, lat, lon)
            && !self.holes.iter().any(|hole| ring_contains(hole, lat, lon))
    }

    /// Approximate area in square nautical miles (shoelace on a local
    /// equirectangular projection, holes subtracted)
    pub fn area_sq_nm(&self) -> f64 {
        let mid_lat = ((self.bounds.min_lat + self.bounds.max_lat) / 2.0).to_radians();
        let outer = ring_area_sq_nm(&self.outer, mid_lat);
        let holes: f64 = self.holes.iter().map(|h| ring_area_sq_nm(h, mid_lat)).sum();
        (outer - holes).max(0.0)
    }
}

/// Ray casting point-in-ring test
fn ring_contains(ring: &[GeoPosition], lat: f64, lon: f64) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let n = ring.len();
    let mut j = n - 1;

    for i in 0..n {
        let vi = &ring[i];
        let vj = &ring[j];

        if ((vi.longitude > lon) != (vj.longitude > lon))
            && (lat
                < (vj.latitude - vi.latitude) * (lon - vi.longitude)
                    / (vj.longitude - vi.longitude)
                    + vi.latitude)
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

fn ring_area_sq_nm(ring: &[GeoPosition], mid_lat_rad: f64) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }

    // 60 nm per degree of latitude
    let scale_x = 60.0 * mid_lat_rad.cos();
    let scale_y = 60.0;
    let n = ring.len();
    let twice_area: f64 = (0..n)
        .map(|i| {
            let a = &ring[i];
            let b = &ring[(i + 1) % n];
            (a.longitude * scale_x) * (b.latitude * scale_y)
                - (b.longitude * scale_x) * (a.latitude * scale_y)
        })
        .sum();

    twice_area.abs() / 2.0
}

// ============================================================================
// TESTS
// ============================================================================
