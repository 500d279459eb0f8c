//! Named geofence regions loaded from KML
//!
//! Every `Placemark` carrying one or more `Polygon`s (directly or inside a
//! `MultiGeometry`) becomes part of the region named by the Placemark's
//! `<name>`. Placemarks sharing a name merge into one region. Points, lines
//! and other geometry are ignored.
//!
//! Resolution returns the full set of containing regions, ordered by name.
//! Callers that need a single answer use [`RegionResolver::smallest_region_containing`],
//! which picks the smallest-area region (ties broken by name).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::geo::{GeoPosition, Polygon, haversine_nm};

/// A named area made of one or more polygons
#[derive(Debug, Clone)]
pub struct Region {
    pub name: String,
    pub polygons: Vec<Polygon>,
    area_sq_nm: f64,
}

impl Region {
    fn new(name: String, polygons: Vec<Polygon>) -> Self {
        let area_sq_nm = polygons.iter().map(Polygon::area_sq_nm).sum();
        Self {
            name,
            polygons,
            area_sq_nm,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.polygons.iter().any(|p| p.contains(lat, lon))
    }

    pub fn area_sq_nm(&self) -> f64 {
        self.area_sq_nm
    }
}

/// Read-only region lookup, built once at startup
#[derive(Debug, Clone, Default)]
pub struct RegionResolver {
    /// Sorted by name
    regions: Vec<Region>,
}

impl RegionResolver {
    /// Resolver with no regions; every lookup yields an empty set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and merge every KML file
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> CoreResult<Self> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|error| CoreError::Io {
                path: path.to_path_buf(),
                error,
            })?;
            sources.push((path.display().to_string(), text));
        }

        let resolver = Self::from_sources(sources.iter().map(|(n, t)| (n.as_str(), t.as_str())))?;
        info!(
            files = paths.len(),
            regions = resolver.len(),
            "Loaded geofence regions"
        );
        Ok(resolver)
    }

    /// Build from a single in-memory KML document
    pub fn from_kml_str(source_name: &str, kml: &str) -> CoreResult<Self> {
        Self::from_sources([(source_name, kml)])
    }

    fn from_sources<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> CoreResult<Self> {
        let mut merged: BTreeMap<String, Vec<Polygon>> = BTreeMap::new();
        for (source_name, text) in sources {
            for (name, polygon) in parse_kml(source_name, text)? {
                merged.entry(name).or_default().push(polygon);
            }
        }

        Ok(Self {
            regions: merged
                .into_iter()
                .map(|(name, polygons)| Region::new(name, polygons))
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn has_region(&self, name: &str) -> bool {
        self.regions
            .binary_search_by(|r| r.name.as_str().cmp(name))
            .is_ok()
    }

    /// Names of all regions containing the point
    pub fn regions_containing(&self, lat: f64, lon: f64) -> BTreeSet<String> {
        self.regions
            .iter()
            .filter(|r| r.contains(lat, lon))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Smallest-area region containing the point
    pub fn smallest_region_containing(&self, lat: f64, lon: f64) -> Option<&Region> {
        self.regions
            .iter()
            .filter(|r| r.contains(lat, lon))
            .min_by(|a, b| {
                a.area_sq_nm
                    .total_cmp(&b.area_sq_nm)
                    .then_with(|| a.name.cmp(&b.name))
            })
    }

    /// Great-circle ring membership, boundary inclusive
    pub fn ring_contains(
        lat: f64,
        lon: f64,
        center_lat: f64,
        center_lon: f64,
        radius_nm: f64,
    ) -> bool {
        haversine_nm(lat, lon, center_lat, center_lon) <= radius_nm
    }
}

// ============================================================================
// KML PARSING
// ============================================================================

#[derive(Default)]
struct PlacemarkBuilder {
    name: Option<String>,
    polygons: Vec<Polygon>,
    outer: Option<Vec<GeoPosition>>,
    holes: Vec<Vec<GeoPosition>>,
    in_polygon: bool,
}

fn parse_kml(source_name: &str, text: &str) -> CoreResult<Vec<(String, Polygon)>> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let xml_err = |error| CoreError::Xml {
        source_name: source_name.to_string(),
        error,
    };

    let mut stack: Vec<String> = Vec::new();
    let mut text_buf = String::new();
    let mut placemark: Option<PlacemarkBuilder> = None;
    let mut found = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match tag.as_str() {
                    "Placemark" => placemark = Some(PlacemarkBuilder::default()),
                    "Polygon" => {
                        if let Some(pm) = placemark.as_mut() {
                            pm.in_polygon = true;
                            pm.outer = None;
                            pm.holes.clear();
                        }
                    }
                    _ => {}
                }
                text_buf.clear();
                stack.push(tag);
            }
            Event::Text(t) => text_buf.push_str(&t.unescape().map_err(xml_err)?),
            Event::CData(c) => text_buf.push_str(&String::from_utf8_lossy(&c)),
            Event::End(_) => {
                let Some(tag) = stack.pop() else {
                    return Err(CoreError::kml(source_name, "unbalanced closing tag"));
                };
                let parent = stack.last().map(String::as_str);

                if tag == "Placemark" {
                    if let Some(done) = placemark.take() {
                        finish_placemark(source_name, done, &mut found)?;
                    }
                } else if let Some(pm) = placemark.as_mut() {
                    match tag.as_str() {
                        "name" if parent == Some("Placemark") => {
                            pm.name = Some(text_buf.trim().to_string());
                        }
                        "coordinates" if pm.in_polygon => {
                            let ring = parse_coordinates(source_name, &text_buf)?;
                            if stack.iter().any(|t| t == "innerBoundaryIs") {
                                pm.holes.push(ring);
                            } else {
                                pm.outer = Some(ring);
                            }
                        }
                        "Polygon" => {
                            let outer = pm.outer.take().ok_or_else(|| {
                                CoreError::kml(source_name, "polygon without an outer boundary")
                            })?;
                            if outer.len() < 3 {
                                return Err(CoreError::kml(
                                    source_name,
                                    format!("polygon with only {} vertices", outer.len()),
                                ));
                            }
                            pm.polygons.push(Polygon::new(outer, std::mem::take(&mut pm.holes)));
                            pm.in_polygon = false;
                        }
                        _ => {}
                    }
                }
                text_buf.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(CoreError::kml(source_name, "unexpected end of document"));
    }

    debug!(source = source_name, polygons = found.len(), "Parsed KML");
    Ok(found)
}

fn finish_placemark(
    source_name: &str,
    placemark: PlacemarkBuilder,
    found: &mut Vec<(String, Polygon)>,
) -> CoreResult<()> {
    if placemark.polygons.is_empty() {
        return Ok(());
    }

    let name = placemark
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CoreError::kml(source_name, "polygon placemark without a name"))?;

    found.extend(placemark.polygons.into_iter().map(|p| (name.clone(), p)));
    Ok(())
}

/// Parse a KML `lon,lat[,alt]` tuple list
fn parse_coordinates(source_name: &str, text: &str) -> CoreResult<Vec<GeoPosition>> {
    text.split_whitespace()
        .map(|tuple| {
            let mut parts = tuple.split(',').map(str::parse::<f64>);
            match (parts.next(), parts.next()) {
                (Some(Ok(lon)), Some(Ok(lat))) => {
                    let position = GeoPosition::from_degrees(lat, lon);
                    if position.is_valid() {
                        Ok(position)
                    } else {
                        Err(CoreError::kml(
                            source_name,
                            format!("coordinate out of range: {}", tuple),
                        ))
                    }
                }
                _ => Err(CoreError::kml(
                    source_name,
                    format!("bad coordinate tuple: {}", tuple),
                )),
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
