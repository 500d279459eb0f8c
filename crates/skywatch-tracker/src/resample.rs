//! Resampling of archival tracks onto a common clock grid
//!
//! Archival feeds report each aircraft at its own irregular cadence. The
//! [`Resampler`] keeps every recorded position per hex and, on demand,
//! interpolates all tracks onto ticks `start + k * interval` so pairwise
//! checks compare aircraft at the same instant.

use std::ops::Range;
use std::sync::Arc;

use dashmap::DashMap;
use skywatch_core::{Altitude, Flight, Location, PositionReport, RegionResolver};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct RawTrack {
    flight_id: Option<String>,
    locations: Vec<Location>,
}

pub struct Resampler {
    tracks: DashMap<String, RawTrack>,
    interval_secs: i64,
    max_gap_secs: i64,
}

impl Resampler {
    pub fn new(interval_secs: i64, max_gap_secs: i64) -> Self {
        Self {
            tracks: DashMap::new(),
            interval_secs: interval_secs.max(1),
            max_gap_secs,
        }
    }

    pub fn record(&self, report: &PositionReport) {
        let mut track = self.tracks.entry(report.hex.clone()).or_default();
        if let Some(callsign) = report.callsign() {
            track.flight_id = Some(callsign.to_string());
        }
        track.locations.push(Location::from(report));
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn aircraft_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn sample_count(&self) -> usize {
        self.tracks.iter().map(|t| t.locations.len()).sum()
    }

    pub fn clear(&self) {
        self.tracks.clear();
    }

    /// Interpolate every recorded track onto the shared grid
    pub fn resample(&self, resolver: Arc<RegionResolver>) -> Option<Timeline> {
        let start = self
            .tracks
            .iter()
            .filter_map(|t| t.locations.iter().map(|l| l.now).min())
            .min()?;
        let end = self
            .tracks
            .iter()
            .filter_map(|t| t.locations.iter().map(|l| l.now).max())
            .max()?;

        let (interval, max_gap) = (self.interval_secs, self.max_gap_secs);
        let mut tracks: Vec<ResampledTrack> = self
            .tracks
            .iter()
            .filter_map(|entry| {
                resample_track(entry.key(), entry.value(), start, interval, max_gap)
            })
            .collect();
        tracks.sort_by(|a, b| a.hex.cmp(&b.hex));
        let covered = covered_ranges(&tracks);

        debug!(
            start,
            end,
            interval = self.interval_secs,
            tracks = tracks.len(),
            ticks = covered.iter().map(|range| range.len()).sum::<usize>(),
            "Resampled timeline built"
        );

        Some(Timeline {
            start,
            end,
            interval_secs: self.interval_secs,
            tracks,
            covered,
            resolver,
        })
    }
}

// ============================================================================
// TIMELINE
// ============================================================================

/// Consecutive samples; `samples[k]` is tick `first_tick + k`
#[derive(Debug, Clone)]
pub struct Segment {
    pub first_tick: usize,
    pub samples: Vec<Location>,
}

impl Segment {
    /// One past the last covered tick
    pub fn end_tick(&self) -> usize {
        self.first_tick + self.samples.len()
    }
}

/// One aircraft's samples, split wherever reports are too far apart to interpolate
#[derive(Debug, Clone)]
pub struct ResampledTrack {
    pub hex: String,
    pub flight_id: String,
    pub segments: Vec<Segment>,
}

impl ResampledTrack {
    pub fn at(&self, tick_index: usize) -> Option<&Location> {
        let after = self.segments.partition_point(|seg| seg.first_tick <= tick_index);
        let segment = self.segments.get(after.checked_sub(1)?)?;
        segment.samples.get(tick_index - segment.first_tick)
    }

    pub fn first_tick(&self) -> Option<usize> {
        self.segments.first().map(|seg| seg.first_tick)
    }

    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(|seg| seg.samples.len()).sum()
    }
}

pub struct Timeline {
    start: i64,
    end: i64,
    interval_secs: i64,
    tracks: Vec<ResampledTrack>,
    /// Tick index ranges where at least one track has a sample, sorted and disjoint
    covered: Vec<Range<usize>>,
    resolver: Arc<RegionResolver>,
}

impl Timeline {
    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn interval_secs(&self) -> i64 {
        self.interval_secs
    }

    pub fn tracks(&self) -> &[ResampledTrack] {
        &self.tracks
    }

    /// Number of ticks with at least one sample
    pub fn tick_count(&self) -> usize {
        self.covered.iter().map(|range| range.len()).sum()
    }

    /// Covered ticks in order; gaps where no track has a sample are skipped
    pub fn ticks(&self) -> impl Iterator<Item = i64> + '_ {
        self.covered
            .iter()
            .flat_map(|range| range.clone())
            .map(move |i| self.start + i as i64 * self.interval_secs)
    }

    /// Flights as they stood at `tick`, with region membership resolved
    pub fn flights_at(&self, tick: i64) -> Vec<Flight> {
        if tick < self.start || (tick - self.start) % self.interval_secs != 0 {
            return Vec::new();
        }
        let index = ((tick - self.start) / self.interval_secs) as usize;

        self.tracks
            .iter()
            .filter_map(|track| {
                let loc = track.at(index)?;
                let report =
                    PositionReport::new(loc.now, track.hex.clone(), loc.lat, loc.lon, loc.alt)
                        .with_velocity(loc.gs, loc.track);
                let regions = self.resolver.regions_containing(loc.lat, loc.lon);
                let mut flight = Flight::new(&report, regions);
                flight.flight_id = track.flight_id.clone();
                Some(flight)
            })
            .collect()
    }
}

fn covered_ranges(tracks: &[ResampledTrack]) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = tracks
        .iter()
        .flat_map(|track| track.segments.iter().map(|seg| seg.first_tick..seg.end_tick()))
        .collect();
    ranges.sort_by_key(|range| range.start);

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

fn resample_track(
    hex: &str,
    raw: &RawTrack,
    start: i64,
    interval: i64,
    max_gap: i64,
) -> Option<ResampledTrack> {
    let mut locs = raw.locations.clone();
    locs.sort_by_key(|l| l.now);
    locs.dedup_by_key(|l| l.now);
    if locs.is_empty() {
        return None;
    }

    // grid index of the first tick at or after `now`
    let tick_at_or_after = |now: i64| ((now - start + interval - 1) / interval) as usize;
    let mut segments: Vec<Segment> = Vec::new();

    for (idx, lo) in locs.iter().enumerate() {
        let hi = locs.get(idx + 1).filter(|hi| hi.now - lo.now <= max_gap);
        // an unbridged report only covers the tick it falls on
        let until = hi.map_or(lo.now + 1, |hi| hi.now);

        let mut index = tick_at_or_after(lo.now);
        let mut tick = start + index as i64 * interval;
        while tick < until {
            let sample = match hi {
                Some(hi) if tick != lo.now => interpolate(lo, hi, tick),
                _ => Location { now: tick, ..*lo },
            };
            match segments.last_mut() {
                Some(seg) if seg.end_tick() == index => seg.samples.push(sample),
                _ => segments.push(Segment {
                    first_tick: index,
                    samples: vec![sample],
                }),
            }
            index += 1;
            tick += interval;
        }
    }

    Some(ResampledTrack {
        hex: hex.to_string(),
        flight_id: raw.flight_id.clone().unwrap_or_else(|| hex.to_string()),
        segments,
    })
}

fn interpolate(lo: &Location, hi: &Location, tick: i64) -> Location {
    let fraction = (tick - lo.now) as f64 / (hi.now - lo.now) as f64;
    let position = lo.position().interpolate(&hi.position(), fraction);
    let nearer = if fraction <= 0.5 { lo } else { hi };

    let alt = match (lo.alt, hi.alt) {
        (Altitude::Feet(a), Altitude::Feet(b)) => {
            Altitude::Feet((a as f64 + (b - a) as f64 * fraction).round() as i32)
        }
        _ => nearer.alt,
    };

    Location {
        now: tick,
        lat: position.latitude,
        lon: position.longitude,
        alt,
        gs: lo.gs + (hi.gs - lo.gs) * fraction,
        track: nearer.track,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(now: i64, hex: &str, lat: f64, alt: Altitude) -> PositionReport {
        PositionReport::new(now, hex, lat, -105.0, alt)
    }

    fn timeline(resampler: &Resampler) -> Timeline {
        resampler.resample(Arc::new(RegionResolver::empty())).unwrap()
    }

    #[test]
    fn test_empty_resampler_has_no_timeline() {
        let resampler = Resampler::new(1, 60);
        assert!(resampler.is_empty());
        assert!(resampler.resample(Arc::new(RegionResolver::empty())).is_none());
    }

    #[test]
    fn test_linear_interpolation() {
        let resampler = Resampler::new(1, 60);
        resampler.record(&report(10, "aaa", 40.0, Altitude::Feet(1000)));
        resampler.record(&report(0, "aaa", 39.9, Altitude::Feet(0)));
        assert_eq!(resampler.sample_count(), 2);

        let timeline = timeline(&resampler);
        assert_eq!(timeline.tick_count(), 11);

        let mid = &timeline.flights_at(5)[0];
        assert!((mid.lastloc.lat - 39.95).abs() < 1e-9);
        assert_eq!(mid.lastloc.alt, Altitude::Feet(500));
        assert_eq!(mid.lastloc.now, 5);
    }

    #[test]
    fn test_ground_follows_nearer_sample() {
        let resampler = Resampler::new(1, 60);
        resampler.record(&report(0, "aaa", 40.0, Altitude::Ground));
        resampler.record(&report(10, "aaa", 40.0, Altitude::Feet(1000)));

        let timeline = timeline(&resampler);
        assert_eq!(timeline.flights_at(3)[0].lastloc.alt, Altitude::Ground);
        assert_eq!(timeline.flights_at(7)[0].lastloc.alt, Altitude::Feet(1000));
    }

    #[test]
    fn test_no_interpolation_across_long_gaps() {
        let resampler = Resampler::new(1, 60);
        resampler.record(&report(0, "aaa", 40.0, Altitude::Feet(1000)));
        resampler.record(&report(100, "aaa", 40.1, Altitude::Feet(1000)));

        let timeline = timeline(&resampler);
        assert_eq!(timeline.flights_at(0).len(), 1);
        assert!(timeline.flights_at(50).is_empty());
        assert_eq!(timeline.flights_at(100).len(), 1);
    }

    #[test]
    fn test_tracks_share_one_grid() {
        let resampler = Resampler::new(2, 60);
        resampler.record(&report(0, "aaa", 40.0, Altitude::Feet(1000)));
        resampler.record(&report(8, "aaa", 40.0, Altitude::Feet(1000)));
        resampler.record(&report(3, "bbb", 40.0, Altitude::Feet(1000)));
        resampler.record(&report(9, "bbb", 40.0, Altitude::Feet(1000)));

        let timeline = timeline(&resampler);
        let ticks: Vec<_> = timeline.ticks().collect();
        assert_eq!(ticks, vec![0, 2, 4, 6, 8]);

        let bbb = timeline.tracks().iter().find(|t| t.hex == "bbb").unwrap();
        assert_eq!(bbb.first_tick(), Some(2));
        assert_eq!(timeline.flights_at(2).len(), 1);
        assert_eq!(timeline.flights_at(4).len(), 2);
        assert!(timeline.flights_at(5).is_empty());
    }

    #[test]
    fn test_long_gap_allocates_only_reported_ticks() {
        let resampler = Resampler::new(1, 60);
        resampler.record(&report(0, "aaa", 40.0, Altitude::Feet(1000)));
        resampler.record(&report(10_000_000, "aaa", 40.1, Altitude::Feet(1000)));
        resampler.record(&report(10_000_000, "bbb", 40.1, Altitude::Feet(1200)));
        resampler.record(&report(10_000_004, "bbb", 40.1, Altitude::Feet(1200)));

        let timeline = timeline(&resampler);
        let aaa = &timeline.tracks()[0];
        assert_eq!(aaa.segments.len(), 2);
        assert_eq!(aaa.sample_count(), 2);
        assert_eq!(timeline.tracks()[1].sample_count(), 5);

        let ticks: Vec<_> = timeline.ticks().collect();
        assert_eq!(ticks, vec![0, 10_000_000, 10_000_001, 10_000_002, 10_000_003, 10_000_004]);
        assert_eq!(timeline.tick_count(), 6);
        assert_eq!(timeline.flights_at(10_000_000).len(), 2);
        assert!(timeline.flights_at(5_000_000).is_empty());
    }
}
