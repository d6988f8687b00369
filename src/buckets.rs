//! Coarse geo buckets for candidate pre-filtering.
//!
//! A bucket is a cell of a regular lat/lon grid with `resolution` cells per
//! degree (100 → 0.01°, roughly 1.1 km north-south). Buckets are only used to
//! decide which tours are worth comparing; the numeric comparison always
//! works on the fine quantized coordinates.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::track::RecordedTrack;
use crate::GpsPoint;

/// Identifier of one coarse grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeoBucket(pub i64);

impl GeoBucket {
    /// Bucket containing the given coordinate.
    ///
    /// Latitude cells are counted from the south pole and longitude cells
    /// from the antimeridian so every id is non-negative.
    pub fn from_degrees(latitude: f64, longitude: f64, resolution: u32) -> Self {
        let res = resolution.max(1) as i64;
        let lon_cells = 360 * res + 1;

        let lat_cell = (((latitude + 90.0) * res as f64).floor() as i64).clamp(0, 180 * res);
        let lon_cell = (((longitude + 180.0) * res as f64).floor() as i64).clamp(0, 360 * res);

        GeoBucket(lat_cell * lon_cells + lon_cell)
    }

    pub fn id(&self) -> i64 {
        self.0
    }
}

/// Buckets touched by the raw samples `[first_index, last_index)` of a track.
///
/// Consecutive points are joined by a straight line which is walked in
/// half-cell steps, so cells crossed between two distant points are
/// included. Samples with invalid coordinates are skipped. `last_index` is
/// clamped to the track length; an empty range yields an empty set.
///
/// Any sub-range yields a subset of [`track_buckets`] for the same track.
pub fn compute_buckets(
    track: &RecordedTrack,
    first_index: usize,
    last_index: usize,
    resolution: u32,
) -> BTreeSet<GeoBucket> {
    let last_index = last_index.min(track.len());
    let first_index = first_index.min(last_index);
    path_buckets(
        (first_index..last_index)
            .filter_map(|index| track.point(index))
            .filter(GpsPoint::is_valid)
            .map(|point| (point.latitude, point.longitude)),
        resolution,
    )
}

/// Buckets touched by a whole recorded track, used when indexing stored tours.
pub fn track_buckets(track: &RecordedTrack, resolution: u32) -> BTreeSet<GeoBucket> {
    compute_buckets(track, 0, track.len(), resolution)
}

fn path_buckets(points: impl Iterator<Item = (f64, f64)>, resolution: u32) -> BTreeSet<GeoBucket> {
    let mut buckets = BTreeSet::new();
    let half_cell = 0.5 / resolution.max(1) as f64;
    let mut previous: Option<(f64, f64)> = None;

    for (lat, lon) in points {
        if let Some((prev_lat, prev_lon)) = previous {
            let span = (lat - prev_lat).abs().max((lon - prev_lon).abs());
            let steps = (span / half_cell).ceil() as usize;
            for step in 1..steps {
                let t = step as f64 / steps as f64;
                buckets.insert(GeoBucket::from_degrees(
                    prev_lat + (lat - prev_lat) * t,
                    prev_lon + (lon - prev_lon) * t,
                    resolution,
                ));
            }
        }
        buckets.insert(GeoBucket::from_degrees(lat, lon, resolution));
        previous = Some((lat, lon));
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn north_line(lat: f64, lon: f64, samples: usize) -> RecordedTrack {
        let points: Vec<GpsPoint> = (0..samples)
            .map(|i| GpsPoint::new(lat + i as f64 * 0.0005, lon))
            .collect();
        RecordedTrack::new(1, &points)
    }

    #[test]
    fn test_bucket_ids_are_stable() {
        let a = GeoBucket::from_degrees(47.0012, 8.0099, 100);
        let b = GeoBucket::from_degrees(47.0088, 8.0001, 100);
        assert_eq!(a, b);

        let c = GeoBucket::from_degrees(47.0112, 8.0001, 100);
        assert_ne!(a, c);
        assert!(GeoBucket::from_degrees(-90.0, -180.0, 100).id() >= 0);
    }

    #[test]
    fn test_empty_range_has_no_buckets() {
        let track = north_line(47.00023, 8.00537, 10);
        assert!(compute_buckets(&track, 4, 4, 100).is_empty());
        assert!(compute_buckets(&track, 20, 30, 100).is_empty());
        assert!(compute_buckets(&RecordedTrack::new(2, &[]), 0, 10, 100).is_empty());
    }

    #[test]
    fn test_path_between_distant_points_is_covered() {
        // Two points 0.055 degrees apart, straight north
        let track = RecordedTrack::new(
            1,
            &[GpsPoint::new(47.0001, 8.005), GpsPoint::new(47.0551, 8.005)],
        );
        // 47.000 .. 47.055 touches six 0.01 degree rows
        assert_eq!(compute_buckets(&track, 0, 2, 100).len(), 6);
    }

    #[test]
    fn test_range_buckets_are_subset_of_track_buckets() {
        let track = north_line(47.00023, 8.00537, 50);
        let whole = track_buckets(&track, 100);
        let part = compute_buckets(&track, 10, 30, 100);

        assert!(!part.is_empty());
        assert!(part.is_subset(&whole));
        assert!(part.len() < whole.len());
    }

    #[test]
    fn test_western_southern_range_matches_indexed_cells() {
        // Negative coordinates just past a cell boundary
        let track = north_line(-33.0052, -100.0052, 40);
        let slice: Vec<GpsPoint> = (10..30).filter_map(|i| track.point(i)).collect();
        let sliced = RecordedTrack::new(1, &slice);

        let part = compute_buckets(&track, 10, 30, 100);
        assert_eq!(part, track_buckets(&sliced, 100));
        assert!(part.contains(&GeoBucket::from_degrees(-33.0002, -100.0052, 100)));
        assert!(part.is_subset(&track_buckets(&track, 100)));
    }

    #[test]
    fn test_invalid_samples_are_ignored() {
        let mut points: Vec<GpsPoint> = (0..5)
            .map(|i| GpsPoint::new(47.00023 + i as f64 * 0.0005, 8.00537))
            .collect();
        points[2] = GpsPoint::new(f64::NAN, 8.00537);
        points.push(GpsPoint::new(47.0, 400.0));
        let track = RecordedTrack::new(1, &points);

        let expected = GeoBucket::from_degrees(47.00023, 8.00537, 100);
        assert_eq!(track_buckets(&track, 100), BTreeSet::from([expected]));
    }
}
