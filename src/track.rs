//! Raw recorded tracks and the track-access contract.
//!
//! A [`RecordedTrack`] holds the raw per-sample series of one tour. The
//! comparison engine never stores tracks itself; it asks a
//! [`TrackProvider`] to load them, normalize sample ranges and compute
//! metrics over matched ranges.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GeoCompareError, Result};
use crate::normalize::{normalize_track, NormalizedSegment};
use crate::{GpsPoint, TourId};

/// Raw samples of one recorded tour.
///
/// `latitudes` and `longitudes` are required and must have equal length.
/// The optional series, when present, must match that length too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTrack {
    pub tour_id: TourId,
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
    /// Elapsed seconds since tour start
    #[serde(default)]
    pub times: Option<Vec<f64>>,
    /// Cumulative distance in meters
    #[serde(default)]
    pub distances: Option<Vec<f64>>,
    /// Heart rate in bpm, 0 where the sensor had no reading
    #[serde(default)]
    pub heart_rates: Option<Vec<f32>>,
}

impl RecordedTrack {
    /// Create a track with only geo samples.
    pub fn new(tour_id: TourId, points: &[GpsPoint]) -> Self {
        Self {
            tour_id,
            latitudes: points.iter().map(|p| p.latitude).collect(),
            longitudes: points.iter().map(|p| p.longitude).collect(),
            times: None,
            distances: None,
            heart_rates: None,
        }
    }

    pub fn with_times(mut self, times: Vec<f64>) -> Self {
        self.times = Some(times);
        self
    }

    pub fn with_distances(mut self, distances: Vec<f64>) -> Self {
        self.distances = Some(distances);
        self
    }

    pub fn with_heart_rates(mut self, heart_rates: Vec<f32>) -> Self {
        self.heart_rates = Some(heart_rates);
        self
    }

    /// Number of raw samples.
    pub fn len(&self) -> usize {
        self.latitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latitudes.is_empty()
    }

    pub fn point(&self, index: usize) -> Option<GpsPoint> {
        Some(GpsPoint::new(
            *self.latitudes.get(index)?,
            *self.longitudes.get(index)?,
        ))
    }

    /// Check that all present series have the same length.
    pub fn validate(&self) -> Result<()> {
        let len = self.latitudes.len();
        if self.longitudes.len() != len {
            return Err(GeoCompareError::invalid_track(
                self.tour_id,
                format!(
                    "{} latitudes but {} longitudes",
                    len,
                    self.longitudes.len()
                ),
            ));
        }
        let optional = [
            ("times", self.times.as_ref().map(Vec::len)),
            ("distances", self.distances.as_ref().map(Vec::len)),
            ("heart_rates", self.heart_rates.as_ref().map(Vec::len)),
        ];
        for (name, series_len) in optional {
            if let Some(series_len) = series_len {
                if series_len != len {
                    return Err(GeoCompareError::invalid_track(
                        self.tour_id,
                        format!("{} has {} samples, expected {}", name, series_len, len),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Average heart rate over the inclusive raw range, ignoring zero samples.
    ///
    /// Returns 0.0 when the track has no heart rate series or the range holds
    /// no valid reading.
    pub fn average_heart_rate(&self, first_index: usize, last_index: usize) -> f32 {
        let Some(hr) = self.heart_rates.as_deref() else {
            return 0.0;
        };
        let Some(range) = inclusive_range(hr.len(), first_index, last_index) else {
            return 0.0;
        };

        let (sum, count) = hr[range]
            .iter()
            .filter(|v| **v > 0.0)
            .fold((0.0f64, 0u32), |(sum, count), v| (sum + *v as f64, count + 1));

        if count == 0 {
            0.0
        } else {
            (sum / count as f64) as f32
        }
    }

    /// Average speed in m/s over the inclusive raw range.
    ///
    /// Distance comes from the cumulative distance series when recorded,
    /// otherwise from haversine spacing of the samples. Returns 0.0 without
    /// a time series or when no time elapsed.
    pub fn average_speed(&self, first_index: usize, last_index: usize) -> f32 {
        let Some(times) = self.times.as_deref() else {
            return 0.0;
        };
        if inclusive_range(times.len(), first_index, last_index).is_none() {
            return 0.0;
        }

        let elapsed = times[last_index] - times[first_index];
        if elapsed <= 0.0 {
            return 0.0;
        }

        let distance = match self.distances.as_deref() {
            Some(distances) => distances[last_index] - distances[first_index],
            None => (first_index..last_index)
                .filter_map(|i| Some(self.point(i)?.distance_to(&self.point(i + 1)?)))
                .sum(),
        };

        (distance / elapsed) as f32
    }
}

fn inclusive_range(
    len: usize,
    first_index: usize,
    last_index: usize,
) -> Option<std::ops::RangeInclusive<usize>> {
    if first_index > last_index || last_index >= len {
        None
    } else {
        Some(first_index..=last_index)
    }
}

/// Access to recorded tracks, owned by the track-storage layer.
///
/// Only [`load_track`](TrackProvider::load_track) is required. The other
/// operations default to the crate's own deterministic implementations and
/// may be overridden by stores that keep precomputed data.
pub trait TrackProvider: Send + Sync {
    /// Load the raw track of a tour.
    fn load_track(&self, tour_id: TourId) -> Result<Arc<RecordedTrack>>;

    /// Resample and quantize the raw range `[first_index, last_index)`.
    ///
    /// Used for the reference segment and for every candidate, so any
    /// override must stay deterministic.
    fn normalize(
        &self,
        track: &RecordedTrack,
        first_index: usize,
        last_index: usize,
        geo_accuracy: i64,
        distance_interval: i64,
    ) -> Result<NormalizedSegment> {
        normalize_track(
            track,
            first_index,
            last_index,
            geo_accuracy,
            distance_interval,
        )
    }

    fn average_heart_rate(&self, track: &RecordedTrack, first_index: usize, last_index: usize) -> f32 {
        track.average_heart_rate(first_index, last_index)
    }

    fn average_speed(&self, track: &RecordedTrack, first_index: usize, last_index: usize) -> f32 {
        track.average_speed(first_index, last_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_track() -> RecordedTrack {
        let points: Vec<GpsPoint> = (0..5)
            .map(|i| GpsPoint::new(47.0 + i as f64 * 0.001, 8.0))
            .collect();
        RecordedTrack::new(1, &points)
            .with_times(vec![0.0, 10.0, 20.0, 30.0, 40.0])
            .with_distances(vec![0.0, 100.0, 200.0, 300.0, 400.0])
            .with_heart_rates(vec![120.0, 0.0, 130.0, 140.0, 150.0])
    }

    #[test]
    fn test_validate_mismatched_series() {
        let mut track = straight_track();
        assert!(track.validate().is_ok());

        track.heart_rates = Some(vec![1.0]);
        assert!(matches!(
            track.validate(),
            Err(GeoCompareError::InvalidTrack { tour_id: 1, .. })
        ));

        track.heart_rates = None;
        track.longitudes.pop();
        assert!(track.validate().is_err());
    }

    #[test]
    fn test_average_heart_rate_skips_zero_samples() {
        let track = straight_track();
        // 120 and 130, the zero in between is ignored
        assert_eq!(track.average_heart_rate(0, 2), 125.0);
        assert_eq!(track.average_heart_rate(1, 1), 0.0);
        assert_eq!(track.average_heart_rate(3, 10), 0.0);
    }

    #[test]
    fn test_average_speed_from_distance_series() {
        let track = straight_track();
        assert!((track.average_speed(0, 4) - 10.0).abs() < 1e-6);
        assert_eq!(track.average_speed(2, 2), 0.0);
    }

    #[test]
    fn test_average_speed_from_haversine() {
        let mut track = straight_track();
        track.distances = None;
        // 0.001 degrees of latitude is roughly 111 m
        let speed = track.average_speed(0, 1);
        assert!(speed > 10.5 && speed < 11.5, "speed was {}", speed);
    }

    #[test]
    fn test_average_speed_without_times() {
        let mut track = straight_track();
        track.times = None;
        assert_eq!(track.average_speed(0, 4), 0.0);
    }
}
