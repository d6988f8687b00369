//! Track normalization: evenly spaced, quantized coordinate sequences.
//!
//! Both the reference segment and every candidate track go through
//! [`normalize_track`] with the same accuracy and distance interval, so the
//! aligner compares like with like. The function is pure; identical inputs
//! always produce an identical sequence and index map.

use serde::{Deserialize, Serialize};

use crate::error::{GeoCompareError, Result};
use crate::track::RecordedTrack;

/// Resampled, quantized coordinates plus the reverse map into raw samples.
///
/// Invariant: `lat`, `lon` and `orig_index` have equal length and
/// `orig_index` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSegment {
    lat: Vec<i64>,
    lon: Vec<i64>,
    orig_index: Vec<usize>,
    geo_accuracy: i64,
    /// Meters covered by the resampled points
    normalized_distance: i64,
}

impl NormalizedSegment {
    /// Build a segment from already quantized parts, checking the invariant.
    pub fn from_parts(
        lat: Vec<i64>,
        lon: Vec<i64>,
        orig_index: Vec<usize>,
        geo_accuracy: i64,
    ) -> Result<Self> {
        if lat.len() != lon.len() || lat.len() != orig_index.len() {
            return Err(GeoCompareError::Internal {
                message: format!(
                    "normalized series length mismatch: lat {}, lon {}, index {}",
                    lat.len(),
                    lon.len(),
                    orig_index.len()
                ),
            });
        }
        if orig_index.windows(2).any(|w| w[0] >= w[1]) {
            return Err(GeoCompareError::Internal {
                message: "normalized index map is not strictly increasing".to_string(),
            });
        }
        if geo_accuracy <= 0 {
            return Err(GeoCompareError::config(format!(
                "geo accuracy must be positive, got {}",
                geo_accuracy
            )));
        }
        Ok(Self {
            lat,
            lon,
            orig_index,
            geo_accuracy,
            normalized_distance: 0,
        })
    }

    /// Build a segment from `(lat, lon)` pairs whose raw indices are `0..len`.
    pub fn from_pairs(pairs: &[(i64, i64)], geo_accuracy: i64) -> Result<Self> {
        Self::from_parts(
            pairs.iter().map(|p| p.0).collect(),
            pairs.iter().map(|p| p.1).collect(),
            (0..pairs.len()).collect(),
            geo_accuracy,
        )
    }

    pub fn empty(geo_accuracy: i64) -> Self {
        Self {
            lat: Vec::new(),
            lon: Vec::new(),
            orig_index: Vec::new(),
            geo_accuracy,
            normalized_distance: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty()
    }

    pub fn lat(&self) -> &[i64] {
        &self.lat
    }

    pub fn lon(&self) -> &[i64] {
        &self.lon
    }

    pub fn orig_index(&self) -> &[usize] {
        &self.orig_index
    }

    pub fn geo_accuracy(&self) -> i64 {
        self.geo_accuracy
    }

    pub fn normalized_distance(&self) -> i64 {
        self.normalized_distance
    }

    fn push(&mut self, lat: f64, lon: f64, index: usize) {
        self.lat.push(quantize(lat, self.geo_accuracy));
        self.lon.push(quantize(lon, self.geo_accuracy));
        self.orig_index.push(index);
    }
}

/// Map degrees to the integer grid by multiplication and truncation.
pub fn quantize(degrees: f64, geo_accuracy: i64) -> i64 {
    (degrees * geo_accuracy as f64) as i64
}

/// Resample the raw range `[first_index, last_index)` of a track.
///
/// The first usable sample of the range is always kept; after that a sample
/// is kept once the distance travelled since the last kept sample reaches
/// `distance_interval` meters. Samples whose coordinates are not finite or
/// out of range are skipped entirely, and spacing is measured from the last
/// usable sample. `last_index` is clamped to the track length and an empty
/// range yields an empty segment.
pub fn normalize_track(
    track: &RecordedTrack,
    first_index: usize,
    last_index: usize,
    geo_accuracy: i64,
    distance_interval: i64,
) -> Result<NormalizedSegment> {
    if geo_accuracy <= 0 {
        return Err(GeoCompareError::config(format!(
            "geo accuracy must be positive, got {}",
            geo_accuracy
        )));
    }
    if distance_interval <= 0 {
        return Err(GeoCompareError::config(format!(
            "distance interval must be positive, got {}",
            distance_interval
        )));
    }
    track.validate()?;

    let last_index = last_index.min(track.len());
    let mut segment = NormalizedSegment::empty(geo_accuracy);
    if first_index >= last_index {
        return Ok(segment);
    }

    let Some(start) = (first_index..last_index).find(|&i| is_usable(track, i)) else {
        return Ok(segment);
    };

    let interval = distance_interval as f64;
    let mut since_last_kept = 0.0;
    let mut total = 0.0;
    let mut previous = start;

    segment.push(track.latitudes[start], track.longitudes[start], start);

    for index in start + 1..last_index {
        if !is_usable(track, index) {
            continue;
        }
        since_last_kept += step_distance(track, previous, index);
        previous = index;

        if since_last_kept >= interval {
            segment.push(track.latitudes[index], track.longitudes[index], index);
            total += since_last_kept;
            since_last_kept = 0.0;
        }
    }

    segment.normalized_distance = total.round() as i64;
    Ok(segment)
}

fn is_usable(track: &RecordedTrack, index: usize) -> bool {
    track.point(index).map_or(false, |point| point.is_valid())
}

/// Meters between usable samples `from` and `to`.
///
/// Falls back to haversine when the distance series has a gap there.
fn step_distance(track: &RecordedTrack, from: usize, to: usize) -> f64 {
    if let Some(distances) = track.distances.as_deref() {
        let step = distances[to] - distances[from];
        if step.is_finite() {
            return step.max(0.0);
        }
    }
    match (track.point(from), track.point(to)) {
        (Some(a), Some(b)) => a.distance_to(&b),
        _ => 0.0,
    }
}
