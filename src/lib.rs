//! # Geo Compare
//!
//! Partial GPS track matching for recorded tours.
//!
//! Given a selected sub-segment of one recorded tour (the reference
//! segment), find every other tour whose track contains a closely matching
//! path and rank the matches.
//!
//! This library provides:
//! - Deterministic resampling and quantization of raw tracks
//! - Coarse geo-bucket pre-filtering of candidate tours
//! - Exact sliding-window alignment on a bounded worker pool
//! - A debounced request controller with supersession and cooperative cancellation
//!
//! ## Features
//!
//! - **`persistence`** - SQLite store of tracks and geo parts
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use geo_compare::{align_segments, Alignment, CancellationToken, NormalizedSegment};
//!
//! let reference = NormalizedSegment::from_pairs(&[(0, 0), (1, 1), (2, 2)], 10_000).unwrap();
//! let candidate =
//!     NormalizedSegment::from_pairs(&[(5, 5), (0, 0), (1, 1), (2, 2), (9, 9)], 10_000).unwrap();
//!
//! let alignment = align_segments(&reference, &candidate, &CancellationToken::new());
//! assert_eq!(alignment, Alignment::Matched { offset: 1, diff: 0 });
//! ```

use std::time::Duration;

use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{GeoCompareError, OptionExt, Result};

// Raw tracks and the track-access contract
pub mod track;
pub use track::{RecordedTrack, TrackProvider};

// Resampling + quantization
pub mod normalize;
pub use normalize::{normalize_track, quantize, NormalizedSegment};

// Coarse spatial cells for candidate pre-filtering
pub mod buckets;
pub use buckets::{compute_buckets, track_buckets, GeoBucket};

// Sliding-window alignment
pub mod aligner;
pub use aligner::{align_segments, Alignment};

// Request lifecycle types
pub mod request;
pub use request::{
    CancellationToken, CompareRequest, CompareResult, MatchedRange, RequestState, RequestToken,
    Score,
};

// Events delivered to the UI boundary
pub mod events;
pub use events::{channel_callback, CompareEvent, EventCallback};

// Candidate retrieval worker
pub mod retriever;
pub use retriever::{retrieve_candidates, CandidateRetriever, CandidateStore, TourFilter};

// Bounded compare pool
pub mod scheduler;
pub use scheduler::{compare_candidate, compare_sequential, CompareScheduler};

// Single-consumer result aggregation
pub mod aggregator;
pub use aggregator::{
    rank_results, rank_results_by, relative_diff, CompareSummary, RankBy, ResultAggregator,
};

// Debounce + supersession, owns all workers
pub mod controller;
pub use controller::RequestController;

// In-memory tour store
pub mod library;
pub use library::TourLibrary;

// LRU cache for loaded candidate tracks
pub mod lru_cache;

// SQLite tour store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteTourStore;

/// Identifier of a recorded tour.
pub type TourId = i64;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use geo_compare::GpsPoint;
/// let point = GpsPoint::new(47.3769, 8.5417); // Zurich
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Haversine distance in meters.
    pub fn distance_to(&self, other: &GpsPoint) -> f64 {
        Haversine::distance(
            Point::new(self.longitude, self.latitude),
            Point::new(other.longitude, other.latitude),
        )
    }
}

/// The selected sub-range of the reference tour.
///
/// Indices address raw samples; the range is `[first_index, last_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceSelection {
    pub tour_id: TourId,
    pub first_index: usize,
    pub last_index: usize,
}

impl ReferenceSelection {
    /// Create a selection from two slider positions in either order.
    pub fn new(tour_id: TourId, left_index: usize, right_index: usize) -> Self {
        Self {
            tour_id,
            first_index: left_index.min(right_index),
            last_index: left_index.max(right_index),
        }
    }

    /// Number of raw samples selected.
    ///
    /// A hand-built selection with `first_index > last_index` counts as empty.
    pub fn len(&self) -> usize {
        self.last_index.saturating_sub(self.first_index)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Per-request comparison parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareParams {
    /// Quantization factor applied to degrees before comparison.
    /// Valid range 100..=100_000. Default: 10_000 (~11 m of latitude)
    pub geo_accuracy: i64,

    /// Resampling spacing in meters. Valid range 10..=1_000. Default: 100
    pub distance_interval: i64,

    /// Apply the installed tour filter to candidate retrieval.
    /// Default: true
    pub use_external_filter: bool,
}

impl CompareParams {
    pub const GEO_ACCURACY_RANGE: (i64, i64) = (100, 100_000);
    pub const DISTANCE_INTERVAL_RANGE: (i64, i64) = (10, 1_000);

    /// Reject parameters outside the supported ranges.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = Self::GEO_ACCURACY_RANGE;
        if self.geo_accuracy < min || self.geo_accuracy > max {
            return Err(GeoCompareError::config(format!(
                "geo accuracy {} outside [{}, {}]",
                self.geo_accuracy, min, max
            )));
        }
        let (min, max) = Self::DISTANCE_INTERVAL_RANGE;
        if self.distance_interval < min || self.distance_interval > max {
            return Err(GeoCompareError::config(format!(
                "distance interval {} m outside [{}, {}]",
                self.distance_interval, min, max
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GeoCompareError::config(format!("invalid compare params: {}", e)))
    }
}

impl Default for CompareParams {
    fn default() -> Self {
        Self {
            geo_accuracy: 10_000,
            distance_interval: 100,
            use_external_filter: true,
        }
    }
}

/// Engine-wide configuration, fixed when the controller is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before a selection turns into a request; later selections
    /// within the window replace it. Default: 500 ms
    pub debounce_ms: u64,

    /// Minimum spacing of `ResultUpdated` events. Default: 500 ms
    pub update_interval_ms: u64,

    /// Compare pool size, 0 for one worker per core. Default: 0
    pub worker_threads: usize,

    /// Geo bucket cells per degree. Must not exceed the geo accuracy of
    /// any request. Default: 100
    pub bucket_resolution: u32,

    /// Loaded candidate tracks kept in memory. Default: 200
    pub track_cache_size: usize,

    /// Capacity of the worker-to-aggregator channel. Default: 1024
    pub result_channel_capacity: usize,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_resolution == 0 {
            return Err(GeoCompareError::config("bucket resolution must be positive"));
        }
        if self.track_cache_size == 0 {
            return Err(GeoCompareError::config("track cache size must be positive"));
        }
        if self.result_channel_capacity == 0 {
            return Err(GeoCompareError::config(
                "result channel capacity must be positive",
            ));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GeoCompareError::config(format!("invalid engine config: {}", e)))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            update_interval_ms: 500,
            worker_threads: 0,
            bucket_resolution: 100,
            track_cache_size: 200,
            result_channel_capacity: 1024,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(47.3769, 8.5417).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_distance_to() {
        let a = GpsPoint::new(47.0, 8.0);
        let b = GpsPoint::new(47.001, 8.0);
        let d = a.distance_to(&b);
        // 0.001 degrees of latitude is roughly 111 m
        assert!(d > 110.0 && d < 112.0, "distance was {}", d);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn test_selection_orders_indices() {
        let selection = ReferenceSelection::new(3, 40, 10);
        assert_eq!(selection.first_index, 10);
        assert_eq!(selection.last_index, 40);
        assert_eq!(selection.len(), 30);
        assert!(ReferenceSelection::new(3, 5, 5).is_empty());
    }

    #[test]
    fn test_inverted_literal_selection_is_empty() {
        let selection = ReferenceSelection {
            tour_id: 3,
            first_index: 40,
            last_index: 10,
        };
        assert_eq!(selection.len(), 0);
        assert!(selection.is_empty());
    }

    #[test]
    fn test_params_validation() {
        assert!(CompareParams::default().validate().is_ok());

        let params = CompareParams {
            geo_accuracy: 0,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(GeoCompareError::ConfigError { .. })
        ));

        let params = CompareParams {
            distance_interval: 5_000,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = CompareParams {
            geo_accuracy: 100_000,
            distance_interval: 10,
            use_external_filter: false,
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_from_json_fills_defaults() {
        let params = CompareParams::from_json(r#"{"geo_accuracy": 1000}"#).unwrap();
        assert_eq!(params.geo_accuracy, 1000);
        assert_eq!(params.distance_interval, 100);
        assert!(params.use_external_filter);

        assert!(CompareParams::from_json("not json").is_err());
    }

    #[test]
    fn test_engine_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce(), Duration::from_millis(500));

        let config = EngineConfig::from_json(r#"{"debounce_ms": 20, "worker_threads": 2}"#).unwrap();
        assert_eq!(config.debounce_ms, 20);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.bucket_resolution, 100);

        let config = EngineConfig {
            bucket_resolution: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
