//! Unified error handling for the geo-compare library.
//!
//! Only configuration errors reach callers of the controller directly.
//! Store and per-candidate failures are logged and absorbed by the worker
//! that hit them, so one bad tour never aborts a comparison run.

use thiserror::Error;

use crate::TourId;

/// Unified error type for geo-compare operations.
#[derive(Debug, Clone, Error)]
pub enum GeoCompareError {
    /// Rejected comparison parameters or engine configuration
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// No recorded track exists for the tour
    #[error("Tour {tour_id} has no recorded track")]
    TrackNotFound { tour_id: TourId },

    /// Track data is present but unusable (mismatched series, bad range)
    #[error("Tour {tour_id} has an invalid track: {message}")]
    InvalidTrack { tour_id: TourId, message: String },

    /// Candidate store query or write failed
    #[error("Store error: {message}")]
    StoreError { message: String },

    /// A background worker has shut down and can no longer accept work
    #[error("Worker unavailable: {message}")]
    WorkerUnavailable { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GeoCompareError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        GeoCompareError::ConfigError {
            message: message.into(),
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        GeoCompareError::StoreError {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_track(tour_id: TourId, message: impl Into<String>) -> Self {
        GeoCompareError::InvalidTrack {
            tour_id,
            message: message.into(),
        }
    }
}

/// Result type alias for geo-compare operations.
pub type Result<T> = std::result::Result<T, GeoCompareError>;

/// Extension trait for converting Option to GeoCompareError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a track-not-found error.
    fn ok_or_track_not_found(self, tour_id: TourId) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_track_not_found(self, tour_id: TourId) -> Result<T> {
        self.ok_or(GeoCompareError::TrackNotFound { tour_id })
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for GeoCompareError {
    fn from(err: rusqlite::Error) -> Self {
        GeoCompareError::store(err.to_string())
    }
}
