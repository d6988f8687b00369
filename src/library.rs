//! # Tour Library
//!
//! In-memory tour store for embedders without SQLite and for tests.
//!
//! Keeps every recorded track plus an inverted `GeoBucket → tours` index,
//! so candidate lookup is a union over the reference's buckets.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::buckets::{track_buckets, GeoBucket};
use crate::error::{GeoCompareError, OptionExt, Result};
use crate::retriever::{CandidateStore, TourFilter};
use crate::track::{RecordedTrack, TrackProvider};
use crate::TourId;

#[derive(Default)]
struct LibraryState {
    tracks: HashMap<TourId, Arc<RecordedTrack>>,
    /// Buckets touched by each tour, for removal
    tour_buckets: HashMap<TourId, BTreeSet<GeoBucket>>,
    bucket_index: HashMap<GeoBucket, HashSet<TourId>>,
}

impl LibraryState {
    fn unindex(&mut self, tour_id: TourId) {
        let Some(buckets) = self.tour_buckets.remove(&tour_id) else {
            return;
        };
        for bucket in buckets {
            if let Some(tours) = self.bucket_index.get_mut(&bucket) {
                tours.remove(&tour_id);
                if tours.is_empty() {
                    self.bucket_index.remove(&bucket);
                }
            }
        }
    }
}

/// Thread-safe in-memory store of recorded tours.
pub struct TourLibrary {
    bucket_resolution: u32,
    state: RwLock<LibraryState>,
}

impl TourLibrary {
    /// Create an empty library indexing tours at `bucket_resolution`
    /// cells per degree. Must match the engine's bucket resolution.
    pub fn new(bucket_resolution: u32) -> Self {
        Self {
            bucket_resolution: bucket_resolution.max(1),
            state: RwLock::new(LibraryState::default()),
        }
    }

    /// Add or replace a tour.
    pub fn insert(&self, track: RecordedTrack) -> Result<()> {
        track.validate()?;
        let tour_id = track.tour_id;
        let buckets = track_buckets(&track, self.bucket_resolution);

        let mut state = self.write()?;
        state.unindex(tour_id);
        for bucket in &buckets {
            state.bucket_index.entry(*bucket).or_default().insert(tour_id);
        }
        debug!(
            "[TourStore] Indexed tour {} ({} samples, {} buckets)",
            tour_id,
            track.len(),
            buckets.len()
        );
        state.tour_buckets.insert(tour_id, buckets);
        state.tracks.insert(tour_id, Arc::new(track));
        Ok(())
    }

    /// Remove a tour. Returns whether it existed.
    pub fn remove(&self, tour_id: TourId) -> Result<bool> {
        let mut state = self.write()?;
        state.unindex(tour_id);
        Ok(state.tracks.remove(&tour_id).is_some())
    }

    pub fn contains(&self, tour_id: TourId) -> bool {
        self.state
            .read()
            .map(|s| s.tracks.contains_key(&tour_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.tracks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tour_ids(&self) -> Vec<TourId> {
        let mut ids: Vec<TourId> = self
            .state
            .read()
            .map(|s| s.tracks.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, LibraryState>> {
        self.state
            .write()
            .map_err(|_| GeoCompareError::store("tour library lock poisoned"))
    }
}

impl TrackProvider for TourLibrary {
    fn load_track(&self, tour_id: TourId) -> Result<Arc<RecordedTrack>> {
        let state = self
            .state
            .read()
            .map_err(|_| GeoCompareError::store("tour library lock poisoned"))?;
        state.tracks.get(&tour_id).cloned().ok_or_track_not_found(tour_id)
    }
}

impl CandidateStore for TourLibrary {
    fn query_candidate_tour_ids(
        &self,
        buckets: &BTreeSet<GeoBucket>,
        filter: Option<&TourFilter>,
    ) -> Result<Vec<TourId>> {
        let state = self
            .state
            .read()
            .map_err(|_| GeoCompareError::store("tour library lock poisoned"))?;

        let mut hits: BTreeSet<TourId> = BTreeSet::new();
        for bucket in buckets {
            if let Some(tours) = state.bucket_index.get(bucket) {
                hits.extend(tours.iter().copied());
            }
        }

        Ok(hits
            .into_iter()
            .filter(|id| filter.map_or(true, |keep| keep(*id)))
            .collect())
    }

    fn bucket_resolution(&self) -> Option<u32> {
        Some(self.bucket_resolution)
    }
}
