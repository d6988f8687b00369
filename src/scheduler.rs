//! # Compare Scheduler
//!
//! Fans out one comparison job per candidate tour onto a bounded rayon pool
//! (one thread per core by default). Each job carries its request, checks
//! the cancellation flag on pickup, loads and normalizes the candidate,
//! aligns it and sends the result to the aggregator.
//!
//! A failing or panicking job is logged and reported as skipped; it never
//! takes other jobs of the batch down with it. Canceled jobs report nothing.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::aggregator::AggregatorMsg;
use crate::aligner::{align_segments, Alignment};
use crate::error::{GeoCompareError, Result};
use crate::lru_cache::{CacheStats, LruCache};
use crate::request::{CompareRequest, CompareResult, MatchedRange, Score};
use crate::track::{RecordedTrack, TrackProvider};
use crate::TourId;

type TrackCache = Mutex<LruCache<TourId, Arc<RecordedTrack>>>;

/// Pool size for `worker_threads`, where 0 means one per available core.
pub fn resolve_worker_threads(worker_threads: usize) -> usize {
    if worker_threads > 0 {
        return worker_threads;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Owns the compare worker pool.
pub struct CompareScheduler {
    pool: ThreadPool,
    tracks: Arc<dyn TrackProvider>,
    cache: Arc<TrackCache>,
    results: SyncSender<AggregatorMsg>,
}

impl CompareScheduler {
    pub fn new(
        worker_threads: usize,
        track_cache_size: usize,
        tracks: Arc<dyn TrackProvider>,
        results: SyncSender<AggregatorMsg>,
    ) -> Result<Self> {
        let threads = resolve_worker_threads(worker_threads);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("geo-compare-{}", i))
            .build()
            .map_err(|e| GeoCompareError::WorkerUnavailable {
                message: format!("failed to build compare pool: {}", e),
            })?;

        info!("[Scheduler] Compare pool started with {} workers", threads);

        Ok(Self {
            pool,
            tracks,
            cache: Arc::new(Mutex::new(LruCache::new(track_cache_size))),
            results,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Enqueue one job per candidate of the request.
    pub fn submit(&self, request: &Arc<CompareRequest>) {
        debug!(
            "[Scheduler] Request {}: submitting {} jobs",
            request.generation(),
            request.candidate_tour_ids.len()
        );

        for &tour_id in &request.candidate_tour_ids {
            let request = Arc::clone(request);
            let tracks = Arc::clone(&self.tracks);
            let cache = Arc::clone(&self.cache);
            let results = self.results.clone();

            self.pool.spawn(move || {
                run_job(&request, tour_id, tracks.as_ref(), &cache, &results);
            });
        }
    }

    /// Drop a tour's cached track, e.g. after it was re-imported.
    pub fn invalidate_track(&self, tour_id: TourId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.invalidate(&tour_id);
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .lock()
            .map(|cache| cache.stats())
            .unwrap_or_default()
    }
}

fn run_job(
    request: &CompareRequest,
    tour_id: TourId,
    tracks: &dyn TrackProvider,
    cache: &TrackCache,
    results: &SyncSender<AggregatorMsg>,
) {
    let generation = request.generation();

    if request.is_canceled() {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let track = load_cached(tracks, cache, tour_id)?;
        compare_candidate(request, &track, tracks)
    }));

    let msg = match outcome {
        Ok(Ok(Some(result))) => AggregatorMsg::Result { generation, result },
        Ok(Ok(None)) => {
            debug!("[Scheduler] Tour {} abandoned, request {} canceled", tour_id, generation);
            return;
        }
        Ok(Err(e)) => {
            warn!("[Scheduler] Skipping tour {}: {}", tour_id, e);
            AggregatorMsg::Skipped { generation, tour_id }
        }
        Err(_) => {
            warn!("[Scheduler] Skipping tour {}: comparison panicked", tour_id);
            AggregatorMsg::Skipped { generation, tour_id }
        }
    };

    // aggregator gone means the engine is shutting down
    results.send(msg).ok();
}

fn load_cached(
    tracks: &dyn TrackProvider,
    cache: &TrackCache,
    tour_id: TourId,
) -> Result<Arc<RecordedTrack>> {
    if let Some(track) = cache.lock().ok().and_then(|mut c| c.get(&tour_id)) {
        return Ok(track);
    }
    let track = tracks.load_track(tour_id)?;
    if let Ok(mut c) = cache.lock() {
        c.insert(tour_id, Arc::clone(&track));
    }
    Ok(track)
}

/// Compare one loaded candidate track against the request's reference.
///
/// Returns `Ok(None)` when the request was canceled mid-way.
pub fn compare_candidate(
    request: &CompareRequest,
    track: &RecordedTrack,
    tracks: &dyn TrackProvider,
) -> Result<Option<CompareResult>> {
    let tour_id = track.tour_id;
    let candidate = tracks.normalize(
        track,
        0,
        track.len(),
        request.params.geo_accuracy,
        request.params.distance_interval,
    )?;

    let (offset, diff) = match align_segments(
        &request.reference,
        &candidate,
        request.token.cancellation(),
    ) {
        Alignment::Canceled => return Ok(None),
        Alignment::NotComparable => return Ok(Some(CompareResult::not_comparable(tour_id))),
        Alignment::Matched { offset, diff } => (offset, diff),
    };

    let index = candidate.orig_index();
    let first_index = index[offset];
    let last_index = index[offset + request.reference.len() - 1];

    Ok(Some(CompareResult {
        tour_id,
        score: Score::Computed(diff),
        matched: Some(MatchedRange {
            offset,
            first_index,
            last_index,
        }),
        avg_heart_rate: Some(tracks.average_heart_rate(track, first_index, last_index)),
        avg_speed: Some(tracks.average_speed(track, first_index, last_index)),
    }))
}

/// Compare every candidate of a request on the calling thread.
///
/// Same per-candidate semantics as the pool, without the aggregator:
/// failed candidates are logged and left out. Results come back in
/// candidate order.
pub fn compare_sequential(
    request: &CompareRequest,
    tracks: &dyn TrackProvider,
) -> Vec<CompareResult> {
    let mut results = Vec::with_capacity(request.candidate_tour_ids.len());

    for &tour_id in &request.candidate_tour_ids {
        if request.is_canceled() {
            break;
        }
        let outcome = tracks
            .load_track(tour_id)
            .and_then(|track| compare_candidate(request, &track, tracks));
        match outcome {
            Ok(Some(result)) => results.push(result),
            Ok(None) => break,
            Err(e) => warn!("[Scheduler] Skipping tour {}: {}", tour_id, e),
        }
    }

    results
}
