//! # Candidate Retriever
//!
//! Turns a reference selection into the list of tours worth comparing.
//!
//! All store access goes through one dedicated thread, so retrievals are
//! serialized while comparison stays parallel. For each job the thread
//! loads and normalizes the reference range, computes its geo buckets,
//! queries the store for every tour touching any of them and hands the
//! finished [`CompareRequest`] to the compare pool.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::aggregator::AggregatorMsg;
use crate::buckets::{compute_buckets, GeoBucket};
use crate::error::{GeoCompareError, Result};
use crate::events::{CompareEvent, EventCallback};
use crate::normalize::NormalizedSegment;
use crate::request::{CompareRequest, RequestState, RequestToken};
use crate::scheduler::CompareScheduler;
use crate::track::TrackProvider;
use crate::{CompareParams, ReferenceSelection, TourId};

/// Application-level tour predicate, `true` keeps the tour.
pub type TourFilter = Arc<dyn Fn(TourId) -> bool + Send + Sync>;

/// Persisted store of tour geo parts.
pub trait CandidateStore: Send + Sync {
    /// Every tour whose track touches any of `buckets`, kept only where
    /// `filter` (when given) returns `true`. Ids are unique, order is free.
    fn query_candidate_tour_ids(
        &self,
        buckets: &BTreeSet<GeoBucket>,
        filter: Option<&TourFilter>,
    ) -> Result<Vec<TourId>>;

    /// Bucket resolution the store was indexed with, if fixed.
    fn bucket_resolution(&self) -> Option<u32> {
        None
    }
}

/// Query the store and time it.
///
/// An empty bucket set short-circuits to an empty list without touching
/// the store.
pub fn retrieve_candidates(
    store: &dyn CandidateStore,
    buckets: &BTreeSet<GeoBucket>,
    filter: Option<&TourFilter>,
) -> Result<(Vec<TourId>, Duration)> {
    let start = Instant::now();
    if buckets.is_empty() {
        return Ok((Vec::new(), start.elapsed()));
    }
    let mut tour_ids = store.query_candidate_tour_ids(buckets, filter)?;
    tour_ids.sort_unstable();
    tour_ids.dedup();
    Ok((tour_ids, start.elapsed()))
}

/// One selection to turn into a compare request.
pub struct RetrievalJob {
    pub token: Arc<RequestToken>,
    pub selection: ReferenceSelection,
    pub params: CompareParams,
    pub filter: Option<TourFilter>,
}

pub(crate) enum RetrieverMsg {
    Retrieve(RetrievalJob),
    Shutdown,
}

/// Handle to the retrieval thread.
pub struct CandidateRetriever {
    sender: Sender<RetrieverMsg>,
    handle: Option<JoinHandle<()>>,
}

impl CandidateRetriever {
    pub fn spawn(
        bucket_resolution: u32,
        tracks: Arc<dyn TrackProvider>,
        store: Arc<dyn CandidateStore>,
        scheduler: Arc<CompareScheduler>,
        aggregator: SyncSender<AggregatorMsg>,
        on_event: EventCallback,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();

        let worker = RetrieverWorker {
            bucket_resolution,
            tracks,
            store,
            scheduler,
            aggregator,
            on_event,
        };

        let handle = thread::Builder::new()
            .name("geo-compare-retriever".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|e| GeoCompareError::WorkerUnavailable {
                message: format!("failed to spawn retriever: {}", e),
            })?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue a job behind any retrieval already running.
    pub fn enqueue(&self, job: RetrievalJob) -> Result<()> {
        self.sender
            .send(RetrieverMsg::Retrieve(job))
            .map_err(|_| GeoCompareError::WorkerUnavailable {
                message: "retriever has shut down".to_string(),
            })
    }

    pub fn shutdown(&mut self) {
        self.sender.send(RetrieverMsg::Shutdown).ok();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for CandidateRetriever {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RetrieverWorker {
    bucket_resolution: u32,
    tracks: Arc<dyn TrackProvider>,
    store: Arc<dyn CandidateStore>,
    scheduler: Arc<CompareScheduler>,
    aggregator: SyncSender<AggregatorMsg>,
    on_event: EventCallback,
}

impl RetrieverWorker {
    fn run(self, receiver: Receiver<RetrieverMsg>) {
        while let Ok(RetrieverMsg::Retrieve(job)) = receiver.recv() {
            self.process(job);
        }
        debug!("[Retriever] Stopped");
    }

    fn process(&self, job: RetrievalJob) {
        let token = job.token;
        let generation = token.generation();

        if !token.advance(RequestState::RetrievingCandidates) {
            debug!("[Retriever] Request {} dropped before retrieval", generation);
            return;
        }

        let (reference, buckets) = match self.load_reference(&job.selection, &job.params) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(
                    "[Retriever] Request {}: reference tour {} unusable: {}",
                    generation, job.selection.tour_id, e
                );
                (NormalizedSegment::empty(job.params.geo_accuracy), BTreeSet::new())
            }
        };

        let filter = if job.params.use_external_filter {
            job.filter.as_ref()
        } else {
            None
        };
        let (candidates, latency) =
            match retrieve_candidates(self.store.as_ref(), &buckets, filter) {
                Ok(found) => found,
                Err(e) => {
                    warn!("[Retriever] Request {}: store query failed: {}", generation, e);
                    (Vec::new(), Duration::ZERO)
                }
            };

        if token.is_canceled() {
            debug!("[Retriever] Request {} canceled during retrieval", generation);
            return;
        }

        info!(
            "[Retriever] Request {}: {} candidates from {} buckets in {}ms",
            generation,
            candidates.len(),
            buckets.len(),
            latency.as_millis()
        );

        let event = CompareEvent::CandidatesReady {
            request_id: generation,
            count: candidates.len(),
            latency_ms: latency.as_millis() as u64,
            bucket_count: buckets.len(),
            reference_len: reference.len(),
            reference_distance_m: reference.normalized_distance(),
        };
        let on_event = &self.on_event;
        token
            .cancellation()
            .emit_unless_canceled(|| on_event(event));

        if !token.advance(RequestState::Comparing) {
            return;
        }

        let total = candidates.len();
        let begin = AggregatorMsg::Begin {
            token: Arc::clone(&token),
            total,
        };
        if self.aggregator.send(begin).is_err() {
            return;
        }
        if total == 0 {
            return;
        }

        let request = Arc::new(CompareRequest {
            token,
            selection: job.selection,
            params: job.params,
            reference,
            buckets,
            candidate_tour_ids: candidates,
        });
        self.scheduler.submit(&request);
    }

    /// Normalized reference plus the buckets of its raw sample range.
    fn load_reference(
        &self,
        selection: &ReferenceSelection,
        params: &CompareParams,
    ) -> Result<(NormalizedSegment, BTreeSet<GeoBucket>)> {
        let track = self.tracks.load_track(selection.tour_id)?;
        let last_index = selection.last_index.min(track.len());
        let first_index = selection.first_index.min(last_index);
        let reference = self.tracks.normalize(
            &track,
            first_index,
            last_index,
            params.geo_accuracy,
            params.distance_interval,
        )?;
        if reference.is_empty() {
            return Ok((reference, BTreeSet::new()));
        }
        let buckets = compute_buckets(&track, first_index, last_index, self.bucket_resolution);
        Ok((reference, buckets))
    }
}
