//! # Request Controller
//!
//! Owns the lifecycle of comparison requests and every worker behind them.
//!
//! ## Request flow
//!
//! 1. [`select`](RequestController::select) creates a new generation and
//!    immediately cancels the previous request, whatever its state.
//! 2. The selection waits in the debounce thread. A newer selection within
//!    the debounce window replaces it, so only the last one of a burst
//!    (e.g. dragging a slider) reaches retrieval.
//! 3. The retrieval thread builds the reference and candidate list.
//! 4. The compare pool aligns every candidate.
//! 5. The aggregator ranks results and emits events.
//!
//! The controller is the only writer of the generation counter and of
//! request cancellation; every worker just reads them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::aggregator::{CompareSummary, ResultAggregator};
use crate::error::{GeoCompareError, Result};
use crate::events::{CompareEvent, EventCallback};
use crate::lru_cache::CacheStats;
use crate::request::{RequestState, RequestToken};
use crate::retriever::{CandidateRetriever, CandidateStore, RetrievalJob, TourFilter};
use crate::scheduler::CompareScheduler;
use crate::track::TrackProvider;
use crate::{CompareParams, EngineConfig, ReferenceSelection, TourId};

// ============================================================================
// Debounce
// ============================================================================

enum DebounceMsg {
    Schedule(RetrievalJob),
    Shutdown,
}

struct DebounceWorker {
    delay: Duration,
    retriever: CandidateRetriever,
}

impl DebounceWorker {
    fn run(self, receiver: Receiver<DebounceMsg>) {
        let mut pending: Option<(RetrievalJob, Instant)> = None;

        loop {
            let msg = match pending.as_ref().map(|(_, deadline)| *deadline) {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Some((job, _)) = pending.take() {
                            self.release(job);
                        }
                        continue;
                    }
                    match receiver.recv_timeout(deadline - now) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };

            match msg {
                DebounceMsg::Schedule(job) => {
                    if let Some((replaced, _)) = &pending {
                        debug!(
                            "[GeoCompare] Request {} replaced during debounce",
                            replaced.token.generation()
                        );
                    }
                    pending = Some((job, Instant::now() + self.delay));
                }
                DebounceMsg::Shutdown => break,
            }
        }
        // dropping the retriever joins its thread
        debug!("[GeoCompare] Debounce stopped");
    }

    fn release(&self, job: RetrievalJob) {
        if job.token.is_canceled() {
            return;
        }
        let generation = job.token.generation();
        if let Err(e) = self.retriever.enqueue(job) {
            warn!("[GeoCompare] Request {} not started: {}", generation, e);
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// The request currently owned by the controller.
struct LiveRequest {
    token: Arc<RequestToken>,
    selection: ReferenceSelection,
    params: CompareParams,
}

struct ControllerState {
    params: CompareParams,
    filter: Option<TourFilter>,
    live: Option<LiveRequest>,
}

/// Entry point of the comparison engine.
///
/// Construct one per application; it starts the debounce, retrieval and
/// aggregator threads plus the compare pool, and stops them on
/// [`shutdown`](Self::shutdown) or drop.
pub struct RequestController {
    config: EngineConfig,
    state: Mutex<ControllerState>,
    generation: Arc<AtomicU64>,
    latest: Arc<RwLock<Option<CompareSummary>>>,
    on_event: EventCallback,
    scheduler: Arc<CompareScheduler>,
    debounce: Sender<DebounceMsg>,
    debounce_handle: Option<JoinHandle<()>>,
    aggregator: Option<ResultAggregator>,
}

impl RequestController {
    /// Create a controller with default comparison parameters.
    ///
    /// Fails with a configuration error when `config` is invalid or the
    /// store was indexed at a different bucket resolution.
    pub fn new(
        config: EngineConfig,
        tracks: Arc<dyn TrackProvider>,
        store: Arc<dyn CandidateStore>,
        on_event: EventCallback,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(indexed) = store.bucket_resolution() {
            if indexed != config.bucket_resolution {
                return Err(GeoCompareError::config(format!(
                    "store indexed at {} cells/degree, engine configured for {}",
                    indexed, config.bucket_resolution
                )));
            }
        }

        let generation = Arc::new(AtomicU64::new(0));
        let latest = Arc::new(RwLock::new(None));

        let aggregator = ResultAggregator::spawn(
            config.update_interval(),
            config.result_channel_capacity,
            Arc::clone(&generation),
            Arc::clone(&latest),
            Arc::clone(&on_event),
        )?;

        let scheduler = Arc::new(CompareScheduler::new(
            config.worker_threads,
            config.track_cache_size,
            Arc::clone(&tracks),
            aggregator.sender(),
        )?);

        let retriever = CandidateRetriever::spawn(
            config.bucket_resolution,
            tracks,
            store,
            Arc::clone(&scheduler),
            aggregator.sender(),
            Arc::clone(&on_event),
        )?;

        let (debounce, receiver) = mpsc::channel();
        let worker = DebounceWorker {
            delay: config.debounce(),
            retriever,
        };
        let debounce_handle = thread::Builder::new()
            .name("geo-compare-debounce".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|e| GeoCompareError::WorkerUnavailable {
                message: format!("failed to spawn debounce thread: {}", e),
            })?;

        info!(
            "[GeoCompare] Controller started (debounce {}ms, {} compare workers)",
            config.debounce_ms,
            scheduler.worker_count()
        );

        Ok(Self {
            config,
            state: Mutex::new(ControllerState {
                params: CompareParams::default(),
                filter: None,
                live: None,
            }),
            generation,
            latest,
            on_event,
            scheduler,
            debounce,
            debounce_handle: Some(debounce_handle),
            aggregator: Some(aggregator),
        })
    }

    /// Create a controller with explicit comparison parameters.
    pub fn with_params(
        config: EngineConfig,
        params: CompareParams,
        tracks: Arc<dyn TrackProvider>,
        store: Arc<dyn CandidateStore>,
        on_event: EventCallback,
    ) -> Result<Self> {
        let controller = Self::new(config, tracks, store, on_event)?;
        controller.check_params(&params)?;
        controller.lock()?.params = params;
        Ok(controller)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Compare a new reference selection. Returns the request id.
    ///
    /// The previous request is canceled right away. Re-selecting the live,
    /// uncanceled selection with unchanged parameters is a no-op that
    /// returns the existing id.
    pub fn select(&self, selection: ReferenceSelection) -> Result<u64> {
        let mut state = self.lock()?;
        let params = state.params;
        self.check_params(&params)?;

        if let Some(live) = &state.live {
            if live.selection == selection && live.params == params && !live.token.is_canceled() {
                debug!(
                    "[GeoCompare] Selection unchanged, keeping request {}",
                    live.token.generation()
                );
                return Ok(live.token.generation());
            }
        }

        self.issue(&mut state, selection, params)
    }

    /// Change comparison parameters.
    ///
    /// Changed parameters re-run the current selection as a new request,
    /// returning its id. Unchanged parameters, or no selection yet, return
    /// `None`.
    pub fn set_params(&self, params: CompareParams) -> Result<Option<u64>> {
        self.check_params(&params)?;
        let mut state = self.lock()?;
        if state.params == params {
            return Ok(None);
        }
        state.params = params;

        let Some(selection) = state.live.as_ref().map(|live| live.selection) else {
            return Ok(None);
        };
        self.issue(&mut state, selection, params).map(Some)
    }

    /// Install or clear the application-level tour filter.
    ///
    /// Applies to requests created afterwards, and only while
    /// `use_external_filter` is set.
    pub fn set_filter(&self, filter: Option<TourFilter>) -> Result<()> {
        self.lock()?.filter = filter;
        Ok(())
    }

    /// Cancel the live request. Returns its id if it was still running.
    pub fn cancel(&self) -> Result<Option<u64>> {
        let state = self.lock()?;
        Ok(state.live.as_ref().and_then(|live| {
            self.supersede(&live.token)
                .then(|| live.token.generation())
        }))
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// State of the most recent request, `None` before the first selection.
    pub fn state(&self) -> Option<RequestState> {
        let state = self.state.lock().ok()?;
        state.live.as_ref().map(|live| live.token.state())
    }

    /// Id of the most recent request, 0 before the first selection.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Ranked results of the last completed request.
    pub fn latest_summary(&self) -> Option<CompareSummary> {
        self.latest.read().ok()?.clone()
    }

    pub fn params(&self) -> CompareParams {
        self.state
            .lock()
            .map(|state| state.params)
            .unwrap_or_default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    /// Forget a tour's cached track after it was re-imported or deleted.
    pub fn invalidate_tour(&self, tour_id: TourId) {
        self.scheduler.invalidate_track(tour_id);
    }

    pub fn track_cache_stats(&self) -> CacheStats {
        self.scheduler.cache_stats()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancel the live request and stop all worker threads.
    pub fn shutdown(&mut self) {
        if let Ok(state) = self.state.lock() {
            if let Some(live) = &state.live {
                live.token.cancel();
            }
        }

        self.debounce.send(DebounceMsg::Shutdown).ok();
        if let Some(handle) = self.debounce_handle.take() {
            handle.join().ok();
        }
        if let Some(mut aggregator) = self.aggregator.take() {
            aggregator.shutdown();
            info!("[GeoCompare] Controller stopped");
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> Result<MutexGuard<'_, ControllerState>> {
        self.state.lock().map_err(|_| GeoCompareError::Internal {
            message: "controller state lock poisoned".to_string(),
        })
    }

    fn check_params(&self, params: &CompareParams) -> Result<()> {
        params.validate()?;
        if self.config.bucket_resolution as i64 > params.geo_accuracy {
            return Err(GeoCompareError::config(format!(
                "bucket resolution {} is finer than geo accuracy {}",
                self.config.bucket_resolution, params.geo_accuracy
            )));
        }
        Ok(())
    }

    fn issue(
        &self,
        state: &mut ControllerState,
        selection: ReferenceSelection,
        params: CompareParams,
    ) -> Result<u64> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = state.live.take() {
            self.supersede(&previous.token);
        }

        let token = Arc::new(RequestToken::new(generation));
        state.live = Some(LiveRequest {
            token: Arc::clone(&token),
            selection,
            params,
        });

        info!(
            "[GeoCompare] Request {}: tour {} samples {}..{}",
            generation, selection.tour_id, selection.first_index, selection.last_index
        );

        let job = RetrievalJob {
            token,
            selection,
            params,
            filter: state.filter.clone(),
        };
        self.debounce
            .send(DebounceMsg::Schedule(job))
            .map_err(|_| GeoCompareError::WorkerUnavailable {
                message: "controller has shut down".to_string(),
            })?;

        Ok(generation)
    }

    /// Cancel `token` and announce it. Returns whether it was still live.
    fn supersede(&self, token: &RequestToken) -> bool {
        if !token.cancel() {
            return false;
        }
        debug!("[GeoCompare] Request {} canceled", token.generation());
        (self.on_event)(CompareEvent::RequestCanceled {
            request_id: token.generation(),
        });
        true
    }
}

impl Drop for RequestController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
