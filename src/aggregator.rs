//! # Result Aggregator
//!
//! Single consumer of per-candidate results. Compare workers send finished
//! [`CompareResult`]s over a bounded channel; the aggregator thread is the
//! only writer of the result list, so the hot path takes no locks.
//!
//! While a request is in flight the aggregator emits at most one
//! `ResultUpdated` per update interval, then exactly one
//! `RequestCompleted` once every candidate has been accounted for.
//! Results from superseded or canceled generations are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{GeoCompareError, Result};
use crate::events::{CompareEvent, EventCallback};
use crate::request::{CompareResult, RequestState, RequestToken, Score};
use crate::TourId;

/// Messages accepted by the aggregator thread.
#[derive(Debug)]
pub enum AggregatorMsg {
    /// A request entered comparison with `total` candidates
    Begin {
        token: Arc<RequestToken>,
        total: usize,
    },
    /// One candidate finished
    Result { generation: u64, result: CompareResult },
    /// One candidate failed and was skipped
    Skipped { generation: u64, tour_id: TourId },
    Shutdown,
}

/// Ranked results of one request plus relative-scaling data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompareSummary {
    pub request_id: u64,
    /// Computed results by ascending diff, then not comparable, then pending
    pub results: Vec<CompareResult>,
    /// Largest computed diff seen, `None` until one exists
    pub max_diff: Option<i64>,
    pub compared: usize,
    pub skipped: usize,
}

impl CompareSummary {
    /// Diff as a percentage of the largest diff, for weak-match filtering.
    pub fn relative_diff(&self, result: &CompareResult) -> Option<f32> {
        relative_diff(result.score, self.max_diff)
    }

    /// Best match, if any candidate was computed.
    pub fn best(&self) -> Option<&CompareResult> {
        self.results
            .first()
            .filter(|r| matches!(r.score, Score::Computed(_)))
    }

    pub fn get(&self, tour_id: TourId) -> Option<&CompareResult> {
        self.results.iter().find(|r| r.tour_id == tour_id)
    }

    /// Results re-sorted for another display column.
    pub fn ranked_by(&self, by: RankBy) -> Vec<CompareResult> {
        let mut results = self.results.clone();
        rank_results_by(&mut results, by);
        results
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// `diff / max_diff * 100`; 0 when the maximum itself is 0.
pub fn relative_diff(score: Score, max_diff: Option<i64>) -> Option<f32> {
    let diff = score.diff()?;
    let max = max_diff?;
    if max == 0 {
        return Some(0.0);
    }
    Some((diff as f64 / max as f64 * 100.0) as f32)
}

/// Display ordering for a result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBy {
    /// Ascending diff, the engine's own order
    #[default]
    Diff,
    /// Highest average heart rate over the matched range first
    AvgHeartRate,
    /// Fastest average speed over the matched range first
    AvgSpeed,
}

/// Sort results for display: computed by ascending diff, then
/// not comparable, then pending, ties by tour id.
pub fn rank_results(results: &mut [CompareResult]) {
    rank_results_by(results, RankBy::Diff);
}

/// Sort results by `by`, falling back to the diff order.
///
/// Results without the metric (not computed, or no samples) go last.
pub fn rank_results_by(results: &mut [CompareResult], by: RankBy) {
    fn class(score: &Score) -> (u8, i64) {
        match score {
            Score::Computed(diff) => (0, *diff),
            Score::NotComparable => (1, 0),
            Score::Pending => (2, 0),
        }
    }

    fn metric(result: &CompareResult, by: RankBy) -> Option<f32> {
        if result.score.diff().is_none() {
            return None;
        }
        match by {
            RankBy::Diff => None,
            RankBy::AvgHeartRate => result.avg_heart_rate,
            RankBy::AvgSpeed => result.avg_speed,
        }
        .filter(|value| value.is_finite())
    }

    results.sort_by(|a, b| {
        let primary = match (metric(a, by), metric(b, by)) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        primary
            .then(class(&a.score).cmp(&class(&b.score)))
            .then(a.tour_id.cmp(&b.tour_id))
    });
}

/// Per-request bookkeeping, owned by the aggregator thread.
struct Aggregation {
    token: Arc<RequestToken>,
    total: usize,
    compared: usize,
    skipped: usize,
    results: Vec<CompareResult>,
    max_diff: Option<i64>,
    last_emit: Option<Instant>,
    dirty: bool,
}

impl Aggregation {
    fn new(token: Arc<RequestToken>, total: usize) -> Self {
        Self {
            token,
            total,
            compared: 0,
            skipped: 0,
            results: Vec::with_capacity(total),
            max_diff: None,
            last_emit: None,
            dirty: false,
        }
    }

    fn generation(&self) -> u64 {
        self.token.generation()
    }

    fn is_finished(&self) -> bool {
        self.compared + self.skipped >= self.total
    }

    fn add(&mut self, result: CompareResult) {
        if let Score::Computed(diff) = result.score {
            self.max_diff = Some(self.max_diff.map_or(diff, |max| max.max(diff)));
        }
        self.results.push(result);
        self.compared += 1;
        self.dirty = true;
    }

    fn summary(&self) -> CompareSummary {
        let mut results = self.results.clone();
        rank_results(&mut results);
        CompareSummary {
            request_id: self.generation(),
            results,
            max_diff: self.max_diff,
            compared: self.compared,
            skipped: self.skipped,
        }
    }
}

/// Handle to the aggregator thread.
pub struct ResultAggregator {
    sender: SyncSender<AggregatorMsg>,
    handle: Option<JoinHandle<()>>,
}

impl ResultAggregator {
    /// Start the aggregator thread.
    ///
    /// `current_generation` is owned by the controller; results whose
    /// generation differs from it are never reported. The latest completed
    /// summary is published into `latest`.
    pub fn spawn(
        update_interval: Duration,
        channel_capacity: usize,
        current_generation: Arc<AtomicU64>,
        latest: Arc<RwLock<Option<CompareSummary>>>,
        on_event: EventCallback,
    ) -> Result<Self> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(channel_capacity.max(1));

        let worker = AggregatorWorker {
            receiver,
            update_interval,
            current_generation,
            latest,
            on_event,
            active: None,
        };

        let handle = thread::Builder::new()
            .name("geo-compare-aggregator".to_string())
            .spawn(move || worker.run())
            .map_err(|e| GeoCompareError::WorkerUnavailable {
                message: format!("failed to spawn aggregator: {}", e),
            })?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Sender for workers to deliver results.
    pub fn sender(&self) -> SyncSender<AggregatorMsg> {
        self.sender.clone()
    }

    /// Stop the thread after it drains queued messages.
    pub fn shutdown(&mut self) {
        self.sender.send(AggregatorMsg::Shutdown).ok();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for ResultAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AggregatorWorker {
    receiver: Receiver<AggregatorMsg>,
    update_interval: Duration,
    current_generation: Arc<AtomicU64>,
    latest: Arc<RwLock<Option<CompareSummary>>>,
    on_event: EventCallback,
    active: Option<Aggregation>,
}

impl AggregatorWorker {
    fn run(mut self) {
        let tick = self.update_interval.max(Duration::from_millis(1));
        loop {
            match self.receiver.recv_timeout(tick) {
                Ok(AggregatorMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(AggregatorMsg::Begin { token, total }) => self.begin(token, total),
                Ok(AggregatorMsg::Result { generation, result }) => {
                    if let Some(active) = self.accepting(generation) {
                        active.add(result);
                        self.after_progress();
                    }
                }
                Ok(AggregatorMsg::Skipped {
                    generation,
                    tour_id,
                }) => {
                    if let Some(active) = self.accepting(generation) {
                        debug!("[Aggregator] Tour {} skipped in request {}", tour_id, generation);
                        active.skipped += 1;
                        self.after_progress();
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.flush_if_due(),
            }
        }
        debug!("[Aggregator] Stopped");
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.current_generation.load(Ordering::SeqCst)
    }

    fn begin(&mut self, token: Arc<RequestToken>, total: usize) {
        if token.is_canceled() || !self.is_current(token.generation()) {
            debug!("[Aggregator] Ignoring stale request {}", token.generation());
            return;
        }
        self.active = Some(Aggregation::new(token, total));
        if total == 0 {
            self.complete();
        }
    }

    /// The live aggregation for `generation`, if results for it are accepted.
    fn accepting(&mut self, generation: u64) -> Option<&mut Aggregation> {
        if !self.is_current(generation) {
            return None;
        }
        let active = self.active.as_mut()?;
        if active.generation() != generation {
            return None;
        }
        if active.token.is_canceled() {
            self.active = None;
            return None;
        }
        self.active.as_mut()
    }

    fn after_progress(&mut self) {
        let finished = match &self.active {
            Some(active) => active.is_finished(),
            None => return,
        };
        if finished {
            self.complete();
        } else {
            self.flush_if_due();
        }
    }

    fn flush_if_due(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.dirty {
            return;
        }
        let due = active
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.update_interval);
        if !due {
            return;
        }

        let summary = active.summary();
        let event = CompareEvent::ResultUpdated {
            request_id: summary.request_id,
            partial_results: summary.results,
            compared: active.compared + active.skipped,
            total: active.total,
        };
        let on_event = &self.on_event;
        active
            .token
            .cancellation()
            .emit_unless_canceled(|| on_event(event));

        active.last_emit = Some(Instant::now());
        active.dirty = false;
    }

    fn complete(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let summary = active.summary();
        let generation = active.generation();

        let on_event = &self.on_event;
        let latest = &self.latest;
        let token = &active.token;
        let emitted = token.cancellation().emit_unless_canceled(|| {
            token.advance(RequestState::Done);
            if let Ok(mut latest) = latest.write() {
                *latest = Some(summary.clone());
            }
            on_event(CompareEvent::RequestCompleted {
                request_id: generation,
                results: summary,
            });
        });

        if emitted {
            info!(
                "[Aggregator] Request {} completed: {} compared, {} skipped, max diff {:?}",
                generation, active.compared, active.skipped, active.max_diff
            );
        }
    }
}
