//! Events emitted to the UI boundary.

use std::sync::Arc;

use serde::Serialize;

use crate::aggregator::CompareSummary;
use crate::request::CompareResult;

/// Notification about the progress of one comparison request.
///
/// `request_id` is the request's generation id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum CompareEvent {
    /// Candidate retrieval finished
    CandidatesReady {
        request_id: u64,
        count: usize,
        latency_ms: u64,
        /// Geo buckets touched by the reference segment
        bucket_count: usize,
        /// Points in the normalized reference segment
        reference_len: usize,
        /// Distance covered by the normalized reference, in meters
        reference_distance_m: i64,
    },
    /// Throttled snapshot while comparison is in flight
    ResultUpdated {
        request_id: u64,
        partial_results: Vec<CompareResult>,
        compared: usize,
        total: usize,
    },
    /// All candidates compared, results ranked
    RequestCompleted {
        request_id: u64,
        results: CompareSummary,
    },
    /// Request superseded or explicitly canceled
    RequestCanceled { request_id: u64 },
}

impl CompareEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            CompareEvent::CandidatesReady { request_id, .. }
            | CompareEvent::ResultUpdated { request_id, .. }
            | CompareEvent::RequestCompleted { request_id, .. }
            | CompareEvent::RequestCanceled { request_id } => *request_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Callback receiving engine events, invoked from worker threads.
///
/// Gated events are delivered while the request's emit gate is held, so
/// the callback must not call back into the controller synchronously;
/// forward to a channel instead.
pub type EventCallback = Arc<dyn Fn(CompareEvent) + Send + Sync>;

/// Event callback that forwards into an `mpsc` channel.
pub fn channel_callback(sender: std::sync::mpsc::Sender<CompareEvent>) -> EventCallback {
    let sender = std::sync::Mutex::new(sender);
    Arc::new(move |event| {
        if let Ok(sender) = sender.lock() {
            sender.send(event).ok();
        }
    })
}
