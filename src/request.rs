//! Comparison requests, their cancellation tokens and per-candidate results.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::buckets::GeoBucket;
use crate::normalize::NormalizedSegment;
use crate::{CompareParams, ReferenceSelection, TourId};

/// Cooperative cancellation flag shared by every job of one request.
///
/// Cloning shares the same flag. Workers only read it. Setting it happens
/// under the emit gate, so once [`cancel`](Self::cancel) returns no
/// gated event for the request can still be in flight.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    canceled: AtomicBool,
    emit_gate: Mutex<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _gate = self.gate();
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Run `emit` unless the token is canceled, holding the gate so a
    /// concurrent `cancel` waits for it. Returns whether `emit` ran.
    pub fn emit_unless_canceled<F: FnOnce()>(&self, emit: F) -> bool {
        let _gate = self.gate();
        if self.is_canceled() {
            return false;
        }
        emit();
        true
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        // The gate guards no data, a poisoned lock is still usable
        self.inner
            .emit_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lifecycle of one comparison request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Created,
    RetrievingCandidates,
    Comparing,
    Done,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Canceled)
    }

    fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Done | Canceled, _) => false,
            (_, Canceled) => true,
            (Created, RetrievingCandidates) => true,
            (RetrievingCandidates, Comparing) => true,
            // empty candidate lists complete straight from retrieval
            (RetrievingCandidates | Comparing, Done) => true,
            _ => false,
        }
    }
}

/// Identity, cancellation and state of one request generation.
///
/// Created by the controller at selection time, before the request's
/// reference segment exists, so a burst of selections can be superseded
/// while still waiting in the debounce.
#[derive(Debug)]
pub struct RequestToken {
    generation: u64,
    cancel: CancellationToken,
    state: Mutex<RequestState>,
}

impl RequestToken {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            cancel: CancellationToken::new(),
            state: Mutex::new(RequestState::Created),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn state(&self) -> RequestState {
        *self.lock_state()
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn advance(&self, next: RequestState) -> bool {
        let mut state = self.lock_state();
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Cancel the request. Returns `true` if it was still live.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        self.advance(RequestState::Canceled)
    }

    fn lock_state(&self) -> MutexGuard<'_, RequestState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A fully prepared comparison run, built once candidates are known.
///
/// Immutable after construction; results live in the aggregator.
#[derive(Debug)]
pub struct CompareRequest {
    pub token: Arc<RequestToken>,
    pub selection: ReferenceSelection,
    pub params: CompareParams,
    pub reference: NormalizedSegment,
    pub buckets: BTreeSet<GeoBucket>,
    pub candidate_tour_ids: Vec<TourId>,
}

impl CompareRequest {
    pub fn generation(&self) -> u64 {
        self.token.generation()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

/// Outcome of comparing one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Score {
    /// Not compared yet, or comparison was abandoned
    Pending,
    /// Candidate's normalized track is shorter than the reference
    NotComparable,
    /// Sum of per-point Manhattan distances in quantized units
    Computed(i64),
}

impl Score {
    pub fn diff(&self) -> Option<i64> {
        match self {
            Score::Computed(diff) => Some(*diff),
            _ => None,
        }
    }
}

/// Raw-sample range of the best alignment in a candidate track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRange {
    /// Winning offset in the candidate's normalized sequence
    pub offset: usize,
    pub first_index: usize,
    pub last_index: usize,
}

/// Per-candidate result, created once by the worker that finished it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareResult {
    pub tour_id: TourId,
    pub score: Score,
    pub matched: Option<MatchedRange>,
    pub avg_heart_rate: Option<f32>,
    /// Meters per second
    pub avg_speed: Option<f32>,
}

impl CompareResult {
    pub fn not_comparable(tour_id: TourId) -> Self {
        Self {
            tour_id,
            score: Score::NotComparable,
            matched: None,
            avg_heart_rate: None,
            avg_speed: None,
        }
    }
}
