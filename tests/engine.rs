//! End-to-end tests through the request controller.
//!
//! Every test builds an in-memory tour library, drives the controller with
//! selections and reads events back from an mpsc channel.
//!
//! Coordinates are chosen so quantization at accuracy 10_000 never lands
//! on an integer boundary (all fractional parts are .2 units).

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use geo_compare::{
    channel_callback, compare_sequential, compute_buckets, normalize_track, CandidateStore,
    CompareEvent, CompareParams, CompareRequest, CompareSummary, EngineConfig, GeoCompareError,
    GpsPoint, NormalizedSegment, RecordedTrack, ReferenceSelection, RequestController,
    RequestState, RequestToken, Result, Score, TourFilter, TourId, TourLibrary, TrackProvider,
};

const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

/// Straight track going north, one sample every ~55 m.
fn line(tour_id: TourId, start_lat: f64, lon: f64, samples: usize) -> RecordedTrack {
    let points: Vec<GpsPoint> = (0..samples)
        .map(|i| GpsPoint::new(start_lat + i as f64 * 0.0005, lon))
        .collect();
    RecordedTrack::new(tour_id, &points)
        .with_times((0..samples).map(|i| i as f64 * 10.0).collect())
        .with_heart_rates(vec![150.0; samples])
}

const LAT: f64 = 47.00002;
const LON: f64 = 8.30552;

/// Tour 1 is the reference. Tour 2 contains it, tour 3 runs parallel
/// 3 units east, tour 4 is far away, tour 5 is too short.
fn standard_library() -> Arc<TourLibrary> {
    let library = Arc::new(TourLibrary::new(100));
    library.insert(line(1, LAT, LON, 40)).unwrap();
    library.insert(line(2, LAT - 10.0 * 0.0005, LON, 60)).unwrap();
    library.insert(line(3, LAT, 8.30582, 40)).unwrap();
    library.insert(line(4, 40.00002, -3.30552, 40)).unwrap();
    library.insert(line(5, LAT, LON, 5)).unwrap();
    library
}

fn params() -> CompareParams {
    CompareParams {
        geo_accuracy: 10_000,
        distance_interval: 50,
        use_external_filter: true,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        debounce_ms: 10,
        update_interval_ms: 10,
        worker_threads: 4,
        ..Default::default()
    }
}

fn start<T>(
    config: EngineConfig,
    tracks: Arc<T>,
    store: Arc<TourLibrary>,
) -> (RequestController, Receiver<CompareEvent>)
where
    T: TrackProvider + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let (tx, rx) = mpsc::channel();
    let controller =
        RequestController::with_params(config, params(), tracks, store, channel_callback(tx))
            .unwrap();
    (controller, rx)
}

/// Collect events until `request_id` completes; returns them all.
fn events_until_completed(rx: &Receiver<CompareEvent>, request_id: u64) -> Vec<CompareEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx
            .recv_timeout(TIMEOUT)
            .unwrap_or_else(|_| panic!("request {} never completed", request_id));
        let done = matches!(
            &event,
            CompareEvent::RequestCompleted { request_id: id, .. } if *id == request_id
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

fn completed_summary(events: &[CompareEvent]) -> CompareSummary {
    events
        .iter()
        .find_map(|e| match e {
            CompareEvent::RequestCompleted { results, .. } => Some(results.clone()),
            _ => None,
        })
        .expect("no completion event")
}

/// `(count, bucket_count, reference_len, reference_distance_m)`
fn candidates_ready(
    events: &[CompareEvent],
    request_id: u64,
) -> Option<(usize, usize, usize, i64)> {
    events.iter().find_map(|e| match e {
        CompareEvent::CandidatesReady {
            request_id: id,
            count,
            bucket_count,
            reference_len,
            reference_distance_m,
            ..
        } if *id == request_id => Some((
            *count,
            *bucket_count,
            *reference_len,
            *reference_distance_m,
        )),
        _ => None,
    })
}

// ============================================================================
// Matching
// ============================================================================

#[test]
fn test_exact_containment_and_ranking() {
    let library = standard_library();
    let (controller, rx) = start(fast_config(), library.clone(), library);

    let id = controller.select(ReferenceSelection::new(1, 5, 25)).unwrap();
    let events = events_until_completed(&rx, id);

    let (count, bucket_count, reference_len, distance) = candidates_ready(&events, id).unwrap();
    assert_eq!(count, 4, "tours 1, 2, 3 and 5 share buckets");
    assert!(bucket_count > 0);
    assert_eq!(reference_len, 20);
    // 19 steps of ~55.6 m
    assert!((1_000..1_100).contains(&distance), "distance {}", distance);

    let summary = completed_summary(&events);
    let order: Vec<TourId> = summary.results.iter().map(|r| r.tour_id).collect();
    assert_eq!(order, vec![1, 2, 3, 5]);

    let own = summary.get(1).unwrap();
    assert_eq!(own.score, Score::Computed(0));
    assert_eq!(own.matched.unwrap().offset, 5);

    let containing = summary.get(2).unwrap();
    assert_eq!(containing.score, Score::Computed(0));
    let matched = containing.matched.unwrap();
    assert_eq!(matched.offset, 15);
    assert_eq!(matched.first_index, 15);
    assert_eq!(matched.last_index, 34);
    assert_eq!(containing.avg_heart_rate, Some(150.0));
    assert!(containing.avg_speed.unwrap() > 5.0);

    let parallel = summary.get(3).unwrap();
    assert_eq!(parallel.score, Score::Computed(3 * 20));
    assert_eq!(summary.max_diff, Some(60));
    assert_eq!(summary.relative_diff(parallel), Some(100.0));
    assert_eq!(summary.relative_diff(containing), Some(0.0));

    assert_eq!(summary.get(5).unwrap().score, Score::NotComparable);
    assert!(summary.get(4).is_none());

    assert_eq!(controller.state(), Some(RequestState::Done));
    assert_eq!(controller.latest_summary().unwrap().request_id, id);
}

#[test]
fn test_western_southern_reference_finds_itself() {
    let _ = env_logger::builder().is_test(true).try_init();
    let library = Arc::new(TourLibrary::new(100));
    // just past cell boundaries, where truncating toward zero would move
    // every point into the neighbouring cell
    library.insert(line(1, -33.0052, -100.0052, 40)).unwrap();
    library.insert(line(2, -33.0052, 100.0052, 40)).unwrap();

    let coarse = CompareParams {
        geo_accuracy: 100,
        ..params()
    };
    let (tx, rx) = mpsc::channel();
    let controller = RequestController::with_params(
        fast_config(),
        coarse,
        library.clone(),
        library,
        channel_callback(tx),
    )
    .unwrap();

    let id = controller.select(ReferenceSelection::new(1, 5, 25)).unwrap();
    let events = events_until_completed(&rx, id);

    let (count, bucket_count, _, _) = candidates_ready(&events, id).unwrap();
    assert_eq!(count, 1);
    assert!(bucket_count > 0);

    let summary = completed_summary(&events);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.get(1).unwrap().score, Score::Computed(0));
}

#[test]
fn test_pool_matches_sequential_run() {
    // deterministic jitter so diffs differ per tour
    let mut seed: u64 = 42;
    let mut jitter = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((seed >> 33) % 7) as f64 * 0.0001
    };

    let library = Arc::new(TourLibrary::new(100));
    library.insert(line(1, LAT, LON, 50)).unwrap();
    for tour_id in 2..40 {
        let shift = (tour_id % 9) as f64 * 0.0005;
        let points: Vec<GpsPoint> = (0..60)
            .map(|i| GpsPoint::new(LAT - shift + i as f64 * 0.0005, LON + jitter()))
            .collect();
        library.insert(RecordedTrack::new(tour_id, &points)).unwrap();
    }

    let (controller, rx) = start(fast_config(), library.clone(), library.clone());
    let selection = ReferenceSelection::new(1, 10, 40);
    let id = controller.select(selection).unwrap();
    let pooled = completed_summary(&events_until_completed(&rx, id));

    let reference = library.load_track(1).unwrap();
    let segment = normalize_track(&reference, 10, 40, 10_000, 50).unwrap();
    let buckets = compute_buckets(&reference, 10, 40, 100);
    let request = CompareRequest {
        token: Arc::new(RequestToken::new(99)),
        selection,
        params: params(),
        candidate_tour_ids: library.query_candidate_tour_ids(&buckets, None).unwrap(),
        reference: segment,
        buckets,
    };
    let sequential: HashMap<TourId, Score> = compare_sequential(&request, library.as_ref())
        .into_iter()
        .map(|r| (r.tour_id, r.score))
        .collect();

    assert_eq!(pooled.results.len(), sequential.len());
    for result in &pooled.results {
        assert_eq!(Some(&result.score), sequential.get(&result.tour_id));
    }
}

// ============================================================================
// Supersession and debounce
// ============================================================================

#[test]
fn test_superseded_request_is_silent_after_cancel() {
    let library = standard_library();
    let config = EngineConfig {
        debounce_ms: 0,
        ..fast_config()
    };
    let (controller, rx) = start(config, library.clone(), library);

    let first = controller.select(ReferenceSelection::new(1, 0, 30)).unwrap();
    let second = controller.select(ReferenceSelection::new(1, 2, 32)).unwrap();
    let events = events_until_completed(&rx, second);

    let canceled_at = events
        .iter()
        .position(|e| matches!(e, CompareEvent::RequestCanceled { request_id } if *request_id == first))
        .expect("first request was not canceled");

    assert!(events[canceled_at + 1..]
        .iter()
        .all(|e| e.request_id() != first));
    assert_eq!(completed_summary(&events).request_id, second);
}

#[test]
fn test_debounce_keeps_last_selection_of_burst() {
    let library = standard_library();
    let config = EngineConfig {
        debounce_ms: 200,
        ..fast_config()
    };
    let (controller, rx) = start(config, library.clone(), library);

    let mut ids = Vec::new();
    for left in 0..5 {
        ids.push(controller.select(ReferenceSelection::new(1, left, 20)).unwrap());
    }
    let last = *ids.last().unwrap();
    let events = events_until_completed(&rx, last);

    for id in &ids[..4] {
        assert!(events
            .iter()
            .any(|e| matches!(e, CompareEvent::RequestCanceled { request_id } if request_id == id)));
        assert!(candidates_ready(&events, *id).is_none());
    }
    assert!(candidates_ready(&events, last).is_some());
    assert_eq!(controller.current_generation(), last);
}

#[test]
fn test_params_change_reruns_selection() {
    let library = standard_library();
    let (controller, rx) = start(fast_config(), library.clone(), library);

    let first = controller.select(ReferenceSelection::new(1, 5, 25)).unwrap();
    let events = events_until_completed(&rx, first);
    let (_, _, fine_len, _) = candidates_ready(&events, first).unwrap();

    let coarse = CompareParams {
        distance_interval: 200,
        ..params()
    };
    let second = controller.set_params(coarse).unwrap().expect("no rerun");
    assert!(second > first);

    let events = events_until_completed(&rx, second);
    let (_, _, coarse_len, _) = candidates_ready(&events, second).unwrap();
    assert!(coarse_len < fine_len);
    assert_eq!(controller.latest_summary().unwrap().request_id, second);

    // same params again: nothing happens
    assert_eq!(controller.set_params(coarse).unwrap(), None);
}

// ============================================================================
// Empty input
// ============================================================================

#[test]
fn test_empty_selection_completes_without_results() {
    let library = standard_library();
    let (controller, rx) = start(fast_config(), library.clone(), library);

    let id = controller.select(ReferenceSelection::new(1, 7, 7)).unwrap();
    let events = events_until_completed(&rx, id);

    assert_eq!(candidates_ready(&events, id), Some((0, 0, 0, 0)));
    let summary = completed_summary(&events);
    assert!(summary.results.is_empty());
    assert_eq!(summary.max_diff, None);
}

#[test]
fn test_unknown_reference_completes_empty() {
    let library = standard_library();
    let (controller, rx) = start(fast_config(), library.clone(), library);

    let id = controller.select(ReferenceSelection::new(404, 0, 10)).unwrap();
    let summary = completed_summary(&events_until_completed(&rx, id));
    assert!(summary.results.is_empty());
}

#[test]
fn test_external_filter() {
    let library = standard_library();
    let (controller, rx) = start(fast_config(), library.clone(), library);

    let reject_all: TourFilter = Arc::new(|_| false);
    controller.set_filter(Some(reject_all)).unwrap();
    let id = controller.select(ReferenceSelection::new(1, 5, 25)).unwrap();
    let events = events_until_completed(&rx, id);
    assert_eq!(candidates_ready(&events, id).unwrap().0, 0);
    assert!(completed_summary(&events).results.is_empty());

    // filter installed but switched off
    let unfiltered = CompareParams {
        use_external_filter: false,
        ..params()
    };
    let id = controller.set_params(unfiltered).unwrap().unwrap();
    let events = events_until_completed(&rx, id);
    assert_eq!(completed_summary(&events).results.len(), 4);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_config_errors_surface_synchronously() {
    let library = Arc::new(TourLibrary::new(200));
    let (tx, rx) = mpsc::channel();
    let config = EngineConfig {
        bucket_resolution: 200,
        ..fast_config()
    };
    let coarse_accuracy = CompareParams {
        geo_accuracy: 100,
        ..params()
    };

    let result = RequestController::with_params(
        config.clone(),
        coarse_accuracy,
        library.clone(),
        library.clone(),
        channel_callback(tx.clone()),
    );
    assert!(matches!(result, Err(GeoCompareError::ConfigError { .. })));

    let controller =
        RequestController::new(config, library.clone(), library, channel_callback(tx)).unwrap();
    let out_of_range = CompareParams {
        distance_interval: 5,
        ..params()
    };
    assert!(matches!(
        controller.set_params(out_of_range),
        Err(GeoCompareError::ConfigError { .. })
    ));
    assert_eq!(controller.current_generation(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

/// Track access that fails for one tour and panics for another.
struct FlakyTracks {
    inner: Arc<TourLibrary>,
    missing: TourId,
    panicking: TourId,
}

impl TrackProvider for FlakyTracks {
    fn load_track(&self, tour_id: TourId) -> Result<Arc<RecordedTrack>> {
        if tour_id == self.missing {
            return Err(GeoCompareError::TrackNotFound { tour_id });
        }
        self.inner.load_track(tour_id)
    }

    fn normalize(
        &self,
        track: &RecordedTrack,
        first_index: usize,
        last_index: usize,
        geo_accuracy: i64,
        distance_interval: i64,
    ) -> Result<NormalizedSegment> {
        if track.tour_id == self.panicking {
            panic!("corrupt samples in tour {}", track.tour_id);
        }
        normalize_track(track, first_index, last_index, geo_accuracy, distance_interval)
    }
}

#[test]
fn test_failing_candidates_are_skipped() {
    let library = standard_library();
    let tracks = Arc::new(FlakyTracks {
        inner: library.clone(),
        missing: 3,
        panicking: 5,
    });
    let (controller, rx) = start(fast_config(), tracks, library);

    let id = controller.select(ReferenceSelection::new(1, 5, 25)).unwrap();
    let summary = completed_summary(&events_until_completed(&rx, id));

    assert_eq!(summary.compared, 2);
    assert_eq!(summary.skipped, 2);
    let order: Vec<TourId> = summary.results.iter().map(|r| r.tour_id).collect();
    assert_eq!(order, vec![1, 2]);
}

#[test]
fn test_shutdown_is_idempotent() {
    let library = standard_library();
    let (mut controller, _rx) = start(fast_config(), library.clone(), library);
    controller.select(ReferenceSelection::new(1, 5, 25)).unwrap();
    controller.shutdown();
    controller.shutdown();
    assert!(matches!(
        controller.select(ReferenceSelection::new(1, 6, 26)),
        Err(GeoCompareError::WorkerUnavailable { .. })
    ));
}
