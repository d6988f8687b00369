//! Sliding-window alignment of a reference segment against a candidate.
//!
//! Every start offset of the candidate is scored by the sum of elementwise
//! Manhattan distances in quantized units. The lowest score wins; ties go
//! to the earliest offset. The result is a relative similarity score, not
//! a distance in meters.

use crate::normalize::NormalizedSegment;
use crate::request::{CancellationToken, Score};

/// Result of aligning one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Best window found
    Matched { offset: usize, diff: i64 },
    /// Candidate is shorter than the reference (or either side is empty)
    NotComparable,
    /// Request was canceled while scanning
    Canceled,
}

impl Alignment {
    pub fn score(&self) -> Score {
        match self {
            Alignment::Matched { diff, .. } => Score::Computed(*diff),
            Alignment::NotComparable => Score::NotComparable,
            Alignment::Canceled => Score::Pending,
        }
    }
}

/// Find the candidate window that best matches the reference.
///
/// `O(N·M)`; the cancellation token is polled once per offset. Summing for
/// an offset stops as soon as it can no longer beat the current best,
/// which leaves the winner unchanged because ties never replace it.
pub fn align_segments(
    reference: &NormalizedSegment,
    candidate: &NormalizedSegment,
    cancel: &CancellationToken,
) -> Alignment {
    let m = reference.len();
    let n = candidate.len();

    if m == 0 || n < m {
        return Alignment::NotComparable;
    }

    let ref_lat = reference.lat();
    let ref_lon = reference.lon();
    let cand_lat = candidate.lat();
    let cand_lon = candidate.lon();

    let mut best: Option<(usize, i64)> = None;

    for offset in 0..=n - m {
        if cancel.is_canceled() {
            return Alignment::Canceled;
        }

        let bound = best.map_or(i64::MAX, |(_, diff)| diff);
        let mut score: i64 = 0;

        for k in 0..m {
            score = score
                .saturating_add(distance(ref_lat[k], cand_lat[offset + k]))
                .saturating_add(distance(ref_lon[k], cand_lon[offset + k]));
            if score >= bound {
                break;
            }
        }

        if score < bound {
            best = Some((offset, score));
        }
    }

    match best {
        Some((offset, diff)) => Alignment::Matched { offset, diff },
        // every window saturated at i64::MAX
        None => Alignment::Matched {
            offset: 0,
            diff: i64::MAX,
        },
    }
}

/// `|a - b|`, saturating at `i64::MAX`.
fn distance(a: i64, b: i64) -> i64 {
    i64::try_from(a.abs_diff(b)).unwrap_or(i64::MAX)
}
