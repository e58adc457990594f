use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Outcome of a pre-flight conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    Free,
    Conflict { booking: BookingRef },
}

/// First booking holding a slot that overlaps `slot`, half-open comparison.
/// Cancelled rows and the row named by `exclude` are ignored.
pub fn find_conflict<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    slot: &Slot,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    bookings.into_iter().find(|b| {
        b.status.occupies_slot() && Some(b.id) != exclude && b.slot().overlaps(slot)
    })
}

/// Free gaps inside `window`, left to right.
///
/// Walks the occupying bookings in start order with a cursor that begins at
/// the window start. A booking starting past the cursor emits the gap before
/// it; the cursor then moves to the furthest end seen so far. Gaps are clamped
/// to the window and never empty.
pub fn free_gaps<'a>(bookings: impl IntoIterator<Item = &'a Booking>, window: TimeRange) -> Vec<TimeRange> {
    let mut occupied: Vec<TimeRange> = bookings
        .into_iter()
        .filter(|b| b.status.occupies_slot())
        .map(|b| b.range())
        .collect();
    occupied.sort_by_key(|r| r.start);

    let mut gaps = Vec::new();
    let mut cursor = window.start;
    for range in occupied {
        if cursor >= window.end {
            break;
        }
        let gap_end = range.start.min(window.end);
        if gap_end > cursor {
            gaps.push(TimeRange::new(cursor, gap_end));
        }
        cursor = cursor.max(range.end);
    }
    if cursor < window.end {
        gaps.push(TimeRange::new(cursor, window.end));
    }
    gaps
}

/// Whole bookable minutes across a list of gaps.
pub fn total_minutes(gaps: &[TimeRange]) -> i64 {
    gaps.iter().map(TimeRange::duration_minutes).sum()
}
