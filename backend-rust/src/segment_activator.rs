//! SegmentActivator (spec.md §4.6's second half): given a matched polyline's
//! geometry, finds every road segment it crosses and applies the
//! monotone-advance rule to each, recording a `segment_updates` row for the
//! ones that actually advanced something.
//!
//! The actual intersection query plus every per-segment advance/update write
//! runs inside `Store::activate_polyline` as one transaction (spec.md §4.3's
//! durability requirement — a partial activation must never be visible or
//! partially committed); this module only classifies direction-independent
//! outcomes into events and a summary count.

use crate::events::{Event, EventSink};
use crate::error::StoreError;
use crate::store::Store;

pub struct ActivationResult {
    pub segments_touched: usize,
    pub segments_advanced: usize,
}

/// `polyline_bearing` is the overall direction of travel for the matched
/// route (`PolylineWriter::bearing`); each intersected segment's own
/// bearing decides forward vs. reverse independently (spec.md §4.1).
pub async fn activate_segments(
    store: &dyn Store,
    geometry_wkt: &str,
    polyline_id: i64,
    polyline_bearing: f64,
    device_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    events: &dyn EventSink,
) -> Result<ActivationResult, StoreError> {
    let outcomes = store
        .activate_polyline(geometry_wkt, polyline_id, polyline_bearing, device_id, timestamp)
        .await?;

    let mut segments_advanced = 0usize;
    for outcome in &outcomes {
        if outcome.applied {
            events.emit(Event::SegmentAdvanced {
                segment_id: outcome.segment_id,
                direction: outcome.direction.as_str(),
            });
            segments_advanced += 1;
        }
    }

    Ok(ActivationResult { segments_touched: outcomes.len(), segments_advanced })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StderrEventSink;
    use crate::models::SegmentIntersection;
    use crate::store::fake::FakeStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn activation_advances_only_newer_timestamps() {
        let store = FakeStore::default();
        *store.intersections.lock().unwrap() = vec![SegmentIntersection {
            segment_id: 1,
            segment_bearing: 90.0,
            overlap_percentage: 80.0,
        }];

        let t1 = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 15, 11, 0, 0).unwrap();

        let result = activate_segments(&store, "LINESTRING(0 0, 1 1)", 1, 90.0, "D1", t1, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(result.segments_advanced, 1);

        // An older timestamp for the same direction must not advance it.
        let result = activate_segments(&store, "LINESTRING(0 0, 1 1)", 2, 90.0, "D1", t0, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(result.segments_advanced, 0);
        assert_eq!(result.segments_touched, 1);
    }

    #[tokio::test]
    async fn no_intersections_advances_nothing() {
        let store = FakeStore::default();
        let now = Utc::now();
        let result = activate_segments(&store, "LINESTRING(0 0, 1 1)", 1, 90.0, "D1", now, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(result.segments_touched, 0);
        assert_eq!(result.segments_advanced, 0);
    }

    #[tokio::test]
    async fn reverse_direction_tracked_independently_of_forward() {
        let store = FakeStore::default();
        *store.intersections.lock().unwrap() = vec![SegmentIntersection {
            segment_id: 1,
            segment_bearing: 0.0,
            overlap_percentage: 100.0,
        }];
        let now = Utc::now();

        // polyline_bearing 180 vs segment_bearing 0 => reverse.
        let result = activate_segments(&store, "LINESTRING(0 0, 1 1)", 1, 180.0, "D1", now, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(result.segments_advanced, 1);

        // Forward direction on the same segment is independent and still advances.
        let result = activate_segments(&store, "LINESTRING(0 0, 1 1)", 2, 5.0, "D1", now, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(result.segments_advanced, 1);
    }

    #[tokio::test]
    async fn rerunning_activation_on_same_polyline_is_idempotent() {
        let store = FakeStore::default();
        *store.intersections.lock().unwrap() = vec![SegmentIntersection {
            segment_id: 1,
            segment_bearing: 90.0,
            overlap_percentage: 60.0,
        }];
        let t1 = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();

        let first = activate_segments(&store, "LINESTRING(0 0, 1 1)", 7, 90.0, "D1", t1, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(first.segments_advanced, 1);
        let segment_state_after_first = store.segments.lock().unwrap().get(&1).cloned();
        let updates_after_first = store.segment_updates.lock().unwrap().len();

        // Re-running activation for the exact same polyline_id/timestamp must
        // not rewind or re-increment segment state, and must not append a
        // second segment_updates row for the same (segment_id, polyline_id).
        let second = activate_segments(&store, "LINESTRING(0 0, 1 1)", 7, 90.0, "D1", t1, &StderrEventSink)
            .await
            .unwrap();
        assert_eq!(second.segments_advanced, 0);
        assert_eq!(store.segments.lock().unwrap().get(&1).cloned(), segment_state_after_first);
        assert_eq!(store.segment_updates.lock().unwrap().len(), updates_after_first);
    }
}
