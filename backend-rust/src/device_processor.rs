//! DeviceProcessor (spec.md §4.6's state diagram): drives one device's
//! unprocessed points through BatchBuilder, MatcherClient, PolylineWriter,
//! and SegmentActivator. Runs entirely inside the Worker loop — no
//! suspension point here crosses a device boundary, so two devices never
//! interleave within this function.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::batch::{build_batches, Batch, BatchConfig};
use crate::config::ProcessingConfig;
use crate::error::StoreError;
use crate::events::{Event, EventSink};
use crate::matcher::{MatchOutcome, MatcherClient};
use crate::models::ProcessingLogEntry;
use crate::models::ProcessingStatus;
use crate::polyline_writer::prepare_polyline;
use crate::segment_activator::activate_segments;
use crate::store::Store;

const BACKOFF_SCHEDULE_MS: [u64; 3] = [50, 200, 800];

pub async fn process_device(
    store: &dyn Store,
    matcher: &dyn MatcherClient,
    events: &dyn EventSink,
    config: &ProcessingConfig,
    device_id: &str,
) {
    let anchor = match store.last_processed_point(device_id).await {
        Ok(a) => a,
        Err(e) => {
            events.emit(Event::BatchFailed { device_id, error: &e.to_string() });
            return;
        }
    };
    let unprocessed = match store.unprocessed_points(device_id).await {
        Ok(p) => p,
        Err(e) => {
            events.emit(Event::BatchFailed { device_id, error: &e.to_string() });
            return;
        }
    };
    if unprocessed.is_empty() {
        return;
    }

    let batch_config = BatchConfig {
        batch_size_max: config.batch_size_max,
        window_minutes_max: config.window_minutes_max,
        min_movement_m: config.min_movement_m,
        connect_gap_minutes_max: config.connect_gap_minutes_max,
    };
    let batches = build_batches(anchor.as_ref(), &unprocessed, &batch_config);

    for batch in batches {
        process_batch(store, matcher, events, config, device_id, batch).await;
    }
}

async fn process_batch(
    store: &dyn Store,
    matcher: &dyn MatcherClient,
    events: &dyn EventSink,
    config: &ProcessingConfig,
    device_id: &str,
    batch: Batch,
) {
    let batch_id = Uuid::new_v4().to_string();
    let start_time = batch.start_time();
    let end_time = batch.end_time();

    // Parked-vehicle short-circuit: skip the matcher entirely.
    if !batch.has_significant_movement(config.min_movement_m) {
        if let Err(e) = with_store_retry(|| store.mark_processed(&batch.new_point_ids, &batch_id)).await {
            events.emit(Event::BatchFailed { device_id, error: &e.to_string() });
            return;
        }
        let _ = store
            .log_processing(ProcessingLogEntry {
                batch_id: batch_id.clone(),
                device_id: device_id.to_string(),
                start_time,
                end_time,
                coordinate_count: batch.points.len() as i64,
                status: ProcessingStatus::Skipped,
                processing_started_at: Utc::now(),
                osrm_calls: 0,
                osrm_success_rate: 0.0,
                error_message: None,
                error_code: None,
                duration_ms: 0,
            })
            .await;
        events.emit(Event::BatchSkipped { device_id, reason: "no_significant_movement" });
        return;
    }

    let outcome = matcher.match_route(&batch.coordinates()).await;

    let matched = match outcome {
        MatchOutcome::Matched(ref m) if m.coordinates.len() >= 2 => Some(m.clone()),
        _ => None,
    };

    let Some(matched) = matched else {
        handle_match_failure(store, events, config, device_id, &batch, &batch_id, &outcome).await;
        return;
    };

    // WRITING
    let prepared = prepare_polyline(&batch, &matched, device_id, &batch_id);
    let geometry_wkt = prepared.geometry_wkt.clone();
    let bearing = prepared.bearing;

    let polyline_id = match with_store_retry(|| store.upsert_polyline(prepared.new_polyline.clone())).await {
        Ok(id) => id,
        Err(e) => {
            log_failed(store, device_id, &batch, &batch_id, start_time, end_time, &e.to_string(), "store_write").await;
            events.emit(Event::BatchFailed { device_id, error: &e.to_string() });
            return;
        }
    };

    // ACTIVATING
    if let Err(e) = with_store_retry(|| {
        activate_segments(store, &geometry_wkt, polyline_id, bearing, device_id, end_time, events)
    })
    .await
    {
        log_failed(store, device_id, &batch, &batch_id, start_time, end_time, &e.to_string(), "store_activate").await;
        events.emit(Event::BatchFailed { device_id, error: &e.to_string() });
        return;
    }

    // MARKING
    if let Err(e) = with_store_retry(|| store.mark_processed(&batch.new_point_ids, &batch_id)).await {
        events.emit(Event::BatchFailed { device_id, error: &e.to_string() });
        return;
    }

    let _ = store
        .log_processing(ProcessingLogEntry {
            batch_id: batch_id.clone(),
            device_id: device_id.to_string(),
            start_time,
            end_time,
            coordinate_count: batch.points.len() as i64,
            status: ProcessingStatus::Completed,
            processing_started_at: Utc::now(),
            osrm_calls: 1,
            osrm_success_rate: 1.0,
            error_message: None,
            error_code: None,
            duration_ms: matched.duration_ms,
        })
        .await;
    events.emit(Event::BatchMatched { device_id, polyline_id, point_count: batch.new_point_count() });
}

async fn handle_match_failure(
    store: &dyn Store,
    events: &dyn EventSink,
    config: &ProcessingConfig,
    device_id: &str,
    batch: &Batch,
    batch_id: &str,
    outcome: &MatchOutcome,
) {
    let start_time = batch.start_time();
    let end_time = batch.end_time();
    let (error_code, error_message) = match outcome {
        MatchOutcome::NoMatch => ("no_match", "matcher returned no route".to_string()),
        MatchOutcome::Matched(_) => ("degenerate_match", "matched geometry had fewer than 2 vertices".to_string()),
        MatchOutcome::TransportError { retryable: true } => ("transport_retryable", "matcher transport error".to_string()),
        MatchOutcome::TransportError { retryable: false } => ("transport_error", "matcher transport error".to_string()),
    };

    log_failed(store, device_id, batch, batch_id, start_time, end_time, &error_message, error_code).await;

    let failure_count = store
        .failure_count(device_id, start_time, end_time)
        .await
        .unwrap_or(1);

    if failure_count >= config.max_retries as i64 {
        if with_store_retry(|| store.mark_processed(&batch.new_point_ids, batch_id)).await.is_ok() {
            let _ = store
                .log_processing(ProcessingLogEntry {
                    batch_id: batch_id.to_string(),
                    device_id: device_id.to_string(),
                    start_time,
                    end_time,
                    coordinate_count: batch.points.len() as i64,
                    status: ProcessingStatus::Abandoned,
                    processing_started_at: Utc::now(),
                    osrm_calls: 1,
                    osrm_success_rate: 0.0,
                    error_message: Some(error_message),
                    error_code: Some(error_code.to_string()),
                    duration_ms: 0,
                })
                .await;
            events.emit(Event::BatchAbandoned { device_id, failure_count });
        }
    } else {
        events.emit(Event::BatchFailed { device_id, error: &error_message });
    }
}

async fn log_failed(
    store: &dyn Store,
    device_id: &str,
    batch: &Batch,
    batch_id: &str,
    start_time: chrono::DateTime<Utc>,
    end_time: chrono::DateTime<Utc>,
    error_message: &str,
    error_code: &str,
) {
    let _ = store
        .log_processing(ProcessingLogEntry {
            batch_id: batch_id.to_string(),
            device_id: device_id.to_string(),
            start_time,
            end_time,
            coordinate_count: batch.points.len() as i64,
            status: ProcessingStatus::Failed,
            processing_started_at: Utc::now(),
            osrm_calls: 1,
            osrm_success_rate: 0.0,
            error_message: Some(error_message.to_string()),
            error_code: Some(error_code.to_string()),
            duration_ms: 0,
        })
        .await;
}

/// Retries a Store operation on `StoreError::Transient` with the fixed
/// backoff schedule from spec.md §7, escalating to the final error once the
/// schedule is exhausted.
async fn with_store_retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < BACKOFF_SCHEDULE_MS.len() => {
                tokio::time::sleep(Duration::from_millis(BACKOFF_SCHEDULE_MS[attempt])).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StderrEventSink;
    use crate::matcher::fake::FakeMatcherClient;
    use crate::matcher::Matched;
    use crate::models::RawGpsPoint;
    use crate::store::fake::FakeStore;
    use chrono::TimeZone;

    fn config() -> ProcessingConfig {
        ProcessingConfig {
            batch_size_max: 5,
            window_minutes_max: 2,
            min_movement_m: 50.0,
            connect_gap_minutes_max: 5,
            max_retries: 3,
            stats_interval_ms: 300_000,
        }
    }

    fn point(id: i64, lon: f64, lat: f64, secs_offset: i64, processed: bool) -> RawGpsPoint {
        let base = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        RawGpsPoint {
            id,
            device_id: "D1".into(),
            longitude: lon,
            latitude: lat,
            recorded_at: base + chrono::Duration::seconds(secs_offset),
            received_at: base + chrono::Duration::seconds(secs_offset),
            processed,
            batch_id: None,
            altitude: None,
            speed: None,
            bearing_raw: None,
            accuracy: None,
        }
    }

    #[tokio::test]
    async fn successful_match_marks_points_processed_and_writes_polyline() {
        let store = FakeStore::default();
        store.points.lock().unwrap().extend(vec![
            point(1, -72.500, 43.700, 0, false),
            point(2, -72.499, 43.701, 30, false),
        ]);
        let matched = MatchOutcome::Matched(Matched {
            coordinates: vec![
                crate::geomath::Vertex::new(43.700, -72.500),
                crate::geomath::Vertex::new(43.701, -72.499),
            ],
            confidence: 0.95,
            duration_ms: 10,
        });
        let matcher = FakeMatcherClient::new(vec![matched]);

        process_device(&store, &matcher, &StderrEventSink, &config(), "D1").await;

        let points = store.points.lock().unwrap();
        assert!(points.iter().all(|p| p.processed));
        assert_eq!(store.polylines.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parked_vehicle_skips_matcher() {
        let store = FakeStore::default();
        store.points.lock().unwrap().extend(vec![
            point(1, -72.500, 43.700, 0, false),
            point(2, -72.500, 43.700, 30, false),
        ]);
        let matcher = FakeMatcherClient::new(vec![MatchOutcome::NoMatch]);

        process_device(&store, &matcher, &StderrEventSink, &config(), "D1").await;

        assert!(store.points.lock().unwrap().iter().all(|p| p.processed));
        assert!(store.polylines.lock().unwrap().is_empty());
        let log = store.processing_log.lock().unwrap();
        assert!(log.values().any(|e| e.status == ProcessingStatus::Skipped));
    }

    #[tokio::test]
    async fn repeated_no_match_abandons_after_max_retries() {
        let store = FakeStore::default();
        store.points.lock().unwrap().extend(vec![
            point(1, -72.500, 43.700, 0, false),
            point(2, -72.499, 43.701, 30, false),
        ]);
        let matcher = FakeMatcherClient::new(vec![MatchOutcome::NoMatch]);
        let cfg = config();

        // Three worker iterations over the same still-unprocessed points:
        // a failed MATCHING round never marks points processed, so the
        // exact same batch (device, start_time, end_time) is retried.
        for _ in 0..3 {
            process_device(&store, &matcher, &StderrEventSink, &cfg, "D1").await;
        }

        let log = store.processing_log.lock().unwrap();
        assert!(log.values().any(|e| e.status == ProcessingStatus::Abandoned));
    }
}
