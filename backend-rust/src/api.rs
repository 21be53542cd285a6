//! ReadAPI (spec.md §4.8/§6): read-only HTTP surface over whatever the
//! pipeline has already written. Never blocks or errors on upstream
//! pipeline failure (spec.md §7) — it just returns what's in the cache.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::{CachedPolyline, RoadSegment};
use crate::store::Store;

static STARTUP_MS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub config: Arc<ApiConfig>,
}

pub fn router(state: ApiState) -> Router {
    let startup_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    STARTUP_MS.store(startup_ms, std::sync::atomic::Ordering::Relaxed);

    Router::new()
        .route("/health", get(health_check))
        .route("/paths/encoded", get(paths_encoded))
        .route("/segments", get(segments_collection))
        .route("/segments/:id", get(segment_by_id))
        .route("/polylines/:id", get(polyline_by_id))
        .route("/boundary", get(boundary))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    let startup = STARTUP_MS.load(std::sync::atomic::Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    let mode = std::env::var("BACKEND_MODE").unwrap_or_else(|_| "pipeline".into());
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": mode,
        "uptimeSecs": uptime_secs,
    }))
}

#[derive(Debug, Deserialize)]
struct PathsQuery {
    device_id: Option<String>,
    hours: Option<i64>,
}

/// `GET /paths/encoded?device_id=<id>&hours=<int>` (spec.md §4.8).
/// Batches are ordered by `start_time` within each device; a cached
/// polyline only exists once it was successfully matched, so every
/// returned batch is `success: true` and `coverage` is always "100%".
async fn paths_encoded(
    State(state): State<ApiState>,
    Query(query): Query<PathsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = query.hours.unwrap_or(state.config.default_hours).clamp(1, state.config.max_hours);
    let since = Utc::now() - chrono::Duration::hours(hours);

    let polylines = state
        .store
        .polylines_since(query.device_id.as_deref(), since)
        .await?;

    let mut by_device: std::collections::BTreeMap<String, Vec<CachedPolyline>> = std::collections::BTreeMap::new();
    for polyline in polylines {
        by_device.entry(polyline.device_id.clone()).or_default().push(polyline);
    }

    let devices: Vec<_> = by_device
        .into_iter()
        .map(|(device, mut batches)| {
            batches.sort_by_key(|b| b.start_time);
            let start_time = batches.first().map(|b| b.start_time);
            let end_time = batches.last().map(|b| b.end_time);
            let coordinate_count: i64 = batches.iter().map(|b| b.point_count).sum();
            let total_batches = batches.len();

            let batch_json: Vec<_> = batches
                .iter()
                .map(|b| {
                    json!({
                        "id": b.id,
                        "success": true,
                        "encoded_polyline": b.encoded_polyline,
                        "confidence": b.confidence,
                    })
                })
                .collect();

            json!({
                "device": device,
                "start_time": start_time,
                "end_time": end_time,
                "coordinate_count": coordinate_count,
                "batches": batch_json,
                "matched_batches": total_batches,
                "total_batches": total_batches,
                "coverage": "100%",
                "cache_hits": total_batches,
            })
        })
        .collect();

    Ok(Json(json!({ "devices": devices })))
}

#[derive(Debug, Deserialize)]
struct SegmentsQuery {
    municipality: String,
    since: Option<String>,
    all: Option<bool>,
}

/// `GET /segments?municipality=<id>&since=<iso?>&all=<bool?>` (spec.md
/// §4.8). Default filter: serviced within the last 7 days in either
/// direction; `since` overrides the cutoff; `all=true` disables filtering.
async fn segments_collection(
    State(state): State<ApiState>,
    Query(query): Query<SegmentsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let since = if query.all.unwrap_or(false) {
        None
    } else if let Some(raw) = query.since {
        Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|_| ApiError::BadRequest(format!("invalid `since`: {raw}")))?
                .with_timezone(&Utc),
        )
    } else {
        Some(Utc::now() - chrono::Duration::days(7))
    };

    let segments = state.store.segments_for_municipality(&query.municipality, since).await?;
    Ok(Json(segment_collection_geojson(&segments)))
}

async fn segment_by_id(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let segment = state.store.segment_by_id(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(segment_feature(&segment)))
}

async fn polyline_by_id(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let polyline = state.store.polyline_by_id(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({
        "id": polyline.id,
        "device_id": polyline.device_id,
        "start_time": polyline.start_time,
        "end_time": polyline.end_time,
        "encoded_polyline": polyline.encoded_polyline,
        "bearing": polyline.bearing,
        "confidence": polyline.confidence,
        "point_count": polyline.point_count,
        "batch_id": polyline.batch_id,
        "created_at": polyline.created_at,
    })))
}

/// `GET /boundary?municipality=<id>` is an external collaborator's endpoint
/// in spec.md §4.8 ("External collaborator writes this") — the core
/// ReadAPI doesn't own municipality boundary data, so this route reports
/// that explicitly rather than guessing at a boundary source.
async fn boundary() -> Result<impl IntoResponse, ApiError> {
    Err(ApiError::NotFound)
}

fn segment_collection_geojson(segments: &[RoadSegment]) -> serde_json::Value {
    json!({
        "type": "FeatureCollection",
        "features": segments.iter().map(segment_feature).collect::<Vec<_>>(),
    })
}

fn segment_feature(segment: &RoadSegment) -> serde_json::Value {
    json!({
        "type": "Feature",
        "geometry": {
            "type": "LineString",
            "coordinates": wkt_linestring_coordinates(&segment.geometry_wkt),
        },
        "properties": {
            "id": segment.id,
            "municipality_id": segment.municipality_id,
            "bearing": segment.bearing,
            "street_name": segment.street_name,
            "road_classification": segment.road_classification,
            "segment_length": segment.segment_length,
            "osm_way_id": segment.osm_way_id,
            "last_serviced_forward": segment.last_serviced_forward,
            "last_serviced_reverse": segment.last_serviced_reverse,
            "last_serviced_device_id": segment.last_serviced_device_id,
            "plow_count_today": segment.plow_count_today,
            "plow_count_total": segment.plow_count_total,
        },
    })
}

/// Store returns `LINESTRING(lon lat, lon lat, ...)` WKT (spec.md §4.3's
/// `ST_AsText`); GeoJSON wants the same ordering as a nested coordinate
/// array, so this is just a delimiter swap, not a projection.
fn wkt_linestring_coordinates(wkt: &str) -> Vec<[f64; 2]> {
    let inner = wkt
        .trim()
        .trim_start_matches("LINESTRING(")
        .trim_start_matches("LINESTRING (")
        .trim_end_matches(')');
    inner
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.trim().split_whitespace();
            let lon: f64 = parts.next()?.parse().ok()?;
            let lat: f64 = parts.next()?.parse().ok()?;
            Some([lon, lat])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wkt_linestring_parses_coordinate_pairs() {
        let coords = wkt_linestring_coordinates("LINESTRING(-72.5 43.7, -72.499 43.701)");
        assert_eq!(coords, vec![[-72.5, 43.7], [-72.499, 43.701]]);
    }
}
