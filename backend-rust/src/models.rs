//! Data model (spec.md §3). Every entity gets an explicit record struct
//! decoded once at the Store boundary (spec.md §9 — no dynamically typed
//! rows leaking past `store.rs`) and `Serialize` for the subset exposed over
//! ReadAPI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::geomath::Direction;

#[derive(Debug, Clone, FromRow)]
pub struct RawGpsPoint {
    pub id: i64,
    pub device_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub recorded_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub batch_id: Option<String>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing_raw: Option<f64>,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedPolyline {
    pub id: i64,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub encoded_polyline: String,
    /// WKT `LINESTRING(lon lat, ...)`, WGS-84.
    pub geometry_wkt: String,
    pub bearing: f64,
    pub confidence: f64,
    pub point_count: i64,
    pub batch_id: String,
    pub osrm_duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Row shape as it comes back from `cached_polylines` before being
/// assembled into the public `CachedPolyline`.
#[derive(Debug, Clone, FromRow)]
pub struct CachedPolylineRow {
    pub id: i64,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub encoded_polyline: String,
    pub geometry_wkt: String,
    pub bearing: f64,
    pub osrm_confidence: f64,
    pub point_count: i64,
    pub batch_id: String,
    pub osrm_duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl From<CachedPolylineRow> for CachedPolyline {
    fn from(r: CachedPolylineRow) -> Self {
        CachedPolyline {
            id: r.id,
            device_id: r.device_id,
            start_time: r.start_time,
            end_time: r.end_time,
            encoded_polyline: r.encoded_polyline,
            geometry_wkt: r.geometry_wkt,
            bearing: r.bearing,
            confidence: r.osrm_confidence,
            point_count: r.point_count,
            batch_id: r.batch_id,
            osrm_duration_ms: r.osrm_duration_ms,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RoadSegment {
    pub id: i64,
    pub municipality_id: String,
    pub geometry_wkt: String,
    pub bearing: f64,
    pub street_name: Option<String>,
    pub road_classification: Option<String>,
    pub segment_length: f64,
    pub osm_way_id: Option<i64>,
    pub last_serviced_forward: Option<DateTime<Utc>>,
    pub last_serviced_reverse: Option<DateTime<Utc>>,
    pub last_serviced_device_id: Option<String>,
    pub plow_count_today: i32,
    pub plow_count_total: i32,
    pub last_reset_date: chrono::NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SegmentUpdate {
    pub id: i64,
    pub segment_id: i64,
    pub polyline_id: i64,
    pub device_id: String,
    pub direction: String,
    pub overlap_percentage: f64,
    pub timestamp: DateTime<Utc>,
}

impl SegmentUpdate {
    pub fn direction(&self) -> Option<Direction> {
        match self.direction.as_str() {
            "forward" => Some(Direction::Forward),
            "reverse" => Some(Direction::Reverse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Failed,
    Skipped,
    Abandoned,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
            ProcessingStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingLogEntry {
    pub batch_id: String,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub coordinate_count: i64,
    pub status: ProcessingStatus,
    pub processing_started_at: DateTime<Utc>,
    pub osrm_calls: i32,
    pub osrm_success_rate: f64,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub duration_ms: i64,
}

/// Intersection result from `Store::intersecting_segments` (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct SegmentIntersection {
    pub segment_id: i64,
    pub segment_bearing: f64,
    pub overlap_percentage: f64,
}

/// Per-segment result of `Store::activate_polyline` (spec.md §4.3/§4.6): one
/// entry per segment the polyline intersected, regardless of whether the
/// monotone-advance rule actually applied.
#[derive(Debug, Clone)]
pub struct SegmentActivationOutcome {
    pub segment_id: i64,
    pub direction: Direction,
    pub applied: bool,
}

/// Aggregate counters for periodic stats reporting (spec.md §4.3, `stats()`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub raw_points_total: i64,
    pub raw_points_unprocessed: i64,
    pub polylines_total: i64,
    pub segments_serviced_today: i64,
    pub processing_failed_today: i64,
}
