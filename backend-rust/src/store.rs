//! Store (spec.md §4.3): the only component that speaks SQL/PostGIS.
//! Segment activation for a single polyline runs inside one transaction
//! (§4.3's durability requirement); the monotone-advance rule takes a
//! row-level lock on `road_segments` (§5's shared-resource policy).
//!
//! Queries use the runtime-checked `sqlx::query_as`/`sqlx::query` API
//! rather than the `query!` macros — this crate has no `DATABASE_URL` or
//! `.sqlx` offline cache available at build time, so compile-time query
//! checking isn't an option here.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::StoreError;
use crate::geomath::direction_of;
use crate::models::{
    CachedPolyline, CachedPolylineRow, ProcessingLogEntry, RawGpsPoint, RoadSegment,
    SegmentActivationOutcome, SegmentIntersection, StoreStats,
};

/// A raw fix ready to be inserted by the ingest listener (spec.md §1's
/// supplement — the TCP/UDP ingest side is an external collaborator in the
/// core spec, but the named interface it must satisfy is `insert_raw_point`
/// followed by `JobQueue::offer`).
#[derive(Debug, Clone)]
pub struct NewRawGpsPoint {
    pub device_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub recorded_at: DateTime<Utc>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing_raw: Option<f64>,
    pub accuracy: Option<f64>,
}

/// A polyline ready to be upserted, already assembled by `PolylineWriter`.
#[derive(Debug, Clone)]
pub struct NewPolyline {
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub encoded_polyline: String,
    pub geometry_wkt: String,
    pub bearing: f64,
    pub confidence: f64,
    pub point_count: i64,
    pub batch_id: String,
    pub osrm_duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewSegmentUpdate {
    pub segment_id: i64,
    pub polyline_id: i64,
    pub device_id: String,
    pub direction: String,
    pub overlap_percentage: f64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts one raw fix; called by the ingest listener, never by the
    /// pipeline itself (spec.md §3: "written exactly once by the ingest
    /// side"). Returns the new row's id.
    async fn insert_raw_point(&self, point: NewRawGpsPoint) -> Result<i64, StoreError>;
    async fn last_processed_point(&self, device_id: &str) -> Result<Option<RawGpsPoint>, StoreError>;
    async fn unprocessed_points(&self, device_id: &str) -> Result<Vec<RawGpsPoint>, StoreError>;
    async fn mark_processed(&self, point_ids: &[i64], batch_id: &str) -> Result<(), StoreError>;
    async fn upsert_polyline(&self, polyline: NewPolyline) -> Result<i64, StoreError>;
    async fn intersecting_segments(&self, geometry_wkt: &str) -> Result<Vec<SegmentIntersection>, StoreError>;
    /// Applies the monotone-advance rule inside a transaction; returns
    /// whether the write was applied (spec.md §4.3/§4.6).
    async fn advance_segment(
        &self,
        segment_id: i64,
        direction: &str,
        timestamp: DateTime<Utc>,
        device_id: &str,
    ) -> Result<bool, StoreError>;
    async fn append_segment_update(&self, update: NewSegmentUpdate) -> Result<(), StoreError>;
    /// Runs the full segment-activation sequence for one matched polyline —
    /// `intersecting_segments`, then `advance_segment` + `append_segment_update`
    /// for each intersected segment — inside a single transaction, so a
    /// partial activation is never visible to a concurrent reader and never
    /// partially committed on failure (spec.md §4.3's durability requirement).
    async fn activate_polyline(
        &self,
        geometry_wkt: &str,
        polyline_id: i64,
        polyline_bearing: f64,
        device_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<SegmentActivationOutcome>, StoreError>;
    async fn log_processing(&self, entry: ProcessingLogEntry) -> Result<(), StoreError>;
    async fn failure_count(
        &self,
        device_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    // ReadAPI queries.
    async fn polylines_since(
        &self,
        device_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<CachedPolyline>, StoreError>;
    async fn polyline_by_id(&self, id: i64) -> Result<Option<CachedPolyline>, StoreError>;
    async fn segments_for_municipality(
        &self,
        municipality_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoadSegment>, StoreError>;
    async fn segment_by_id(&self, id: i64) -> Result<Option<RoadSegment>, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

const POLYLINE_COLUMNS: &str = r#"
    id, device_id, start_time, end_time, encoded_polyline,
    ST_AsText(geometry) AS geometry_wkt, bearing, osrm_confidence,
    point_count, batch_id, osrm_duration_ms, created_at
"#;

const SEGMENT_COLUMNS: &str = r#"
    id, municipality_id, ST_AsText(geometry) AS geometry_wkt, bearing,
    street_name, road_classification, segment_length, osm_way_id,
    last_serviced_forward, last_serviced_reverse, last_serviced_device_id,
    plow_count_today, plow_count_total, last_reset_date, created_at, updated_at
"#;

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Monotone-advance, executed against an open transaction so the caller
    /// can share it with `append_segment_update` (spec.md §4.3's single-
    /// transaction requirement for segment activation).
    async fn advance_segment_tx(
        tx: &mut Transaction<'_, Postgres>,
        segment_id: i64,
        direction: &str,
        timestamp: DateTime<Utc>,
        device_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let today: NaiveDate = Utc::now().date_naive();

        // Row lock serializes concurrent activations of the same segment
        // (spec.md §5's shared-resource policy).
        let row = sqlx::query(
            "SELECT last_serviced_forward, last_serviced_reverse, last_reset_date \
             FROM road_segments WHERE id = $1 FOR UPDATE",
        )
        .bind(segment_id)
        .fetch_one(&mut **tx)
        .await?;

        let current: Option<DateTime<Utc>> = if direction == "forward" {
            row.try_get("last_serviced_forward")?
        } else {
            row.try_get("last_serviced_reverse")?
        };
        let last_reset_date: NaiveDate = row.try_get("last_reset_date")?;

        let advances = match current {
            None => true,
            Some(existing) => timestamp > existing,
        };
        if !advances {
            return Ok(false);
        }

        // Daily reset inside the same transaction as the advance
        // (spec.md §4.6 edge policy, UTC day per Open Question resolution).
        let needs_reset = last_reset_date != today;
        let column = if direction == "forward" {
            "last_serviced_forward"
        } else {
            "last_serviced_reverse"
        };

        let sql = format!(
            "UPDATE road_segments SET \
                {column} = $2, \
                last_serviced_device_id = $3, \
                plow_count_today = CASE WHEN $4 THEN 1 ELSE plow_count_today + 1 END, \
                plow_count_total = plow_count_total + 1, \
                last_reset_date = CASE WHEN $4 THEN $5 ELSE last_reset_date END, \
                updated_at = now() \
             WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(segment_id)
            .bind(timestamp)
            .bind(device_id)
            .bind(needs_reset)
            .bind(today)
            .execute(&mut **tx)
            .await?;

        Ok(true)
    }

    /// Same query as `intersecting_segments`, scoped to an open transaction
    /// so `activate_polyline` reads a consistent snapshot alongside its
    /// writes.
    async fn intersecting_segments_tx(
        tx: &mut Transaction<'_, Postgres>,
        geometry_wkt: &str,
    ) -> Result<Vec<SegmentIntersection>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, bearing, \
                    ST_Length(ST_Intersection(geometry, ST_GeomFromText($1, 4326))::geography) \
                        / NULLIF(ST_Length(geometry::geography), 0) * 100 AS overlap_percentage \
             FROM road_segments \
             WHERE ST_Intersects(geometry, ST_GeomFromText($1, 4326))",
        )
        .bind(geometry_wkt)
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter()
            .map(|row| {
                let segment_id: i64 = row.try_get("id")?;
                let segment_bearing: f64 = row.try_get("bearing")?;
                let overlap_percentage: Option<f64> = row.try_get("overlap_percentage")?;
                Ok(SegmentIntersection {
                    segment_id,
                    segment_bearing,
                    overlap_percentage: overlap_percentage.unwrap_or(0.0),
                })
            })
            .collect()
    }

    /// Same insert as `append_segment_update`, scoped to an open transaction.
    async fn append_segment_update_tx(
        tx: &mut Transaction<'_, Postgres>,
        update: NewSegmentUpdate,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO segment_updates \
                (segment_id, polyline_id, device_id, direction, overlap_percentage, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (segment_id, polyline_id) DO NOTHING",
        )
        .bind(update.segment_id)
        .bind(update.polyline_id)
        .bind(&update.device_id)
        .bind(&update.direction)
        .bind(update.overlap_percentage)
        .bind(update.timestamp)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn row_to_polyline(row: sqlx::postgres::PgRow) -> Result<CachedPolylineRow, sqlx::Error> {
        use sqlx::FromRow;
        CachedPolylineRow::from_row(&row)
    }

    fn row_to_segment(row: sqlx::postgres::PgRow) -> Result<RoadSegment, sqlx::Error> {
        use sqlx::FromRow;
        RoadSegment::from_row(&row)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_raw_point(&self, point: NewRawGpsPoint) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO raw_gps \
                (device_id, longitude, latitude, recorded_at, received_at, \
                 processed, altitude, speed, bearing_raw, accuracy) \
             VALUES ($1, $2, $3, $4, now(), false, $5, $6, $7, $8) \
             RETURNING id",
        )
        .bind(&point.device_id)
        .bind(point.longitude)
        .bind(point.latitude)
        .bind(point.recorded_at)
        .bind(point.altitude)
        .bind(point.speed)
        .bind(point.bearing_raw)
        .bind(point.accuracy)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        row.try_get::<i64, _>("id").map_err(StoreError::from)
    }

    async fn last_processed_point(&self, device_id: &str) -> Result<Option<RawGpsPoint>, StoreError> {
        let row = sqlx::query_as::<_, RawGpsPoint>(
            "SELECT id, device_id, longitude, latitude, recorded_at, received_at, \
                    processed, batch_id, altitude, speed, bearing_raw, accuracy \
             FROM raw_gps WHERE device_id = $1 AND processed = true \
             ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row)
    }

    async fn unprocessed_points(&self, device_id: &str) -> Result<Vec<RawGpsPoint>, StoreError> {
        let rows = sqlx::query_as::<_, RawGpsPoint>(
            "SELECT id, device_id, longitude, latitude, recorded_at, received_at, \
                    processed, batch_id, altitude, speed, bearing_raw, accuracy \
             FROM raw_gps WHERE device_id = $1 AND processed = false \
             ORDER BY recorded_at ASC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows)
    }

    async fn mark_processed(&self, point_ids: &[i64], batch_id: &str) -> Result<(), StoreError> {
        if point_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE raw_gps SET processed = true, batch_id = $2 \
             WHERE id = ANY($1) AND processed = false",
        )
        .bind(point_ids)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn upsert_polyline(&self, polyline: NewPolyline) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO cached_polylines \
                (device_id, start_time, end_time, encoded_polyline, geometry, \
                 bearing, osrm_confidence, point_count, batch_id, osrm_duration_ms) \
             VALUES ($1, $2, $3, $4, ST_GeomFromText($5, 4326), $6, $7, $8, $9, $10) \
             ON CONFLICT (device_id, start_time, end_time) DO UPDATE SET \
                encoded_polyline = EXCLUDED.encoded_polyline, \
                geometry = EXCLUDED.geometry, \
                bearing = EXCLUDED.bearing, \
                osrm_confidence = EXCLUDED.osrm_confidence, \
                batch_id = EXCLUDED.batch_id \
             RETURNING id",
        )
        .bind(&polyline.device_id)
        .bind(polyline.start_time)
        .bind(polyline.end_time)
        .bind(&polyline.encoded_polyline)
        .bind(&polyline.geometry_wkt)
        .bind(polyline.bearing)
        .bind(polyline.confidence)
        .bind(polyline.point_count)
        .bind(&polyline.batch_id)
        .bind(polyline.osrm_duration_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.try_get::<i64, _>("id").map_err(StoreError::from)?)
    }

    async fn intersecting_segments(&self, geometry_wkt: &str) -> Result<Vec<SegmentIntersection>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, bearing, \
                    ST_Length(ST_Intersection(geometry, ST_GeomFromText($1, 4326))::geography) \
                        / NULLIF(ST_Length(geometry::geography), 0) * 100 AS overlap_percentage \
             FROM road_segments \
             WHERE ST_Intersects(geometry, ST_GeomFromText($1, 4326))",
        )
        .bind(geometry_wkt)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        rows.into_iter()
            .map(|row| {
                let segment_id: i64 = row.try_get("id")?;
                let segment_bearing: f64 = row.try_get("bearing")?;
                // Tangential touches can report a null/zero-length intersection;
                // they still activate the direction (spec.md §4.6 edge policy).
                let overlap_percentage: Option<f64> = row.try_get("overlap_percentage")?;
                Ok(SegmentIntersection {
                    segment_id,
                    segment_bearing,
                    overlap_percentage: overlap_percentage.unwrap_or(0.0),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn advance_segment(
        &self,
        segment_id: i64,
        direction: &str,
        timestamp: DateTime<Utc>,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let applied = Self::advance_segment_tx(&mut tx, segment_id, direction, timestamp, device_id)
            .await
            .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(applied)
    }

    async fn append_segment_update(&self, update: NewSegmentUpdate) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO segment_updates \
                (segment_id, polyline_id, device_id, direction, overlap_percentage, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (segment_id, polyline_id) DO NOTHING",
        )
        .bind(update.segment_id)
        .bind(update.polyline_id)
        .bind(&update.device_id)
        .bind(&update.direction)
        .bind(update.overlap_percentage)
        .bind(update.timestamp)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn activate_polyline(
        &self,
        geometry_wkt: &str,
        polyline_id: i64,
        polyline_bearing: f64,
        device_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<SegmentActivationOutcome>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let intersections = Self::intersecting_segments_tx(&mut tx, geometry_wkt)
            .await
            .map_err(StoreError::from)?;
        let mut outcomes = Vec::with_capacity(intersections.len());

        for intersection in &intersections {
            let direction = direction_of(polyline_bearing, intersection.segment_bearing);
            let applied = Self::advance_segment_tx(
                &mut tx,
                intersection.segment_id,
                direction.as_str(),
                timestamp,
                device_id,
            )
            .await
            .map_err(StoreError::from)?;

            if applied {
                Self::append_segment_update_tx(
                    &mut tx,
                    NewSegmentUpdate {
                        segment_id: intersection.segment_id,
                        polyline_id,
                        device_id: device_id.to_string(),
                        direction: direction.as_str().to_string(),
                        overlap_percentage: intersection.overlap_percentage,
                        timestamp,
                    },
                )
                .await
                .map_err(StoreError::from)?;
            }

            outcomes.push(SegmentActivationOutcome { segment_id: intersection.segment_id, direction, applied });
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok(outcomes)
    }

    async fn log_processing(&self, entry: ProcessingLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO processing_log \
                (batch_id, device_id, start_time, end_time, coordinate_count, status, \
                 processing_started_at, osrm_calls, osrm_success_rate, error_message, \
                 error_code, duration_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (batch_id) DO UPDATE SET \
                status = EXCLUDED.status, \
                osrm_calls = EXCLUDED.osrm_calls, \
                osrm_success_rate = EXCLUDED.osrm_success_rate, \
                error_message = EXCLUDED.error_message, \
                error_code = EXCLUDED.error_code, \
                duration_ms = EXCLUDED.duration_ms",
        )
        .bind(&entry.batch_id)
        .bind(&entry.device_id)
        .bind(entry.start_time)
        .bind(entry.end_time)
        .bind(entry.coordinate_count)
        .bind(entry.status.as_str())
        .bind(entry.processing_started_at)
        .bind(entry.osrm_calls)
        .bind(entry.osrm_success_rate)
        .bind(&entry.error_message)
        .bind(&entry.error_code)
        .bind(entry.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn failure_count(
        &self,
        device_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT count(*) AS count FROM processing_log \
             WHERE device_id = $1 AND start_time = $2 AND end_time = $3 AND status = 'failed'",
        )
        .bind(device_id)
        .bind(start_time)
        .bind(end_time)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.try_get::<i64, _>("count").map_err(StoreError::from)?)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT
                (SELECT count(*) FROM raw_gps) AS raw_points_total,
                (SELECT count(*) FROM raw_gps WHERE processed = false) AS raw_points_unprocessed,
                (SELECT count(*) FROM cached_polylines) AS polylines_total,
                (SELECT count(*) FROM road_segments
                    WHERE last_reset_date = CURRENT_DATE AND plow_count_today > 0) AS segments_serviced_today,
                (SELECT count(*) FROM processing_log
                    WHERE status = 'failed' AND processing_started_at > now() - interval '1 day') AS processing_failed_today",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(StoreStats {
            raw_points_total: row.try_get("raw_points_total").map_err(StoreError::from)?,
            raw_points_unprocessed: row.try_get("raw_points_unprocessed").map_err(StoreError::from)?,
            polylines_total: row.try_get("polylines_total").map_err(StoreError::from)?,
            segments_serviced_today: row.try_get("segments_serviced_today").map_err(StoreError::from)?,
            processing_failed_today: row.try_get("processing_failed_today").map_err(StoreError::from)?,
        })
    }

    async fn polylines_since(
        &self,
        device_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<CachedPolyline>, StoreError> {
        let sql = format!(
            "SELECT {POLYLINE_COLUMNS} FROM cached_polylines \
             WHERE start_time > $1 AND ($2::text IS NULL OR device_id = $2) \
             ORDER BY start_time ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(Self::row_to_polyline)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map(|rows| rows.into_iter().map(CachedPolyline::from).collect())
            .map_err(StoreError::from)
    }

    async fn polyline_by_id(&self, id: i64) -> Result<Option<CachedPolyline>, StoreError> {
        let sql = format!("SELECT {POLYLINE_COLUMNS} FROM cached_polylines WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        row.map(Self::row_to_polyline)
            .transpose()
            .map(|r| r.map(CachedPolyline::from))
            .map_err(StoreError::from)
    }

    async fn segments_for_municipality(
        &self,
        municipality_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoadSegment>, StoreError> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM road_segments \
             WHERE municipality_id = $1 \
               AND ($2::timestamptz IS NULL \
                    OR greatest(last_serviced_forward, last_serviced_reverse) > $2) \
             ORDER BY greatest(last_serviced_forward, last_serviced_reverse) DESC NULLS LAST"
        );
        let rows = sqlx::query(&sql)
            .bind(municipality_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(Self::row_to_segment)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn segment_by_id(&self, id: i64) -> Result<Option<RoadSegment>, StoreError> {
        let sql = format!("SELECT {SEGMENT_COLUMNS} FROM road_segments WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        row.map(Self::row_to_segment).transpose().map_err(StoreError::from)
    }
}
