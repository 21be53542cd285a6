//! PolylineWriter (spec.md §4.6's first half): turns a matched route plus
//! the batch it came from into the row `cached_polylines` actually stores.

use crate::batch::Batch;
use crate::geomath::{bearing_deg, polyline_encode, Vertex};
use crate::matcher::Matched;
use crate::store::NewPolyline;

/// Everything needed to persist a matched batch, computed once so
/// `DeviceProcessor` doesn't re-derive geometry in two places.
pub struct PreparedPolyline {
    pub new_polyline: NewPolyline,
    /// WKT of the matched geometry, reused by `SegmentActivator` for the
    /// intersection query so it isn't recomputed.
    pub geometry_wkt: String,
    pub bearing: f64,
}

/// `batch_id` identifies this attempt for the processing log / dedupe
/// constraints; it is independent of any polyline primary key.
pub fn prepare_polyline(batch: &Batch, matched: &Matched, device_id: &str, batch_id: &str) -> PreparedPolyline {
    let coordinates = &matched.coordinates;
    let encoded_polyline = polyline_encode(coordinates, 5);
    let geometry_wkt = linestring_wkt(coordinates);

    let first = coordinates.first().expect("matcher always returns >=2 points");
    let last = coordinates.last().expect("matcher always returns >=2 points");
    let bearing = bearing_deg(first.lat, first.lon, last.lat, last.lon);

    let start_time = batch.start_time();
    let end_time = batch.end_time();

    PreparedPolyline {
        new_polyline: NewPolyline {
            device_id: device_id.to_string(),
            start_time,
            end_time,
            encoded_polyline,
            geometry_wkt: geometry_wkt.clone(),
            bearing,
            confidence: matched.confidence,
            // NEW raw points that went into this batch, not the (possibly
            // resampled) matched-vertex count (spec.md §3/§4.6, §8's
            // "Batch NEW-count correctness" property).
            point_count: batch.new_point_count(),
            batch_id: batch_id.to_string(),
            osrm_duration_ms: matched.duration_ms,
        },
        geometry_wkt,
        bearing,
    }
}

fn linestring_wkt(points: &[Vertex]) -> String {
    let joined = points
        .iter()
        .map(|p| format!("{} {}", p.lon, p.lat))
        .collect::<Vec<_>>()
        .join(", ");
    format!("LINESTRING({joined})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawGpsPoint;
    use chrono::{TimeZone, Utc};

    fn point(id: i64, lon: f64, lat: f64, secs_offset: i64) -> RawGpsPoint {
        let base = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        RawGpsPoint {
            id,
            device_id: "D1".into(),
            longitude: lon,
            latitude: lat,
            recorded_at: base + chrono::Duration::seconds(secs_offset),
            received_at: base + chrono::Duration::seconds(secs_offset),
            processed: false,
            batch_id: None,
            altitude: None,
            speed: None,
            bearing_raw: None,
            accuracy: None,
        }
    }

    #[test]
    fn prepare_polyline_encodes_matched_geometry_and_derives_bearing() {
        let batch = Batch {
            points: vec![point(1, -72.500, 43.700, 0), point(2, -72.499, 43.701, 30)],
            new_point_ids: vec![1, 2],
        };
        let matched = Matched {
            coordinates: vec![Vertex::new(43.700, -72.500), Vertex::new(43.701, -72.499)],
            confidence: 0.92,
            duration_ms: 42,
        };
        let prepared = prepare_polyline(&batch, &matched, "D1", "batch-1");

        assert!(prepared.geometry_wkt.starts_with("LINESTRING("));
        assert_eq!(prepared.new_polyline.point_count, 2);
        assert_eq!(prepared.new_polyline.confidence, 0.92);
        assert!(prepared.bearing >= 0.0 && prepared.bearing < 360.0);
        assert_eq!(prepared.new_polyline.start_time, batch.start_time());
        assert_eq!(prepared.new_polyline.end_time, batch.end_time());
    }

    #[test]
    fn point_count_is_new_raw_points_not_resampled_vertex_count() {
        // The carryover anchor (id 0) isn't NEW; the matcher also resampled
        // the route to 4 vertices even though only 2 raw points went in.
        let batch = Batch {
            points: vec![
                point(0, -72.501, 43.700, -30),
                point(1, -72.500, 43.700, 0),
                point(2, -72.499, 43.701, 30),
            ],
            new_point_ids: vec![1, 2],
        };
        let matched = Matched {
            coordinates: vec![
                Vertex::new(43.700, -72.501),
                Vertex::new(43.700, -72.5005),
                Vertex::new(43.7005, -72.4995),
                Vertex::new(43.701, -72.499),
            ],
            confidence: 0.88,
            duration_ms: 17,
        };
        let prepared = prepare_polyline(&batch, &matched, "D1", "batch-2");
        assert_eq!(prepared.new_polyline.point_count, 2);
    }
}
