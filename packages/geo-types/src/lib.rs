//! # plow-geo
//!
//! Shared GPS fix wire structures for the snowplow tracking pipeline.
//!
//! These types are used by:
//! - `plow-tracker-backend`: decoding raw fixes off the ingest listener
//! - `gps-simulator`: producing the same wire shape for local dev/testing
//!
//! ## Coordinate conventions
//!
//! - Longitude/latitude are WGS-84 decimal degrees.
//! - Timestamps are UTC instants, encoded as RFC 3339 strings on the wire.
//! - Bearing is degrees clockwise from true north, `[0, 360)`.

use serde::{Deserialize, Serialize};

/// One GPS fix as it arrives over the wire from a vehicle.
///
/// This is the newline-delimited JSON envelope the ingest listener decodes;
/// it mirrors `raw_gps` minus the fields the server assigns (`id`, `received_at`,
/// `processed`, `batch_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFixEnvelope {
    pub device_id: String,
    pub longitude: f64,
    pub latitude: f64,
    /// UTC instant the device recorded the fix, RFC 3339.
    pub recorded_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing_raw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl GpsFixEnvelope {
    pub fn new(device_id: impl Into<String>, longitude: f64, latitude: f64, recorded_at: String) -> Self {
        Self {
            device_id: device_id.into(),
            longitude,
            latitude,
            recorded_at,
            altitude: None,
            speed: None,
            bearing_raw: None,
            accuracy: None,
        }
    }
}

/// A single `(lon, lat)` vertex, the unit the matcher and GeoMath operate on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let fix = GpsFixEnvelope::new("plow-7", -72.50, 43.70, "2026-01-15T12:00:00Z".to_string());
        let json = serde_json::to_string(&fix).unwrap();
        let back: GpsFixEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(fix, back);
    }

    #[test]
    fn optional_fields_omitted_when_absent() {
        let fix = GpsFixEnvelope::new("plow-7", -72.50, 43.70, "2026-01-15T12:00:00Z".to_string());
        let json = serde_json::to_string(&fix).unwrap();
        assert!(!json.contains("altitude"));
    }
}
