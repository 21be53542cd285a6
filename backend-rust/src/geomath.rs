//! Pure geographic math (spec.md §4.1). No I/O, no suspension points — every
//! function here is safe to call from inside a lock or a hot loop.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two WGS-84 points, in meters.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

/// Initial great-circle bearing from `(lat1, lon1)` to `(lat2, lon2)`, in
/// `[0, 360)` degrees clockwise from true north. Same-point inputs return 0.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if (lat1 - lat2).abs() < 1e-12 && (lon1 - lon2).abs() < 1e-12 {
        return 0.0;
    }
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_lambda = (lon2 - lon1).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    let theta = y.atan2(x).to_degrees();
    (theta + 360.0) % 360.0
}

/// Direction relative to a road segment's stored bearing (spec.md §4.1).
/// `d = |polyline_bearing - segment_bearing|`, folded into `[0, 180]`;
/// `forward` iff `d <= 90`, with the tie at exactly 90° resolved to
/// `forward` for determinism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

pub fn direction_of(polyline_bearing: f64, segment_bearing: f64) -> Direction {
    let mut d = (polyline_bearing - segment_bearing).abs() % 360.0;
    if d > 180.0 {
        d = 360.0 - d;
    }
    if d <= 90.0 {
        Direction::Forward
    } else {
        Direction::Reverse
    }
}

/// A `(lat, lon)` vertex at encoded-polyline precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub lat: f64,
    pub lon: f64,
}

impl Vertex {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Google-style variable-length signed-integer delta polyline encoding.
/// `precision` is the number of decimal digits preserved (spec default 5).
pub fn polyline_encode(points: &[Vertex], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut out = String::new();
    let mut prev_lat = 0i64;
    let mut prev_lon = 0i64;

    for p in points {
        let lat = (p.lat * factor).round() as i64;
        let lon = (p.lon * factor).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lon - prev_lon, &mut out);
        prev_lat = lat;
        prev_lon = lon;
    }
    out
}

fn encode_value(value: i64, out: &mut String) {
    let mut v = value << 1;
    if value < 0 {
        v = !v;
    }
    let mut v = v as u64;
    while v >= 0x20 {
        let chunk = ((v & 0x1f) as u8) | 0x20;
        out.push((chunk + 63) as char);
        v >>= 5;
    }
    out.push((v as u8 + 63) as char);
}

/// Decode a string produced by `polyline_encode` back into vertices.
pub fn polyline_decode(encoded: &str, precision: u32) -> Vec<Vertex> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut index = 0usize;
    let mut lat = 0i64;
    let mut lon = 0i64;
    let mut points = Vec::new();

    while index < bytes.len() {
        lat += decode_value(bytes, &mut index);
        lon += decode_value(bytes, &mut index);
        points.push(Vertex::new(lat as f64 / factor, lon as f64 / factor));
    }
    points
}

fn decode_value(bytes: &[u8], index: &mut usize) -> i64 {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let b = bytes[*index] as u64 - 63;
        *index += 1;
        result |= (b & 0x1f) << shift;
        shift += 5;
        if b < 0x20 {
            break;
        }
    }
    if result & 1 != 0 {
        !(result >> 1) as i64
    } else {
        (result >> 1) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round5(v: f64) -> f64 {
        (v * 100_000.0).round() / 100_000.0
    }

    #[test]
    fn polyline_round_trips_at_5_decimal_precision() {
        let points = vec![
            Vertex::new(43.70001, -72.50002),
            Vertex::new(43.70081, -72.49932),
            Vertex::new(43.70160, -72.49861),
        ];
        let encoded = polyline_encode(&points, 5);
        let decoded = polyline_decode(&encoded, 5);

        assert_eq!(decoded.len(), points.len());
        for (p, d) in points.iter().zip(decoded.iter()) {
            assert_eq!(round5(p.lat), d.lat);
            assert_eq!(round5(p.lon), d.lon);
        }
    }

    #[test]
    fn empty_polyline_round_trips() {
        let encoded = polyline_encode(&[], 5);
        assert!(encoded.is_empty());
        assert!(polyline_decode(&encoded, 5).is_empty());
    }

    #[test]
    fn negative_deltas_round_trip() {
        let points = vec![
            Vertex::new(43.70160, -72.49861),
            Vertex::new(43.70001, -72.50002),
        ];
        let encoded = polyline_encode(&points, 5);
        let decoded = polyline_decode(&encoded, 5);
        assert_eq!(decoded.len(), 2);
        assert!((decoded[1].lat - 43.70001).abs() < 1e-5);
        assert!((decoded[1].lon - (-72.50002)).abs() < 1e-5);
    }

    #[test]
    fn bearing_is_always_in_range() {
        let cases = [
            (43.70, -72.50, 43.71, -72.50),
            (43.70, -72.50, 43.70, -72.51),
            (43.70, -72.50, 43.69, -72.49),
            (0.0, 0.0, 0.0, 0.0),
        ];
        for (lat1, lon1, lat2, lon2) in cases {
            let b = bearing_deg(lat1, lon1, lat2, lon2);
            assert!((0.0..360.0).contains(&b), "bearing {b} out of range");
        }
    }

    #[test]
    fn same_point_bearing_is_zero() {
        assert_eq!(bearing_deg(43.7, -72.5, 43.7, -72.5), 0.0);
    }

    #[test]
    fn direction_symmetry_under_180_rotation() {
        // Skip the exact-90 tie case, which is deliberately asymmetric.
        let cases = [(10.0, 100.0), (350.0, 10.0), (45.0, 46.0)];
        for (a, b) in cases {
            let base = direction_of(a, b);
            let rotated = direction_of(a + 180.0, b + 180.0);
            assert_eq!(base, rotated);

            let one_rotated = direction_of(a + 180.0, b);
            assert_ne!(base, one_rotated);
        }
    }

    #[test]
    fn direction_tie_at_90_degrees_is_forward() {
        assert_eq!(direction_of(90.0, 0.0), Direction::Forward);
        assert_eq!(direction_of(0.0, 270.0), Direction::Forward);
    }

    #[test]
    fn direction_of_close_bearings_is_forward() {
        assert_eq!(direction_of(10.0, 5.0), Direction::Forward);
    }

    #[test]
    fn direction_of_opposite_bearings_is_reverse() {
        assert_eq!(direction_of(10.0, 190.0), Direction::Reverse);
    }
}
