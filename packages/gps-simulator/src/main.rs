//! gps-sim — synthetic snowplow GPS trace generator.
//!
//! Drives `n_devices` vehicles along a fixed bearing at a configurable
//! speed with Gaussian positional noise, emitting newline-delimited
//! `GpsFixEnvelope` JSON at `update_rate_hz` — either to stdout or over a
//! TCP connection to the backend's ingest listener. This is dev tooling
//! only: it stands in for real hardware the same way the teacher's
//! physics/noise-generation loop stands in for real UWB nodes, just
//! without the control-plane server (the ingest side is out of core
//! scope, so this simulator has no business running one either).

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use plow_geo::GpsFixEnvelope;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::{info, warn};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Parser, Debug)]
#[command(name = "gps-sim", about = "Synthetic snowplow GPS trace generator")]
struct Args {
    /// Number of simulated devices.
    #[arg(long, default_value_t = 3)]
    n_devices: u32,

    /// Fix emission rate, Hz.
    #[arg(long, default_value_t = 1.0)]
    update_rate_hz: f64,

    /// Forward speed, meters/second.
    #[arg(long, default_value_t = 8.0)]
    speed_mps: f64,

    /// Travel bearing, degrees clockwise from north.
    #[arg(long, default_value_t = 90.0)]
    bearing_deg: f64,

    /// Starting latitude, WGS-84 degrees.
    #[arg(long, default_value_t = 43.70)]
    origin_lat: f64,

    /// Starting longitude, WGS-84 degrees.
    #[arg(long, default_value_t = -72.50)]
    origin_lon: f64,

    /// Total simulated duration, seconds.
    #[arg(long, default_value_t = 120)]
    duration_s: u64,

    /// Positional noise standard deviation, meters.
    #[arg(long, default_value_t = 2.0)]
    noise_std_m: f64,

    /// `host:port` of the backend ingest listener. Omit to print to stdout.
    #[arg(long)]
    ingest_addr: Option<String>,
}

struct DeviceTrack {
    device_id: String,
    lat: f64,
    lon: f64,
    bearing_deg: f64,
    speed_mps: f64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gps_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    info!(
        n_devices = args.n_devices,
        update_rate_hz = args.update_rate_hz,
        speed_mps = args.speed_mps,
        "gps-sim starting"
    );

    let mut tracks: Vec<DeviceTrack> = (0..args.n_devices)
        .map(|i| DeviceTrack {
            device_id: format!("plow-{}", i + 1),
            lat: args.origin_lat + (i as f64) * 0.0008,
            lon: args.origin_lon,
            bearing_deg: args.bearing_deg,
            speed_mps: args.speed_mps,
        })
        .collect();

    let mut sink = Sink::new(args.ingest_addr.as_deref());

    let dt = 1.0 / args.update_rate_hz;
    let ticks = (args.duration_s as f64 * args.update_rate_hz) as u64;
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, args.noise_std_m.max(1e-9)).expect("valid noise stddev");

    for _ in 0..ticks {
        let now = Utc::now();
        for track in tracks.iter_mut() {
            advance(track, dt, &noise, &mut rng);
            let envelope = GpsFixEnvelope::new(track.device_id.clone(), track.lon, track.lat, now.to_rfc3339());
            sink.emit(&envelope);
        }
        std::thread::sleep(Duration::from_secs_f64(dt));
    }

    info!("gps-sim finished after {} ticks", ticks);
}

/// Moves a device forward by `dt` seconds along its bearing using an
/// equirectangular approximation (adequate at vehicle speeds over a few
/// seconds of travel) plus independent Gaussian noise on each axis.
fn advance(track: &mut DeviceTrack, dt: f64, noise: &Normal<f64>, rng: &mut StdRng) {
    let distance_m = track.speed_mps * dt;
    let bearing_rad = track.bearing_deg.to_radians();
    let d_lat = (distance_m * bearing_rad.cos()) / EARTH_RADIUS_M;
    let d_lon = (distance_m * bearing_rad.sin()) / (EARTH_RADIUS_M * track.lat.to_radians().cos());

    track.lat += d_lat.to_degrees();
    track.lon += d_lon.to_degrees();

    let noise_lat_m = noise.sample(rng);
    let noise_lon_m = noise.sample(rng);
    track.lat += (noise_lat_m / EARTH_RADIUS_M).to_degrees();
    track.lon += (noise_lon_m / (EARTH_RADIUS_M * track.lat.to_radians().cos())).to_degrees();
}

/// Either a TCP connection to the ingest listener or stdout, chosen once
/// at startup. A dropped/refused ingest connection falls back to stdout
/// rather than crashing the simulator mid-run.
enum Sink {
    Tcp(TcpStream),
    Stdout,
}

impl Sink {
    fn new(ingest_addr: Option<&str>) -> Self {
        match ingest_addr {
            Some(addr) => match TcpStream::connect(addr) {
                Ok(stream) => {
                    info!(addr, "connected to ingest listener");
                    Sink::Tcp(stream)
                }
                Err(e) => {
                    warn!(addr, error = %e, "could not connect to ingest listener, falling back to stdout");
                    Sink::Stdout
                }
            },
            None => Sink::Stdout,
        }
    }

    fn emit(&mut self, envelope: &GpsFixEnvelope) {
        let line = serde_json::to_string(envelope).expect("envelope always serializes");
        match self {
            Sink::Tcp(stream) => {
                if writeln!(stream, "{line}").is_err() {
                    warn!("ingest connection dropped, switching to stdout");
                    *self = Sink::Stdout;
                    println!("{line}");
                }
            }
            Sink::Stdout => println!("{line}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_east_for_90_degree_bearing() {
        let mut track = DeviceTrack {
            device_id: "D1".into(),
            lat: 43.70,
            lon: -72.50,
            bearing_deg: 90.0,
            speed_mps: 10.0,
        };
        let zero_noise = Normal::new(0.0, 1e-9).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let start_lon = track.lon;
        advance(&mut track, 1.0, &zero_noise, &mut rng);
        assert!(track.lon > start_lon, "moving due east should increase longitude");
        assert!((track.lat - 43.70).abs() < 1e-6, "due-east travel shouldn't change latitude materially");
    }
}
