//! Minimal ingest listener (SPEC_FULL.md §1/§2 supplement, component C12).
//!
//! spec.md treats the TCP/UDP listener that writes raw GPS rows and enqueues
//! device ids as an external collaborator with a named interface only. This
//! module implements exactly that interface and nothing more: bind a TCP
//! socket, read newline-delimited JSON fixes, insert each via `Store`, and
//! call `JobQueue::offer`. No backpressure tuning, no binary framing, no
//! auth — those stay out of scope.
//!
//! Modeled on the teacher's `uwb_hub.rs`: bind once, loop-accept, never let
//! a single connection's I/O error bring down the listener.

use std::sync::Arc;

use plow_geo::GpsFixEnvelope;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::events::{Event, EventSink};
use crate::queue::JobQueue;
use crate::store::{NewRawGpsPoint, Store};

pub async fn run_ingest_listener(
    config: IngestConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventSink>,
) {
    let addr = format!("0.0.0.0:{}", config.tcp_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => {
            info!("ingest listener bound on {addr}");
            l
        }
        Err(e) => {
            warn!("ingest: could not bind TCP {addr}: {e}");
            return;
        }
    };

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let store = store.clone();
                let queue = queue.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    handle_connection(socket, peer, store.as_ref(), queue.as_ref(), events.as_ref()).await;
                });
            }
            Err(e) => {
                warn!("ingest: accept error: {e}");
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: std::net::SocketAddr,
    store: &dyn Store,
    queue: &dyn JobQueue,
    events: &dyn EventSink,
) {
    let mut lines = BufReader::new(socket).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "ingest: connection read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = ingest_line(&line, store, queue, events).await {
            debug!(%peer, error = %e, "ingest: dropped malformed fix");
        }
    }
}

async fn ingest_line(
    line: &str,
    store: &dyn Store,
    queue: &dyn JobQueue,
    events: &dyn EventSink,
) -> anyhow::Result<()> {
    let envelope: GpsFixEnvelope = serde_json::from_str(line)?;
    let recorded_at = chrono::DateTime::parse_from_rfc3339(&envelope.recorded_at)?.with_timezone(&chrono::Utc);

    let point = NewRawGpsPoint {
        device_id: envelope.device_id.clone(),
        longitude: envelope.longitude,
        latitude: envelope.latitude,
        recorded_at,
        altitude: envelope.altitude,
        speed: envelope.speed,
        bearing_raw: envelope.bearing_raw,
        accuracy: envelope.accuracy,
    };

    store.insert_raw_point(point).await?;
    queue.offer(&envelope.device_id).await?;
    events.emit(Event::DeviceEnqueued { device_id: &envelope.device_id });
    Ok(())
}
