//! Structured event emission, replacing the teacher's ad-hoc `info!`/`warn!`
//! call sites with a narrow abstraction the Worker, DeviceProcessor, and
//! ReadAPI share (spec.md §9 — "ad-hoc logging with side-channel HTTP calls
//! back into the backend" is replaced by an `EventSink` interface; stderr is
//! an acceptable implementation).

use tracing::{error, info, warn};

/// A pipeline event worth surfacing in structured logs. Kept as a small enum
/// rather than free-form strings so call sites can't drift on field names.
#[derive(Debug, Clone)]
pub enum Event<'a> {
    BatchSkipped { device_id: &'a str, reason: &'static str },
    BatchMatched { device_id: &'a str, polyline_id: i64, point_count: i64 },
    BatchFailed { device_id: &'a str, error: &'a str },
    BatchAbandoned { device_id: &'a str, failure_count: i64 },
    SegmentAdvanced { segment_id: i64, direction: &'static str },
    DeviceEnqueued { device_id: &'a str },
    Stats { queued: i64, processed_today: i64, failed_today: i64 },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event<'_>);
}

/// Default sink: structured `tracing` lines. Production deployments can
/// swap this for a file-backed sink without touching call sites.
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn emit(&self, event: Event<'_>) {
        match event {
            Event::BatchSkipped { device_id, reason } => {
                info!(device_id, reason, "batch skipped");
            }
            Event::BatchMatched { device_id, polyline_id, point_count } => {
                info!(device_id, polyline_id, point_count, "batch matched");
            }
            Event::BatchFailed { device_id, error } => {
                warn!(device_id, error, "batch failed");
            }
            Event::BatchAbandoned { device_id, failure_count } => {
                error!(device_id, failure_count, "batch abandoned after max retries");
            }
            Event::SegmentAdvanced { segment_id, direction } => {
                info!(segment_id, direction, "segment advanced");
            }
            Event::DeviceEnqueued { device_id } => {
                info!(device_id, "device enqueued");
            }
            Event::Stats { queued, processed_today, failed_today } => {
                info!(queued, processed_today, failed_today, "pipeline stats");
            }
        }
    }
}
