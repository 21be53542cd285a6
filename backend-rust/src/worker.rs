//! Worker (spec.md §4.7): the main loop that dequeues device ids and drives
//! `DeviceProcessor`, plus the periodic stats scheduler.
//!
//! `run_worker_pool` spawns `parallelism` identical loop tasks against the
//! same `JobQueue`; the queue's inflight set (spec.md §4.4) is what makes
//! this safe — two tasks can never hold the same device id at once. A
//! `CancellationToken` stands in for the shutdown signal from spec.md §5:
//! in-flight `DeviceProcessor` runs complete, but no new `take` happens
//! after it fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ProcessingConfig;
use crate::device_processor::process_device;
use crate::events::{Event, EventSink};
use crate::matcher::MatcherClient;
use crate::queue::JobQueue;
use crate::store::Store;

pub struct WorkerHandles {
    pub shutdown: CancellationToken,
}

/// Spawns `parallelism` worker loops plus one stats-reporting loop. Returns
/// a handle whose `shutdown` token stops new `take`s; callers await the
/// returned join handles (or just let the process exit) to let in-flight
/// work drain.
pub fn spawn_worker_pool(
    store: Arc<dyn Store>,
    matcher: Arc<dyn MatcherClient>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventSink>,
    config: Arc<ProcessingConfig>,
    parallelism: usize,
    pop_timeout_s: u64,
    stats_interval_ms: u64,
) -> (WorkerHandles, Vec<tokio::task::JoinHandle<()>>) {
    let shutdown = CancellationToken::new();
    let mut handles = Vec::with_capacity(parallelism + 1);

    for worker_idx in 0..parallelism.max(1) {
        let store = store.clone();
        let matcher = matcher.clone();
        let queue = queue.clone();
        let events = events.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_idx, store, matcher, queue, events, config, pop_timeout_s, shutdown).await;
        }));
    }

    {
        let store = store.clone();
        let events = events.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            stats_loop(store, events, stats_interval_ms, shutdown).await;
        }));
    }

    (WorkerHandles { shutdown }, handles)
}

async fn worker_loop(
    worker_idx: usize,
    store: Arc<dyn Store>,
    matcher: Arc<dyn MatcherClient>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventSink>,
    config: Arc<ProcessingConfig>,
    pop_timeout_s: u64,
    shutdown: CancellationToken,
) {
    info!(worker_idx, "worker loop starting");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let device_id = tokio::select! {
            taken = queue.take(pop_timeout_s) => taken,
            _ = shutdown.cancelled() => break,
        };

        let device_id = match device_id {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                events.emit(Event::BatchFailed { device_id: "<queue>", error: &e.to_string() });
                continue;
            }
        };

        process_device(store.as_ref(), matcher.as_ref(), events.as_ref(), &config, &device_id).await;

        if let Err(e) = queue.release(&device_id).await {
            events.emit(Event::BatchFailed { device_id: &device_id, error: &e.to_string() });
        }
    }
    info!(worker_idx, "worker loop stopped");
}

async fn stats_loop(
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        match store.stats().await {
            Ok(stats) => events.emit(Event::Stats {
                queued: stats.raw_points_unprocessed,
                processed_today: stats.segments_serviced_today,
                failed_today: stats.processing_failed_today,
            }),
            Err(_) => continue,
        }
    }
}

/// Listens for a shutdown signal (ctrl-c or the `watch` channel used by
/// tests) and cancels the token, stopping new `take`s (spec.md §4.7/§5).
pub async fn watch_for_shutdown(token: CancellationToken, mut external: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = external.changed() => {
            info!("shutdown requested");
        }
    }
    token.cancel();
}
