mod api;
mod batch;
mod config;
mod device_processor;
mod error;
mod events;
mod geomath;
mod ingest;
mod matcher;
mod models;
mod polyline_writer;
mod queue;
mod segment_activator;
mod store;
mod worker;

use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use config::Config;
use error::ConfigError;
use events::StderrEventSink;
use matcher::OsrmMatcherClient;
use queue::{JobQueue, RedisJobQueue};
use store::{PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), ConfigError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plow_tracker_backend=info".into()),
        )
        .init();

    // Configuration is loaded once, up front; a missing required key fails
    // fast here and the process never enters the main loop (spec.md §7,
    // ConfigurationError).
    let config = Config::from_env()?;
    info!("plow tracker backend v{} starting", env!("CARGO_PKG_VERSION"));

    let pg_store = match PgStore::connect(&config.db.connection_string(), config.db.pool_max).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            return Err(ConfigError::InvalidValue { key: "DB_*", value: e.to_string() });
        }
    };
    if let Err(e) = pg_store.migrate().await {
        error!(error = %e, "database migration failed");
        return Err(ConfigError::InvalidValue { key: "DB_*", value: e.to_string() });
    }
    let store: Arc<dyn Store> = Arc::new(pg_store);

    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisJobQueue::new(&config.queue)
            .map_err(|e| ConfigError::InvalidValue { key: "QUEUE_URL", value: e.to_string() })?,
    );
    let matcher: Arc<dyn matcher::MatcherClient> = Arc::new(OsrmMatcherClient::new(&config.matcher));
    let events: Arc<dyn events::EventSink> = Arc::new(StderrEventSink);

    // Minimal ingest listener — satisfies the named external interface from
    // spec.md §1 (write raw GPS rows, enqueue device ids) so the repo runs
    // end to end in development.
    tokio::spawn(ingest::run_ingest_listener(
        config.ingest.clone(),
        store.clone(),
        queue.clone(),
        events.clone(),
    ));

    let (worker_handles, worker_tasks) = worker::spawn_worker_pool(
        store.clone(),
        matcher.clone(),
        queue.clone(),
        events.clone(),
        Arc::new(config.processing.clone()),
        config.worker_parallelism,
        config.queue.pop_timeout_s,
        config.processing.stats_interval_ms,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(worker::watch_for_shutdown(worker_handles.shutdown.clone(), shutdown_rx));

    let cors_origin = config.api.cors_origin.clone();
    let cors = if cors_origin.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = cors_origin
            .split(',')
            .filter_map(|o| o.trim().parse::<axum::http::HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let app = api::router(api::ApiState {
        store: store.clone(),
        config: Arc::new(config.api.clone()),
    })
    .layer(cors);

    let addr = format!("0.0.0.0:{}", config.api.port);
    info!("ReadAPI listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ConfigError::InvalidValue { key: "API_PORT", value: e.to_string() })?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "ReadAPI server exited");
            }
        }
        _ = worker_handles.shutdown.cancelled() => {
            info!("shutting down ReadAPI after worker shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in worker_tasks {
        let _ = task.await;
    }
    info!("plow tracker backend stopped");
    Ok(())
}
