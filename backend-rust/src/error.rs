//! Error taxonomy for the pipeline (spec.md §7).
//!
//! Kinds, not exception hierarchies: `MatchOutcome` carries matcher failures
//! as data (see `matcher.rs`); `StoreError` and `ConfigError` are the only
//! places the pipeline propagates an `Err`. Everything else is a logged,
//! swallowed outcome per the propagation policy (batch failures never abort
//! other batches, device failures never abort the worker loop).

use thiserror::Error;

/// Failure loading or validating configuration. Fatal: the process exits
/// before entering the main loop (spec.md §7, `ConfigurationError`).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Failures from the Store boundary. `Transient` covers connection resets,
/// deadlocks, and serialization failures — the caller retries with backoff
/// per §7. `Hard` covers constraint violations not absorbed by an upsert —
/// the caller escalates immediately and moves to the next batch.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(#[source] sqlx::Error),
    #[error("store error: {0}")]
    Hard(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
                // serialization_failure
                StoreError::Transient(err)
            }
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40P01") => {
                // deadlock_detected
                StoreError::Transient(err)
            }
            _ => StoreError::Hard(err),
        }
    }
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Top-level error returned by ReadAPI handlers; implements `IntoResponse`
/// so handlers can use `?` and still produce the `{error, message}` bodies
/// from spec.md §6.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("store unreachable: {0}")]
    StoreUnreachable(#[from] StoreError),
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;
        use serde_json::json;

        let (status, kind) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::StoreUnreachable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unreachable"),
        };
        let message = self.to_string();
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}
