//! JobQueue (spec.md §4.4): durable FIFO of device ids with an inflight set
//! that guarantees at most one `DeviceProcessor` works a given device at a
//! time. Redis gives us both the list and the set primitives for free.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::QueueConfig;
use crate::error::StoreError;

const QUEUE_KEY: &str = "plow:queue";
const INFLIGHT_KEY: &str = "plow:inflight";

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `device_id` unless it's already queued or inflight
    /// (spec.md §4.4's dedupe rule — a device with work pending never
    /// gets a second entry).
    async fn offer(&self, device_id: &str) -> Result<(), StoreError>;

    /// Block up to `timeout_s` for the next device id, marking it inflight
    /// atomically with the pop so a crash between pop and mark can't lose
    /// the at-most-one guarantee.
    async fn take(&self, timeout_s: u64) -> Result<Option<String>, StoreError>;

    /// Release a device from the inflight set once its batch is done,
    /// whether it succeeded, failed, or was abandoned.
    async fn release(&self, device_id: &str) -> Result<(), StoreError>;

    async fn depth(&self) -> Result<i64, StoreError>;
}

pub struct RedisJobQueue {
    client: redis::Client,
}

impl RedisJobQueue {
    pub fn new(config: &QueueConfig) -> Result<Self, redis::RedisError> {
        Ok(Self { client: redis::Client::open(config.url.clone())? })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn offer(&self, device_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await.map_err(to_store_error)?;

        let inflight: bool = conn.sismember(INFLIGHT_KEY, device_id).await.map_err(to_store_error)?;
        if inflight {
            return Ok(());
        }

        // LPOS avoids double-queueing a device that's already waiting.
        let already_queued: Option<i64> =
            conn.lpos(QUEUE_KEY, device_id, redis::LposOptions::default())
                .await
                .map_err(to_store_error)?;
        if already_queued.is_some() {
            return Ok(());
        }

        let _: () = conn.lpush(QUEUE_KEY, device_id).await.map_err(to_store_error)?;
        Ok(())
    }

    async fn take(&self, timeout_s: u64) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await.map_err(to_store_error)?;
        let popped: Option<(String, String)> =
            conn.brpop(QUEUE_KEY, timeout_s as f64).await.map_err(to_store_error)?;

        let Some((_key, device_id)) = popped else {
            return Ok(None);
        };

        let _: () = conn.sadd(INFLIGHT_KEY, &device_id).await.map_err(to_store_error)?;
        Ok(Some(device_id))
    }

    async fn release(&self, device_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await.map_err(to_store_error)?;
        let _: () = conn.srem(INFLIGHT_KEY, device_id).await.map_err(to_store_error)?;
        Ok(())
    }

    async fn depth(&self) -> Result<i64, StoreError> {
        let mut conn = self.connection().await.map_err(to_store_error)?;
        conn.llen(QUEUE_KEY).await.map_err(to_store_error)
    }
}

/// `redis::RedisError` doesn't carry SQLSTATE codes; connection-shaped
/// failures are treated as transient, everything else as hard, mirroring
/// `StoreError::from(sqlx::Error)`.
fn to_store_error(err: redis::RedisError) -> StoreError {
    use sqlx::Error as SqlxError;
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        StoreError::Transient(SqlxError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
    } else {
        StoreError::Hard(SqlxError::Protocol(err.to_string()))
    }
}
