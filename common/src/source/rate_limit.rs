// Shared lookup rate limit across all worker processes, backed by Redis

use crate::config::RedisConfig;
use crate::errors::{AdapterError, StoreError};
use crate::models::SearchCriterion;
use crate::source::{DocumentSource, DocumentSourceFactory, FetchOutcome, WindDown};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const BUCKET_KEY: &str = "rate_limit:lookups";

/// Sliding-window limiter using a Redis sorted set of request timestamps
#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    max_requests: u32,
    window: Duration,
}

impl RedisRateLimiter {
    #[instrument(skip(config))]
    pub async fn connect(
        config: &RedisConfig,
        max_requests: u32,
        window: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        Ok(Self {
            manager,
            max_requests,
            window,
        })
    }

    /// Record a lookup if the window has room; false means wait and try again
    ///
    /// Trim, count and insert run as one Lua script so racing workers never
    /// push the window past `max_requests`.
    #[instrument(skip(self))]
    pub async fn try_acquire(&self) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();

        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        let expire_secs = i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX) + 60;

        let script = r#"
            redis.call("ZREMRANGEBYSCORE", KEYS[1], 0, ARGV[1] - ARGV[2])
            if redis.call("ZCARD", KEYS[1]) >= tonumber(ARGV[3]) then
                return 0
            end
            redis.call("ZADD", KEYS[1], ARGV[1], ARGV[4])
            redis.call("EXPIRE", KEYS[1], ARGV[5])
            return 1
        "#;

        let admitted: i32 = redis::Script::new(script)
            .key(BUCKET_KEY)
            .arg(now_ms)
            .arg(window_ms)
            .arg(self.max_requests)
            .arg(Uuid::new_v4().to_string())
            .arg(expire_secs)
            .invoke_async(&mut conn)
            .await?;

        if admitted == 0 {
            debug!(max_requests = self.max_requests, "Lookup rate limit reached");
            return Ok(false);
        }
        Ok(true)
    }

    /// Pause between two checks while the window is full
    pub fn backoff(&self) -> Duration {
        (self.window / self.max_requests.max(1)).max(Duration::from_millis(100))
    }

    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(BUCKET_KEY).await?;
        Ok(())
    }
}

/// Session wrapper that waits for a slot in the shared window before each lookup
pub struct RateLimitedSource {
    inner: Box<dyn DocumentSource>,
    limiter: Arc<RedisRateLimiter>,
}

#[async_trait]
impl DocumentSource for RateLimitedSource {
    async fn fetch(
        &self,
        criterion: &SearchCriterion,
        wind_down: &WindDown,
    ) -> Result<FetchOutcome, AdapterError> {
        loop {
            match self.limiter.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.limiter.backoff()) => {}
                        _ = wind_down.requested() => {
                            return Err(AdapterError::Transient(
                                "soft time limit reached while rate limited".to_string(),
                            ));
                        }
                    }
                }
                Err(e) => {
                    // Limiter outage must not stall refreshes
                    warn!(error = %e, "Rate limiter unavailable, proceeding without it");
                    break;
                }
            }
        }

        self.inner.fetch(criterion, wind_down).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Wraps every session of `inner` in the shared rate limit
pub struct RateLimitedSourceFactory {
    inner: Arc<dyn DocumentSourceFactory>,
    limiter: Arc<RedisRateLimiter>,
}

impl RateLimitedSourceFactory {
    pub fn new(inner: Arc<dyn DocumentSourceFactory>, limiter: Arc<RedisRateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl DocumentSourceFactory for RateLimitedSourceFactory {
    async fn create(&self) -> Result<Box<dyn DocumentSource>, AdapterError> {
        let inner = self.inner.create().await?;
        Ok(Box::new(RateLimitedSource {
            inner,
            limiter: Arc::clone(&self.limiter),
        }))
    }
}
