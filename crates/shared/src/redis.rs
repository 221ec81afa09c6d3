//! Best-effort distributed cache tier backed by Redis.
//!
//! This tier is a latency optimization shared across process instances, not a
//! correctness dependency. Every operation is bounded by a hard timeout and
//! degrades on any fault: reads become misses, writes become no-ops. Callers
//! never see an error from this module; faults are logged and absorbed at the
//! trait boundary. The service must behave correctly (just slower, via the
//! upstream) when this tier is entirely absent.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::time::timeout;

/// Hard per-operation timeout. A slow cache read must never stall the request
/// path longer than this.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(120);

/// Bound on the initial connection attempt at startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Internal fault taxonomy for the distributed tier.
///
/// Faults never cross the [`DistributedCache`] boundary; they exist so the
/// degradation sites can log what actually went wrong instead of silently
/// swallowing it.
#[derive(Debug, thiserror::Error)]
pub enum CacheFault {
    #[error("distributed cache disabled")]
    Disabled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored value is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Shared key-value cache with JSON values and per-write expiry.
///
/// All methods are infallible by contract: `get_json` answers `None` on any
/// fault, the writers return without effect. Implementations must bound every
/// remote call so a degraded backing store cannot block the caller.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Reads and decodes the value under `key`. Absent, expired, unreachable,
    /// and undecodable all answer `None`.
    async fn get_json(&self, key: &str) -> Option<Value>;

    /// Stores `value` as JSON text under `key` with a TTL in seconds.
    async fn set_json(&self, key: &str, value: &Value, ttl_secs: u64);

    /// Stores several entries sharing one TTL in a single round trip.
    async fn set_json_many(&self, entries: &[(String, Value)], ttl_secs: u64);

    /// Liveness check, used for startup diagnostics only.
    async fn ping(&self) -> bool;
}

/// Redis-backed [`DistributedCache`].
///
/// Wraps a [`ConnectionManager`], which reconnects on its own after drops;
/// while the peer is down, commands fail fast or hit the per-operation
/// timeout, and this adapter turns either into a miss.
pub struct RedisCache {
    manager: Option<ConnectionManager>,
    op_timeout: Duration,
}

impl RedisCache {
    /// Connects to the store at `url`. The attempt is bounded by
    /// [`CONNECT_TIMEOUT`]; callers typically fall back to [`Self::disabled`]
    /// when it fails.
    pub async fn connect(url: &str) -> Result<Self, CacheFault> {
        let client = redis::Client::open(url)?;
        let manager = timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| CacheFault::Timeout(CONNECT_TIMEOUT))??;
        Ok(Self {
            manager: Some(manager),
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    /// The unconfigured mode: every read misses, every write is dropped.
    pub fn disabled() -> Self {
        Self {
            manager: None,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Overrides the per-operation timeout.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// False when constructed via [`Self::disabled`].
    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    fn decode_value(raw: &str) -> Result<Value, CacheFault> {
        Ok(serde_json::from_str(raw)?)
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>, CacheFault> {
        let Some(manager) = &self.manager else {
            return Err(CacheFault::Disabled);
        };
        let mut conn = manager.clone();
        let raw: Option<String> = timeout(self.op_timeout, conn.get::<_, Option<String>>(key))
            .await
            .map_err(|_| CacheFault::Timeout(self.op_timeout))??;
        match raw {
            Some(text) => Ok(Some(Self::decode_value(&text)?)),
            None => Ok(None),
        }
    }

    async fn try_set(&self, key: &str, value: &Value, ttl_secs: u64) -> Result<(), CacheFault> {
        let Some(manager) = &self.manager else {
            return Err(CacheFault::Disabled);
        };
        let body = serde_json::to_string(value)?;
        let mut conn = manager.clone();
        timeout(
            self.op_timeout,
            conn.set_ex::<_, _, ()>(key, body, ttl_secs),
        )
        .await
        .map_err(|_| CacheFault::Timeout(self.op_timeout))??;
        Ok(())
    }

    async fn try_set_many(
        &self,
        entries: &[(String, Value)],
        ttl_secs: u64,
    ) -> Result<(), CacheFault> {
        let Some(manager) = &self.manager else {
            return Err(CacheFault::Disabled);
        };
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set_ex(key, serde_json::to_string(value)?, ttl_secs);
        }
        let mut conn = manager.clone();
        timeout(self.op_timeout, pipe.query_async::<()>(&mut conn))
            .await
            .map_err(|_| CacheFault::Timeout(self.op_timeout))??;
        Ok(())
    }

    async fn try_ping(&self) -> Result<(), CacheFault> {
        let Some(manager) = &self.manager else {
            return Err(CacheFault::Disabled);
        };
        let mut conn = manager.clone();
        timeout(
            self.op_timeout,
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| CacheFault::Timeout(self.op_timeout))??;
        Ok(())
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get_json(&self, key: &str) -> Option<Value> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(CacheFault::Disabled) => None,
            Err(fault) => {
                tracing::debug!(key, %fault, "distributed cache read degraded to miss");
                None
            }
        }
    }

    async fn set_json(&self, key: &str, value: &Value, ttl_secs: u64) {
        match self.try_set(key, value, ttl_secs).await {
            Ok(()) | Err(CacheFault::Disabled) => {}
            Err(fault) => {
                tracing::debug!(key, %fault, "distributed cache write dropped");
            }
        }
    }

    async fn set_json_many(&self, entries: &[(String, Value)], ttl_secs: u64) {
        match self.try_set_many(entries, ttl_secs).await {
            Ok(()) | Err(CacheFault::Disabled) => {}
            Err(fault) => {
                tracing::debug!(
                    count = entries.len(),
                    %fault,
                    "distributed cache batch write dropped"
                );
            }
        }
    }

    async fn ping(&self) -> bool {
        self.try_ping().await.is_ok()
    }
}
