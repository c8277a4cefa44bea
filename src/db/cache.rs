//! Cache clients bound to shard cache endpoints.
//!
//! A [`CacheHandle`] wraps a `redis::Client` and opens its multiplexed
//! `ConnectionManager` on first use. Creating a handle never touches the network.
//!
//! Connecting happens outside the state lock, so a slow or dead endpoint never
//! queues callers behind each other and never delays `close`. After a failed
//! connect the handle fails fast with `Unavailable` for [`FAILURE_BACKOFF`].

use crate::error::{ShardError, ShardResult};
use crate::models::CacheEndpoint;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a handle refuses to reconnect after a failed attempt.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

enum CacheState {
    Idle,
    Connected(ConnectionManager),
    Failed { retry_at: Instant },
    Closed,
}

struct CacheInner {
    endpoint: CacheEndpoint,
    client: redis::Client,
    connect_timeout: Duration,
    backoff: Duration,
    state: Mutex<CacheState>,
}

/// Cheap-clone handle to one cache endpoint.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("endpoint", &self.inner.endpoint)
            .field("connect_timeout", &self.inner.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl CacheHandle {
    pub fn endpoint(&self) -> &CacheEndpoint {
        &self.inner.endpoint
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.state(), CacheState::Closed)
    }

    /// The lock is never held across an await, so a poisoned guard still holds a whole state.
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> ShardError {
        ShardError::unavailable(
            format!("Cache {} is closed", self.inner.endpoint),
            "The cache binding was removed; resolve the shard again",
        )
    }

    /// Get the shared connection, connecting on first use.
    ///
    /// Concurrent first callers each connect; the first to finish is installed
    /// and the others drop theirs.
    async fn connection(&self) -> ShardResult<ConnectionManager> {
        {
            let mut state = self.state();
            match &*state {
                CacheState::Connected(conn) => return Ok(conn.clone()),
                CacheState::Closed => return Err(self.closed_error()),
                CacheState::Failed { retry_at } if Instant::now() < *retry_at => {
                    return Err(ShardError::unavailable(
                        format!("Cache {} failed recently", self.inner.endpoint),
                        "Check that the cache server is running; reconnects resume shortly",
                    ));
                }
                CacheState::Failed { .. } | CacheState::Idle => {}
            }
            *state = CacheState::Idle;
        }

        debug!(cache = %self.inner.endpoint, "Opening cache connection");
        let attempt = tokio::time::timeout(
            self.inner.connect_timeout,
            ConnectionManager::new(self.inner.client.clone()),
        )
        .await;

        let mut state = self.state();
        match attempt {
            Ok(Ok(conn)) => {
                if let CacheState::Connected(existing) = &*state {
                    return Ok(existing.clone());
                }
                if matches!(*state, CacheState::Closed) {
                    return Err(self.closed_error());
                }
                *state = CacheState::Connected(conn.clone());
                Ok(conn)
            }
            failed => {
                if matches!(*state, CacheState::Idle | CacheState::Failed { .. }) {
                    *state = CacheState::Failed {
                        retry_at: Instant::now() + self.inner.backoff,
                    };
                }
                let err = match failed {
                    Ok(Err(e)) => ShardError::from(e),
                    _ => ShardError::unavailable(
                        format!(
                            "Timed out connecting to cache {} after {:?}",
                            self.inner.endpoint, self.inner.connect_timeout
                        ),
                        "Check that the cache server is running and accessible",
                    ),
                };
                warn!(cache = %self.inner.endpoint, error = %err, "Cache connection failed");
                Err(err)
            }
        }
    }

    pub async fn get(&self, key: &str) -> ShardResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// Store a value without expiry.
    pub async fn set(&self, key: &str, value: &str) -> ShardResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    /// Store a value that expires after `ttl` (rounded down to whole seconds, at least one).
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ShardResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    /// Set the expiry of an existing key. Returns false if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> ShardResult<bool> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let updated: bool = conn.expire(key, seconds).await?;
        Ok(updated)
    }

    /// Delete a key. Returns false if it did not exist.
    pub async fn delete(&self, key: &str) -> ShardResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Release the connection. Every later operation fails with `Unavailable`.
    ///
    /// Never waits for an in-flight connect; that attempt finds the handle closed.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state(), CacheState::Closed);
        if !matches!(previous, CacheState::Closed) {
            info!(cache = %self.inner.endpoint, "Cache client closed");
        }
    }
}

/// Builds cache handles for cache endpoints.
#[derive(Debug, Clone)]
pub struct CacheClientFactory {
    connect_timeout: Duration,
    backoff: Duration,
}

impl CacheClientFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            backoff: FAILURE_BACKOFF,
        }
    }

    /// Override how long handles fail fast after a failed connect.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build a handle for `endpoint`. Reachability is not checked here.
    pub fn create(&self, endpoint: &CacheEndpoint) -> ShardResult<CacheHandle> {
        endpoint.validate()?;
        let client = redis::Client::open(endpoint.redis_url()).map_err(|e| {
            ShardError::provisioning(
                format!("Invalid cache endpoint {}: {}", endpoint, e),
                "Use host:port, for example localhost:6379",
            )
        })?;
        Ok(CacheHandle {
            inner: Arc::new(CacheInner {
                endpoint: endpoint.clone(),
                client,
                connect_timeout: self.connect_timeout,
                backoff: self.backoff,
                state: Mutex::new(CacheState::Idle),
            }),
        })
    }
}

impl Default for CacheClientFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            crate::config::DEFAULT_CACHE_CONNECT_TIMEOUT_SECS,
        ))
    }
}
