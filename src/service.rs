//! Shard administration facade.
//!
//! [`ShardService`] is what outer layers talk to: it wraps the registry, the
//! scoped executor and the user repository, and turns outcomes into
//! serializable outputs carrying a success flag and a readable message.

use crate::db::{CacheHandle, RoutingContext, ScopedExecutor, ShardRegistry, UserRepository};
use crate::error::{ShardError, ShardResult};
use crate::models::{CacheEndpoint, ShardDescriptor, ShardSummary};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a single administrative operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutput {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSummary>,
}

impl OperationOutput {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            shard: None,
        }
    }

    fn with_shard(mut self, shard: Option<ShardSummary>) -> Self {
        self.shard = shard;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardListOutput {
    pub success: bool,
    pub default_key: String,
    pub count: usize,
    pub shards: Vec<ShardSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheBinding {
    pub key: String,
    /// `host:port`
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheBindingListOutput {
    pub success: bool,
    pub count: usize,
    pub bindings: Vec<CacheBinding>,
}

/// A shard whose part of a fan-out failed.
#[derive(Debug, Clone, Serialize)]
pub struct ShardFailure {
    pub key: String,
    pub code: &'static str,
    pub message: String,
}

/// Aggregated outcome of running one operation on every shard.
#[derive(Debug, Clone, Serialize)]
pub struct FanOutOutput<T> {
    /// True only when every shard succeeded.
    pub success: bool,
    pub partial: bool,
    pub message: String,
    pub results: Vec<ShardValue<T>>,
    pub errors: Vec<ShardFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardValue<T> {
    pub key: String,
    pub value: T,
}

#[derive(Debug, Clone)]
pub struct ShardService {
    registry: ShardRegistry,
    executor: ScopedExecutor,
    users: UserRepository,
}

impl ShardService {
    pub fn new(registry: ShardRegistry, cache_ttl: Duration) -> Self {
        Self {
            executor: ScopedExecutor::new(registry.clone()),
            users: UserRepository::new(registry.clone(), cache_ttl),
            registry,
        }
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &ScopedExecutor {
        &self.executor
    }

    pub fn users(&self) -> &UserRepository {
        &self.users
    }

    /// Register a shard and create the user table on it.
    ///
    /// A schema failure is logged but keeps the shard: the store is reachable and
    /// the table can be created later.
    pub async fn add_shard(&self, descriptor: ShardDescriptor) -> ShardResult<OperationOutput> {
        let key = descriptor.key.clone();
        self.registry.add(descriptor).await?;

        if let Err(e) = self.executor.run(&key, || self.users.ensure_schema()).await {
            warn!(shard = %key, error = %e, "Shard added but user schema could not be created");
        }

        Ok(OperationOutput::ok(format!("Shard '{}' added", key))
            .with_shard(self.registry.summary(&key)))
    }

    pub async fn remove_shard(&self, key: &str) -> ShardResult<OperationOutput> {
        self.registry.remove(key).await?;
        Ok(OperationOutput::ok(format!("Shard '{}' removed", key)))
    }

    pub fn list_shards(&self) -> ShardListOutput {
        let shards = self.registry.summaries();
        ShardListOutput {
            success: true,
            default_key: self.registry.default_key().to_string(),
            count: shards.len(),
            shards,
        }
    }

    /// Point the rest of the current unit of work at `key`.
    ///
    /// The key must be registered; the marker is left untouched otherwise.
    pub fn switch_to(&self, key: &str) -> ShardResult<OperationOutput> {
        self.registry.resolve(Some(key))?;
        RoutingContext::set(key)?;
        Ok(OperationOutput::ok(format!("Switched to shard '{}'", key)))
    }

    pub async fn add_cache_binding(
        &self,
        key: &str,
        endpoint: CacheEndpoint,
    ) -> ShardResult<OperationOutput> {
        let shown = endpoint.to_string();
        self.registry.add_cache_binding(key, endpoint).await?;
        Ok(
            OperationOutput::ok(format!("Cache {} bound to shard '{}'", shown, key))
                .with_shard(self.registry.summary(key)),
        )
    }

    pub async fn remove_cache_binding(&self, key: &str) -> ShardResult<OperationOutput> {
        self.registry.remove_cache_binding(key).await?;
        Ok(OperationOutput::ok(format!(
            "Cache binding of shard '{}' removed",
            key
        )))
    }

    pub fn list_cache_bindings(&self) -> CacheBindingListOutput {
        let bindings: Vec<CacheBinding> = self
            .registry
            .cache_bindings()
            .into_iter()
            .map(|(key, endpoint)| CacheBinding {
                key,
                endpoint: endpoint.to_string(),
            })
            .collect();
        CacheBindingListOutput {
            success: true,
            count: bindings.len(),
            bindings,
        }
    }

    /// Run `op` on every shard and report successes and failures per shard.
    pub async fn run_on_all_shards<F, Fut, T>(&self, op: F) -> FanOutOutput<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ShardResult<T>>,
    {
        let report = self.executor.run_on_all(op).await;
        let attempted = report.attempted();
        let succeeded = report.results.len();

        let message = if report.is_complete_success() {
            format!("Succeeded on all {} shards", attempted)
        } else if report.is_total_failure() {
            format!("Failed on all {} shards", attempted)
        } else {
            format!("Succeeded on {} of {} shards", succeeded, attempted)
        };

        FanOutOutput {
            success: report.is_complete_success(),
            partial: report.is_partial_success(),
            message,
            results: report
                .results
                .into_iter()
                .map(|(key, value)| ShardValue { key, value })
                .collect(),
            errors: report
                .errors
                .into_iter()
                .map(|(key, e)| {
                    warn!(shard = %key, error = %e, "Shard failed during fan-out");
                    ShardFailure {
                        key,
                        code: e.code(),
                        message: e.to_string(),
                    }
                })
                .collect(),
        }
    }

    /// Create the user table on every shard.
    pub async fn ensure_schema_everywhere(&self) -> FanOutOutput<()> {
        let output = self.run_on_all_shards(|| self.users.ensure_schema()).await;
        info!(message = %output.message, "User schema check finished");
        output
    }

    /// Store a raw cache entry on a shard's cache.
    pub async fn cache_set(
        &self,
        key: &str,
        name: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> ShardResult<OperationOutput> {
        self.executor
            .run(key, || async {
                let cache = self.current_cache()?;
                match ttl {
                    Some(ttl) => cache.set_with_ttl(name, value, ttl).await?,
                    None => cache.set(name, value).await?,
                }
                Ok::<_, ShardError>(OperationOutput::ok(format!(
                    "Stored '{}' in cache of shard '{}'",
                    name, key
                )))
            })
            .await
    }

    /// Read a raw cache entry from a shard's cache.
    pub async fn cache_get(&self, key: &str, name: &str) -> ShardResult<String> {
        self.executor
            .run(key, || async {
                let cache = self.current_cache()?;
                cache
                    .get(name)
                    .await?
                    .ok_or_else(|| ShardError::not_found("cache entry", name))
            })
            .await
    }

    fn current_cache(&self) -> ShardResult<CacheHandle> {
        let shard = self.registry.resolve_current()?;
        shard
            .cache
            .ok_or_else(|| ShardError::not_found("cache binding", shard.key))
    }
}
