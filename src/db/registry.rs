//! Shard registry.
//!
//! The registry is the single authority mapping shard keys to live pools and
//! cache handles. Readers take a cheap snapshot of the published map and never
//! wait on provisioning; writers build resources outside the lock, then swap in
//! a new map under a short write lock.

use crate::db::cache::{CacheClientFactory, CacheHandle};
use crate::db::pool::{DbPool, PoolFactory};
use crate::db::routing::RoutingContext;
use crate::error::{ShardError, ShardResult};
use crate::models::{
    CacheEndpoint, ShardDescriptor, ShardState, ShardSummary, validate_key,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

type ShardMap = BTreeMap<String, Arc<ShardEntry>>;

/// One published version of a shard.
///
/// Binding or unbinding a cache publishes a new version; all versions of the
/// same shard share the pool and the removed flag.
#[derive(Debug)]
pub struct ShardEntry {
    descriptor: ShardDescriptor,
    pool: DbPool,
    cache: Option<CacheHandle>,
    removed: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}

impl ShardEntry {
    fn new(descriptor: ShardDescriptor, pool: DbPool, cache: Option<CacheHandle>) -> Self {
        Self {
            descriptor,
            pool,
            cache,
            removed: Arc::new(AtomicBool::new(false)),
            created_at: Utc::now(),
        }
    }

    /// Next version of this shard with a different cache binding.
    fn with_cache(&self, cache: Option<CacheHandle>) -> Self {
        let mut descriptor = self.descriptor.clone();
        descriptor.cache = cache.as_ref().map(|c| c.endpoint().clone());
        Self {
            descriptor,
            pool: self.pool.clone(),
            cache,
            removed: Arc::clone(&self.removed),
            created_at: self.created_at,
        }
    }

    pub fn key(&self) -> &str {
        &self.descriptor.key
    }

    pub fn descriptor(&self) -> &ShardDescriptor {
        &self.descriptor
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn cache(&self) -> Option<&CacheHandle> {
        self.cache.as_ref()
    }

    pub fn state(&self) -> ShardState {
        if self.removed.load(Ordering::Acquire) {
            ShardState::Removed
        } else {
            ShardState::Active
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn summary(&self, is_default: bool) -> ShardSummary {
        let sizing = &self.descriptor.pool;
        ShardSummary {
            key: self.descriptor.key.clone(),
            driver: self.descriptor.driver,
            url: self.descriptor.masked_url(),
            is_default,
            state: self.state(),
            cache: self.descriptor.cache.as_ref().map(|c| c.to_string()),
            initial_size: sizing.initial_size_or_default(),
            min_idle: sizing.min_idle_or_default(),
            max_active: sizing.max_active_or_default(),
            max_wait_ms: sizing.max_wait_or_default().as_millis() as u64,
            created_at: self.created_at,
        }
    }

    async fn close(&self) {
        self.removed.store(true, Ordering::Release);
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
        self.pool.close().await;
    }
}

/// The pool and cache a unit of work should use.
#[derive(Debug, Clone)]
pub struct ResolvedShard {
    pub key: String,
    pub pool: DbPool,
    pub cache: Option<CacheHandle>,
    removed: Arc<AtomicBool>,
}

impl ResolvedShard {
    fn from_entry(entry: &ShardEntry) -> Self {
        Self {
            key: entry.descriptor.key.clone(),
            pool: entry.pool.clone(),
            cache: entry.cache.clone(),
            removed: Arc::clone(&entry.removed),
        }
    }

    /// `Removed` once the shard has been unpublished, even if this handle is still held.
    pub fn state(&self) -> ShardState {
        if self.removed.load(Ordering::Acquire) {
            ShardState::Removed
        } else {
            ShardState::Active
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardRegistry {
    default_key: Arc<str>,
    shards: Arc<RwLock<Arc<ShardMap>>>,
    pool_factory: PoolFactory,
    cache_factory: CacheClientFactory,
}

impl ShardRegistry {
    /// Provision the default shard and create a registry holding only it.
    pub async fn bootstrap(
        default: ShardDescriptor,
        pool_factory: PoolFactory,
        cache_factory: CacheClientFactory,
    ) -> ShardResult<Self> {
        let key = default.key.clone();
        let entry = provision(&pool_factory, &cache_factory, default).await?;
        info!(shard = %key, "Default shard ready");

        let mut map = ShardMap::new();
        map.insert(key.clone(), Arc::new(entry));
        Ok(Self {
            default_key: Arc::from(key),
            shards: Arc::new(RwLock::new(Arc::new(map))),
            pool_factory,
            cache_factory,
        })
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn is_default(&self, key: &str) -> bool {
        key == &*self.default_key
    }

    /// Latest published map. The lock only guards an `Arc` swap, so a poisoned
    /// lock still holds a consistent map.
    fn snapshot(&self) -> Arc<ShardMap> {
        let guard = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Apply `change` to a copy of the published map and publish it, all under the write lock.
    fn publish<T>(&self, change: impl FnOnce(&mut ShardMap) -> T) -> T {
        let mut guard = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ShardMap::clone(&guard);
        let out = change(&mut next);
        *guard = Arc::new(next);
        out
    }

    /// Provision and publish a new shard.
    ///
    /// On any failure the published map is left exactly as it was.
    pub async fn add(&self, descriptor: ShardDescriptor) -> ShardResult<()> {
        let key = descriptor.key.clone();
        validate_key(&key)?;

        if self.snapshot().contains_key(&key) {
            warn!(shard = %key, "Refusing to add shard: key already registered");
            return Err(ShardError::already_exists("shard", key));
        }

        let entry = provision(&self.pool_factory, &self.cache_factory, descriptor).await?;

        // Re-check after async work: a concurrent add may have won the key
        let loser = self.publish(|map| {
            if map.contains_key(&key) {
                Some(entry)
            } else {
                map.insert(key.clone(), Arc::new(entry));
                None
            }
        });

        if let Some(entry) = loser {
            entry.close().await;
            warn!(shard = %key, "Concurrent add detected; closed duplicate resources");
            return Err(ShardError::already_exists("shard", key));
        }

        info!(shard = %key, "Shard added");
        Ok(())
    }

    /// Unpublish a shard, then close its cache and pool.
    ///
    /// Operations already holding the pool finish before the pool closes.
    pub async fn remove(&self, key: &str) -> ShardResult<()> {
        validate_key(key)?;
        if self.is_default(key) {
            warn!(shard = %key, "Refusing to remove the default shard");
            return Err(ShardError::forbidden(
                format!("remove shard '{}'", key),
                "the default shard cannot be removed",
            ));
        }

        let removed = self.publish(|map| map.remove(key));
        let Some(entry) = removed else {
            return Err(ShardError::not_found("shard", key));
        };

        entry.close().await;
        info!(shard = %key, "Shard removed and closed");
        Ok(())
    }

    /// Look up a shard. `None` means the default shard. Never blocks on provisioning.
    ///
    /// Any non-empty key that is not registered is `NotFound`, malformed or not.
    pub fn resolve(&self, key: Option<&str>) -> ShardResult<ResolvedShard> {
        let key = match key {
            Some("") => return Err(ShardError::invalid_argument("Shard key cannot be empty")),
            Some(key) => key,
            None => self.default_key(),
        };
        match self.snapshot().get(key) {
            Some(entry) => {
                debug!(shard = %key, "Resolved shard");
                Ok(ResolvedShard::from_entry(entry))
            }
            None => Err(ShardError::not_found("shard", key)),
        }
    }

    /// Resolve the shard named by the current routing marker.
    pub fn resolve_current(&self) -> ShardResult<ResolvedShard> {
        self.resolve(RoutingContext::get().as_deref())
    }

    /// Registered keys in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<ShardSummary> {
        self.snapshot()
            .values()
            .map(|entry| entry.summary(self.is_default(entry.key())))
            .collect()
    }

    pub fn summary(&self, key: &str) -> Option<ShardSummary> {
        self.snapshot()
            .get(key)
            .map(|entry| entry.summary(self.is_default(key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.snapshot().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Attach a cache to an existing shard.
    pub async fn add_cache_binding(&self, key: &str, endpoint: CacheEndpoint) -> ShardResult<()> {
        validate_key(key)?;
        {
            let map = self.snapshot();
            let entry = map
                .get(key)
                .ok_or_else(|| ShardError::not_found("shard", key))?;
            if entry.cache.is_some() {
                return Err(ShardError::already_exists("cache binding", key));
            }
        }

        let cache = self.cache_factory.create(&endpoint)?;

        let outcome = self.publish(|map| {
            let Some(entry) = map.get(key) else {
                return Err(ShardError::not_found("shard", key));
            };
            if entry.cache.is_some() {
                return Err(ShardError::already_exists("cache binding", key));
            }
            let next = entry.with_cache(Some(cache.clone()));
            map.insert(key.to_string(), Arc::new(next));
            Ok(())
        });

        if let Err(e) = outcome {
            cache.close().await;
            warn!(shard = %key, cache = %endpoint, error = %e, "Cache binding not attached");
            return Err(e);
        }

        info!(shard = %key, cache = %endpoint, "Cache binding added");
        Ok(())
    }

    /// Detach and close a shard's cache.
    pub async fn remove_cache_binding(&self, key: &str) -> ShardResult<()> {
        validate_key(key)?;
        let detached = self.publish(|map| {
            let entry = map
                .get(key)
                .ok_or_else(|| ShardError::not_found("cache binding", key))?;
            let Some(cache) = entry.cache.clone() else {
                return Err(ShardError::not_found("cache binding", key));
            };
            let next = entry.with_cache(None);
            map.insert(key.to_string(), Arc::new(next));
            Ok(cache)
        })?;

        detached.close().await;
        info!(shard = %key, cache = %detached.endpoint(), "Cache binding removed");
        Ok(())
    }

    /// Keys with a cache bound, with their endpoints.
    pub fn cache_bindings(&self) -> Vec<(String, CacheEndpoint)> {
        self.snapshot()
            .values()
            .filter_map(|entry| {
                entry
                    .cache
                    .as_ref()
                    .map(|c| (entry.key().to_string(), c.endpoint().clone()))
            })
            .collect()
    }

    /// Unpublish and close every shard, the default included. Shutdown only.
    pub async fn close_all(&self) {
        let drained = self.publish(std::mem::take);
        for (key, entry) in drained {
            info!(shard = %key, "Closing shard");
            entry.close().await;
        }
        info!("All shards closed");
    }
}

/// Build the pool and optional cache for a descriptor; nothing leaks on failure.
async fn provision(
    pool_factory: &PoolFactory,
    cache_factory: &CacheClientFactory,
    descriptor: ShardDescriptor,
) -> ShardResult<ShardEntry> {
    descriptor.validate()?;
    let pool = pool_factory.create(&descriptor).await?;

    let cache = match &descriptor.cache {
        Some(endpoint) => match cache_factory.create(endpoint) {
            Ok(cache) => Some(cache),
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        },
        None => None,
    };

    if let Some(version) = pool.server_version().await {
        debug!(shard = %descriptor.key, version = %version, "Shard server version");
    }

    Ok(ShardEntry::new(descriptor, pool, cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSizing;
    use crate::models::Driver;

    fn sizing() -> PoolSizing {
        PoolSizing {
            initial_size: Some(1),
            min_idle: Some(1),
            max_active: Some(2),
            max_wait_ms: Some(2_000),
        }
    }

    fn memory_shard(key: &str) -> ShardDescriptor {
        ShardDescriptor::new(key, "sqlite::memory:", Driver::Sqlite).with_pool(sizing())
    }

    async fn registry() -> ShardRegistry {
        ShardRegistry::bootstrap(
            memory_shard("default"),
            PoolFactory::new(),
            CacheClientFactory::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_contains_only_default() {
        let registry = registry().await;
        assert_eq!(registry.list(), vec!["default".to_string()]);
        assert!(registry.is_default("default"));
        assert_eq!(registry.resolve(None).unwrap().key, "default");
    }

    #[tokio::test]
    async fn test_add_resolve_remove_cycle() {
        let registry = registry().await;
        registry.add(memory_shard("east")).await.unwrap();
        assert_eq!(registry.list(), vec!["default", "east"]);

        let resolved = registry.resolve(Some("east")).unwrap();
        assert_eq!(resolved.key, "east");
        assert_eq!(resolved.state(), ShardState::Active);

        let err = registry.add(memory_shard("east")).await.unwrap_err();
        assert!(matches!(err, ShardError::AlreadyExists { .. }));

        registry.remove("east").await.unwrap();
        assert!(matches!(
            registry.resolve(Some("east")),
            Err(ShardError::NotFound { .. })
        ));
        // Holders of the old handle observe the removal
        assert_eq!(resolved.state(), ShardState::Removed);
        assert!(resolved.pool.is_closed());

        registry.add(memory_shard("east")).await.unwrap();
        let fresh = registry.resolve(Some("east")).unwrap();
        assert_eq!(fresh.state(), ShardState::Active);
        assert!(!fresh.pool.is_closed());
    }

    #[tokio::test]
    async fn test_remove_default_forbidden_and_unknown_not_found() {
        let registry = registry().await;
        assert!(matches!(
            registry.remove("default").await,
            Err(ShardError::Forbidden { .. })
        ));
        assert!(matches!(
            registry.remove("ghost").await,
            Err(ShardError::NotFound { .. })
        ));
        assert!(matches!(
            registry.remove("").await,
            Err(ShardError::InvalidArgument { .. })
        ));
        assert!(registry.resolve(None).is_ok());
    }

    #[tokio::test]
    async fn test_resolve_unregistered_key_is_not_found() {
        let registry = registry().await;
        for key in ["ghost", "bad key!", "east\u{e9}"] {
            assert!(matches!(
                registry.resolve(Some(key)),
                Err(ShardError::NotFound { .. })
            ));
        }
        assert!(matches!(
            registry.resolve(Some("")),
            Err(ShardError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_provisioning_leaves_registry_unchanged() {
        let registry = registry().await;
        let broken = ShardDescriptor::new("broken", "sqlite:/nonexistent_dir/x/y.db", Driver::Sqlite)
            .with_pool(sizing());

        let err = registry.add(broken).await.unwrap_err();
        assert!(matches!(err, ShardError::ProvisioningFailed { .. }));
        assert_eq!(registry.list(), vec!["default"]);
        assert!(!registry.contains("broken"));
    }

    #[tokio::test]
    async fn test_cache_binding_lifecycle() {
        let registry = registry().await;
        registry.add(memory_shard("east")).await.unwrap();

        let endpoint = CacheEndpoint::new("127.0.0.1", 6379);
        assert!(matches!(
            registry.add_cache_binding("ghost", endpoint.clone()).await,
            Err(ShardError::NotFound { .. })
        ));

        registry
            .add_cache_binding("east", endpoint.clone())
            .await
            .unwrap();
        assert!(matches!(
            registry.add_cache_binding("east", endpoint.clone()).await,
            Err(ShardError::AlreadyExists { .. })
        ));
        assert_eq!(
            registry.cache_bindings(),
            vec![("east".to_string(), endpoint.clone())]
        );

        let resolved = registry.resolve(Some("east")).unwrap();
        let cache = resolved.cache.clone().unwrap();
        assert_eq!(
            registry.summary("east").unwrap().cache.as_deref(),
            Some("127.0.0.1:6379")
        );

        registry.remove_cache_binding("east").await.unwrap();
        assert!(cache.is_closed().await);
        assert!(registry.resolve(Some("east")).unwrap().cache.is_none());
        assert!(matches!(
            registry.remove_cache_binding("east").await,
            Err(ShardError::NotFound { .. })
        ));
        // The pool survives cache changes
        assert!(!registry.resolve(Some("east")).unwrap().pool.is_closed());
    }

    #[tokio::test]
    async fn test_summaries_report_configured_sizing() {
        let registry = registry().await;
        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].is_default);
        assert_eq!(summaries[0].max_active, 2);
        assert_eq!(summaries[0].max_wait_ms, 2_000);
        assert_eq!(summaries[0].state, ShardState::Active);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = registry().await;
        registry.add(memory_shard("east")).await.unwrap();
        let east = registry.resolve(Some("east")).unwrap();

        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(east.pool.is_closed());
    }
}
