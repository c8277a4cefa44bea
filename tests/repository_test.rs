//! Integration tests for the user repository on SQLite shards.
//!
//! Tests verify that:
//! - CRUD operations land on the shard named by the routing marker
//! - Shards never see each other's rows
//! - Validation and missing records map to the expected errors
//! - Cache-aside reads work against a live Redis (set TEST_REDIS_ADDR)

use shard_router::ShardError;
use shard_router::config::PoolSizing;
use shard_router::db::{CacheClientFactory, PoolFactory, ScopedExecutor, ShardRegistry, UserRepository};
use shard_router::models::{CacheEndpoint, Driver, NewUser, ShardDescriptor};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn file_shard(dir: &Path, key: &str) -> ShardDescriptor {
    let url = format!("sqlite:{}", dir.join(format!("{key}.db")).display());
    ShardDescriptor::new(key, url, Driver::Sqlite).with_pool(PoolSizing {
        initial_size: Some(1),
        min_idle: Some(1),
        max_active: Some(4),
        max_wait_ms: Some(5_000),
    })
}

struct Fixture {
    registry: ShardRegistry,
    executor: ScopedExecutor,
    users: UserRepository,
    _dir: TempDir,
}

async fn setup(extra: &[&str]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry = ShardRegistry::bootstrap(
        file_shard(dir.path(), "default"),
        PoolFactory::new(),
        CacheClientFactory::default(),
    )
    .await
    .unwrap();
    for key in extra {
        registry.add(file_shard(dir.path(), key)).await.unwrap();
    }

    let executor = ScopedExecutor::new(registry.clone());
    let users = UserRepository::new(registry.clone(), Duration::from_secs(60));
    let report = executor.run_on_all(|| users.ensure_schema()).await;
    assert!(report.is_complete_success());

    Fixture {
        registry,
        executor,
        users,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_crud_on_named_shard() {
    let f = setup(&["east"]).await;
    let users = &f.users;

    let ada = NewUser::new("Ada", "ada@example.com");
    let created = f
        .executor
        .run("east", || users.create(&ada))
        .await
        .unwrap();
    assert_eq!(created.name, "Ada");

    let found = f
        .executor
        .run("east", || users.find_by_id(created.id))
        .await
        .unwrap();
    assert_eq!(found, created);

    let changes = NewUser::new("Ada L.", "ada@example.org");
    let updated = f
        .executor
        .run("east", || users.update(created.id, &changes))
        .await
        .unwrap();
    assert_eq!(updated.email, "ada@example.org");

    let listed = f.executor.run("east", || users.list()).await.unwrap();
    assert_eq!(listed, vec![updated]);

    f.executor
        .run("east", || users.delete(created.id))
        .await
        .unwrap();
    assert!(f.executor.run("east", || users.list()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shards_are_isolated() {
    let f = setup(&["east", "west"]).await;
    let users = &f.users;

    let east_user = NewUser::new("East", "east@example.com");
    f.executor
        .run("east", || users.create(&east_user))
        .await
        .unwrap();
    for name in ["W1", "W2"] {
        let west_user = NewUser::new(name, format!("{}@example.com", name.to_lowercase()));
        f.executor
            .run("west", || users.create(&west_user))
            .await
            .unwrap();
    }

    assert_eq!(f.executor.run("east", || users.list()).await.unwrap().len(), 1);
    assert_eq!(f.executor.run("west", || users.list()).await.unwrap().len(), 2);
    // No marker means the default shard
    assert!(users.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_user_is_not_found() {
    let f = setup(&[]).await;
    let users = &f.users;

    let err = users.find_by_id(404).await.unwrap_err();
    assert!(matches!(err, ShardError::NotFound { .. }));

    let err = users
        .update(404, &NewUser::new("Nobody", "nobody@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::NotFound { .. }));

    let err = users.delete(404).await.unwrap_err();
    assert!(matches!(err, ShardError::NotFound { .. }));
}

#[tokio::test]
async fn test_invalid_user_is_rejected_before_touching_the_shard() {
    let f = setup(&[]).await;
    let err = f
        .users
        .create(&NewUser::new("", "broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::InvalidArgument { .. }));
    assert!(f.users.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_shard_key() {
    let f = setup(&[]).await;
    let users = &f.users;
    let err = f
        .executor
        .run("ghost", || users.list())
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::NotFound { .. }));
}

#[tokio::test]
async fn test_unreachable_cache_does_not_fail_reads() {
    let f = setup(&["east"]).await;
    let users = &f.users;
    f.registry
        .add_cache_binding("east", CacheEndpoint::new("127.0.0.1", 1))
        .await
        .unwrap();

    let ada = NewUser::new("Ada", "ada@example.com");
    let created = f
        .executor
        .run("east", || users.create(&ada))
        .await
        .unwrap();
    let found = f
        .executor
        .run("east", || users.find_by_id(created.id))
        .await
        .unwrap();
    assert_eq!(found, created);
}

#[tokio::test]
async fn test_cache_aside_with_redis() {
    let Ok(addr) = std::env::var("TEST_REDIS_ADDR") else {
        eprintln!("Skipping: TEST_REDIS_ADDR not set");
        return;
    };
    let endpoint: CacheEndpoint = addr.parse().unwrap();

    let f = setup(&["east"]).await;
    let users = &f.users;
    f.registry.add_cache_binding("east", endpoint).await.unwrap();

    let ada = NewUser::new("Ada", "ada@example.com");
    let created = f
        .executor
        .run("east", || users.create(&ada))
        .await
        .unwrap();

    // Change the row behind the cache's back; the cached copy still answers
    let shard = f.registry.resolve(Some("east")).unwrap();
    let shard_router::db::DbPool::Sqlite(pool) = &shard.pool else {
        panic!("expected a SQLite pool");
    };
    sqlx::query("UPDATE users SET name = 'Changed' WHERE id = ?")
        .bind(created.id)
        .execute(pool)
        .await
        .unwrap();
    let cached = f
        .executor
        .run("east", || users.find_by_id(created.id))
        .await
        .unwrap();
    assert_eq!(cached.name, "Ada");

    // Delete evicts the entry
    f.executor
        .run("east", || users.delete(created.id))
        .await
        .unwrap();
    let cache = shard.cache.clone().unwrap();
    assert_eq!(cache.get(&format!("user:{}", created.id)).await.unwrap(), None);
}
