//! Integration tests for routing isolation and fan-out.
//!
//! Tests verify that:
//! - Concurrent scoped runs each observe only their own key
//! - The marker is discarded when an operation fails or panics
//! - Fan-out attempts every shard and isolates per-shard failures

use rand::Rng;
use shard_router::ShardError;
use shard_router::config::PoolSizing;
use shard_router::db::{
    CacheClientFactory, PoolFactory, RoutingContext, ScopedExecutor, ShardRegistry,
};
use shard_router::models::{Driver, ShardDescriptor};
use std::time::Duration;

fn memory_shard(key: &str) -> ShardDescriptor {
    ShardDescriptor::new(key, "sqlite::memory:", Driver::Sqlite).with_pool(PoolSizing {
        initial_size: Some(1),
        min_idle: Some(1),
        max_active: Some(1),
        max_wait_ms: Some(5_000),
    })
}

async fn executor_with(keys: &[&str]) -> ScopedExecutor {
    let registry = ShardRegistry::bootstrap(
        memory_shard("default"),
        PoolFactory::new(),
        CacheClientFactory::default(),
    )
    .await
    .unwrap();
    for key in keys {
        registry.add(memory_shard(key)).await.unwrap();
    }
    ScopedExecutor::new(registry)
}

fn jitter() -> Duration {
    Duration::from_micros(rand::thread_rng().gen_range(0..2_000))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_runs_observe_own_key() {
    let executor = executor_with(&[]).await;
    let mut handles = Vec::new();

    for i in 0..64 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("shard-{i}");
            let seen = executor
                .run(&key, || async {
                    let mut seen = Vec::new();
                    for _ in 0..5 {
                        seen.push(RoutingContext::get());
                        tokio::time::sleep(jitter()).await;
                    }
                    seen
                })
                .await;
            (key, seen)
        }));
    }

    for handle in handles {
        let (key, seen) = handle.await.unwrap();
        assert!(seen.iter().all(|k| k.as_deref() == Some(key.as_str())));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_follow_marker() {
    let executor = executor_with(&["east", "west"]).await;
    let mut handles = Vec::new();

    for i in 0..32 {
        let executor = executor.clone();
        let key = if i % 2 == 0 { "east" } else { "west" };
        handles.push(tokio::spawn(async move {
            executor
                .run(key, || async {
                    tokio::time::sleep(jitter()).await;
                    executor.registry().resolve_current().map(|shard| shard.key)
                })
                .await
                .map(|resolved| (key, resolved))
        }));
    }

    for handle in handles {
        let (expected, resolved) = handle.await.unwrap().unwrap();
        assert_eq!(resolved, expected);
    }
}

#[tokio::test]
async fn test_marker_discarded_after_error() {
    let executor = executor_with(&[]).await;
    RoutingContext::scope(Some("outer".to_string()), async {
        let result: Result<(), ShardError> = executor
            .run("east", || async { Err(ShardError::internal("boom")) })
            .await;
        assert!(matches!(result, Err(ShardError::Internal { .. })));
        assert_eq!(RoutingContext::get().as_deref(), Some("outer"));
    })
    .await;
}

#[tokio::test]
async fn test_marker_discarded_after_panic() {
    let executor = executor_with(&[]).await;
    let task_executor = executor.clone();
    let joined = tokio::spawn(async move {
        task_executor
            .run("east", || async {
                if RoutingContext::get().as_deref() == Some("east") {
                    panic!("operation failed");
                }
            })
            .await
    })
    .await;
    assert!(joined.unwrap_err().is_panic());

    // The same thread-pool workers carry no marker afterwards
    let seen = tokio::spawn(async { RoutingContext::get() }).await.unwrap();
    assert_eq!(seen, None);
}

#[tokio::test]
async fn test_unknown_key_surfaces_on_resolve() {
    let executor = executor_with(&[]).await;
    let result = executor
        .run("ghost", || async { executor.registry().resolve_current() })
        .await;
    assert!(matches!(result, Err(ShardError::NotFound { .. })));
}

#[tokio::test]
async fn test_fan_out_with_one_failing_shard() {
    let executor = executor_with(&["east", "west"]).await;
    let report = executor
        .run_on_all(|| async {
            let shard = executor.registry().resolve_current()?;
            tokio::time::sleep(jitter()).await;
            if shard.key == "west" {
                return Err(ShardError::unavailable("west is down", "retry later"));
            }
            Ok(shard.key)
        })
        .await;

    assert_eq!(report.attempted(), 3);
    assert!(report.is_partial_success());
    let succeeded: Vec<&str> = report.results.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(succeeded, vec!["default", "east"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "west");
    assert!(matches!(report.errors[0].1, ShardError::Unavailable { .. }));
}

#[tokio::test]
async fn test_fan_out_runs_each_shard_in_its_own_scope() {
    let executor = executor_with(&["east", "west"]).await;
    let report = executor
        .run_on_all(|| async { Ok::<_, ShardError>(RoutingContext::get()) })
        .await;
    assert!(report.is_complete_success());
    for (key, seen) in report.results {
        assert_eq!(seen.as_deref(), Some(key.as_str()));
    }
    assert_eq!(RoutingContext::get(), None);
}
