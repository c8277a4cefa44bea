//! Scoped execution against a chosen shard.
//!
//! [`ScopedExecutor::run`] is the way to point arbitrary data-access code at a
//! shard: the operation runs in its own routing scope with the marker set to
//! the key, and the scope is torn down however the operation ends.

use crate::db::registry::ShardRegistry;
use crate::db::routing::RoutingContext;
use futures_util::future::join_all;
use std::future::Future;
use tracing::debug;

/// Outcome of running one operation on every shard.
#[derive(Debug)]
pub struct FanOutReport<T, E> {
    /// Successful results, in shard key order.
    pub results: Vec<(String, T)>,
    /// Per-shard failures, in shard key order.
    pub errors: Vec<(String, E)>,
}

impl<T, E> FanOutReport<T, E> {
    pub fn is_complete_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_total_failure(&self) -> bool {
        self.results.is_empty() && !self.errors.is_empty()
    }

    pub fn is_partial_success(&self) -> bool {
        !self.results.is_empty() && !self.errors.is_empty()
    }

    /// Number of shards the operation was attempted on.
    pub fn attempted(&self) -> usize {
        self.results.len() + self.errors.len()
    }
}

#[derive(Debug, Clone)]
pub struct ScopedExecutor {
    registry: ShardRegistry,
}

impl ScopedExecutor {
    pub fn new(registry: ShardRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    /// Run `op` with the routing marker set to `key` and return its output unchanged.
    ///
    /// The key is not checked here; data access inside `op` reports unknown keys
    /// when it resolves. Nested calls get their own scope, so the caller's marker
    /// is intact afterwards.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        debug!(shard = %key, "Entering routing scope");
        let output = RoutingContext::scope(Some(key.to_string()), async move {
            let output = op().await;
            RoutingContext::clear();
            output
        })
        .await;
        debug!(shard = %key, "Left routing scope");
        output
    }

    /// Blocking counterpart of [`run`](Self::run) for synchronous code on the current thread.
    pub fn run_sync<R>(&self, key: &str, op: impl FnOnce() -> R) -> R {
        RoutingContext::sync_scope(Some(key.to_string()), || {
            let output = op();
            RoutingContext::clear();
            output
        })
    }

    /// Run `op` once per registered shard, concurrently, each in its own scope.
    ///
    /// A failing shard is recorded and never stops the others.
    pub async fn run_on_all<F, Fut, T, E>(&self, op: F) -> FanOutReport<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let keys = self.registry.list();
        debug!(shards = keys.len(), "Fanning out to all shards");

        let op = &op;
        let outcomes = join_all(keys.into_iter().map(|key| async move {
            let outcome = self.run(&key, op).await;
            (key, outcome)
        }))
        .await;

        let mut report = FanOutReport {
            results: Vec::new(),
            errors: Vec::new(),
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(value) => report.results.push((key, value)),
                Err(e) => report.errors.push((key, e)),
            }
        }
        report
    }
}
