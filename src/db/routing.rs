//! Per-unit-of-work routing marker.
//!
//! The marker names the shard the current unit of work talks to. It lives in a
//! tokio task-local, so it follows one future (or one synchronous closure) and
//! is never visible to other tasks. A scope restores the enclosing value when
//! it ends, on return, error, or unwind alike.
//!
//! Spawned tasks do not inherit the marker; they start outside any scope and
//! resolve to the default shard.

use crate::error::{ShardError, ShardResult};
use std::cell::RefCell;
use std::future::Future;
use tracing::debug;

tokio::task_local! {
    static CURRENT_SHARD: RefCell<Option<String>>;
}

/// Access to the routing marker of the current unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingContext;

impl RoutingContext {
    /// Run `fut` as a new unit of work whose marker starts as `initial`.
    pub async fn scope<F>(initial: Option<String>, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SHARD.scope(RefCell::new(initial), fut).await
    }

    /// Run `f` as a new unit of work on the current thread.
    pub fn sync_scope<R>(initial: Option<String>, f: impl FnOnce() -> R) -> R {
        CURRENT_SHARD.sync_scope(RefCell::new(initial), f)
    }

    /// Point the current unit of work at `key`.
    ///
    /// Fails outside a scope: there is no unit of work to attach the marker to.
    pub fn set(key: impl Into<String>) -> ShardResult<()> {
        let key = key.into();
        CURRENT_SHARD
            .try_with(|cell| {
                debug!(shard = %key, "Routing marker set");
                *cell.borrow_mut() = Some(key);
            })
            .map_err(|_| ShardError::internal("Routing marker set outside of a routing scope"))
    }

    /// The current marker, or `None` when unset or outside any scope.
    pub fn get() -> Option<String> {
        CURRENT_SHARD
            .try_with(|cell| cell.borrow().clone())
            .ok()
            .flatten()
    }

    /// Unset the marker. Safe to call any number of times, in or out of a scope.
    pub fn clear() {
        let _ = CURRENT_SHARD.try_with(|cell| {
            if let Some(previous) = cell.borrow_mut().take() {
                debug!(shard = %previous, "Routing marker cleared");
            }
        });
    }

    /// Whether the caller runs inside a routing scope.
    pub fn in_scope() -> bool {
        CURRENT_SHARD.try_with(|_| ()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_outside_scope_is_unset() {
        assert!(!RoutingContext::in_scope());
        assert_eq!(RoutingContext::get(), None);
        RoutingContext::clear();
        assert!(matches!(
            RoutingContext::set("east"),
            Err(ShardError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_get_clear_in_scope() {
        RoutingContext::scope(None, async {
            assert_eq!(RoutingContext::get(), None);
            RoutingContext::set("east").unwrap();
            assert_eq!(RoutingContext::get().as_deref(), Some("east"));
            RoutingContext::clear();
            assert_eq!(RoutingContext::get(), None);
            RoutingContext::clear();
            assert_eq!(RoutingContext::get(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_scope_restores_outer_marker() {
        RoutingContext::scope(Some("outer".to_string()), async {
            RoutingContext::scope(Some("inner".to_string()), async {
                assert_eq!(RoutingContext::get().as_deref(), Some("inner"));
                RoutingContext::clear();
            })
            .await;
            assert_eq!(RoutingContext::get().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit_marker() {
        RoutingContext::scope(Some("east".to_string()), async {
            let seen = tokio::spawn(async { RoutingContext::get() }).await.unwrap();
            assert_eq!(seen, None);
        })
        .await;
    }

    #[test]
    fn test_sync_scope() {
        let seen = RoutingContext::sync_scope(Some("west".to_string()), RoutingContext::get);
        assert_eq!(seen.as_deref(), Some("west"));
        assert_eq!(RoutingContext::get(), None);
    }
}
