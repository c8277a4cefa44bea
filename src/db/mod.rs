//! Shard routing core.
//!
//! - Pool and cache provisioning
//! - The shard registry
//! - The per-unit-of-work routing marker
//! - Scoped execution and fan-out
//! - The user repository that resolves its shard from the marker

pub mod cache;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod pool;
pub mod registry;
pub mod routing;
pub mod users;

pub use cache::{CacheClientFactory, CacheHandle};
pub use executor::{FanOutReport, ScopedExecutor};
pub use pool::{DbPool, PoolFactory};
pub use registry::{ResolvedShard, ShardEntry, ShardRegistry};
pub use routing::RoutingContext;
pub use users::UserRepository;
