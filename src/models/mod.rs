//! Data models for the shard router.

pub mod shard;
pub mod user;

pub use shard::{
    CacheEndpoint, Driver, MAX_KEY_LEN, ShardDescriptor, ShardState, ShardSummary, validate_key,
};
pub use user::{NewUser, User};
