//! Shard Router Library
//!
//! Holds many independent database pools (with optional Redis caches), adds and
//! removes them at runtime, and routes data access to one of them through a
//! per-unit-of-work marker instead of threading handles through every call.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod transport;

pub use config::Config;
pub use db::{RoutingContext, ScopedExecutor, ShardRegistry};
pub use error::{ShardError, ShardResult};
pub use service::ShardService;
