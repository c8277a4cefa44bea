//! Transport layer.
//!
//! The shard router is served over HTTP; see [`http`].

pub mod http;

pub use http::{AppState, HttpTransport, router};
