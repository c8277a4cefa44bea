//! Driver dispatch macro.
//!
//! Generates one match arm per `DbPool` variant so driver-specific code stays
//! linear and readable. Expands at compile time with zero runtime overhead.

/// Macro for generating `DbPool` dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     Postgres(p) => p.close().await,
///     MySql(p) => p.close().await,
///     Sqlite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
