//! Shard Router - Main entry point.
//!
//! Bootstraps the default shard, registers the configured shards and cache
//! bindings, then serves the HTTP API until a shutdown signal arrives.

use clap::Parser;
use shard_router::auth::AuthConfig;
use shard_router::config::Config;
use shard_router::db::{CacheClientFactory, PoolFactory, ShardRegistry};
use shard_router::service::ShardService;
use shard_router::transport::{AppState, HttpTransport};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting Shard Router v{}", env!("CARGO_PKG_VERSION"));

    // Parse everything up front so a bad argument fails before any pool opens
    let default_shard = config.default_descriptor()?;
    let shards = config.parse_shards()?;
    let cache_bindings = config.parse_cache_bindings()?;
    let auth = AuthConfig::from_tokens(config.auth_tokens.clone())?;

    let registry = ShardRegistry::bootstrap(
        default_shard,
        PoolFactory::new(),
        CacheClientFactory::new(config.cache_connect_timeout_duration()),
    )
    .await?;

    info!(count = shards.len(), "Registering configured shards");
    for descriptor in shards {
        if let Err(e) = registry.add(descriptor).await {
            error!(error = %e, "Failed to register configured shard");
            registry.close_all().await;
            return Err(e.into());
        }
    }

    for (key, endpoint) in cache_bindings {
        if let Err(e) = registry.add_cache_binding(&key, endpoint).await {
            error!(shard = %key, error = %e, "Failed to bind configured cache");
            registry.close_all().await;
            return Err(e.into());
        }
    }

    let service = ShardService::new(registry, config.cache_ttl_duration());

    let schema = service.ensure_schema_everywhere().await;
    for failure in &schema.errors {
        warn!(shard = %failure.key, error = %failure.message, "User schema missing on shard");
    }

    if auth.is_enabled() {
        info!(tokens = auth.token_count(), "Admin endpoints require a bearer token");
    } else {
        warn!("Admin endpoints are not protected; set --auth-token to require a bearer token");
    }

    let transport = HttpTransport::new(
        AppState::new(service, auth),
        &config.http_host,
        config.http_port,
    );

    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
