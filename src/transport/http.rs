//! HTTP transport for the shard router.
//!
//! Every request runs in its own routing scope. An `X-Shard-Key` header
//! switches that scope to another shard before the handler runs, so the
//! marker-driven routes (`/api/users`) follow the header and fall back to the
//! default shard without it.

use crate::auth::{AuthConfig, auth_middleware};
use crate::config::PoolSizing;
use crate::db::RoutingContext;
use crate::error::{ShardError, ShardResult};
use crate::models::{CacheEndpoint, Driver, NewUser, ShardDescriptor};
use crate::service::ShardService;
use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{MethodRouter, delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Request header naming the shard for the rest of the request.
pub const SHARD_HEADER: &str = "x-shard-key";

/// Request counters shown by the status endpoint.
#[derive(Debug, Default)]
pub struct ApiCounters {
    api_calls: AtomicU64,
}

impl ApiCounters {
    fn record(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: ShardService,
    pub auth: Arc<AuthConfig>,
    pub counters: Arc<ApiCounters>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: ShardService, auth: AuthConfig) -> Self {
        Self {
            service,
            auth: Arc::new(auth),
            counters: Arc::new(ApiCounters::default()),
            started_at: Utc::now(),
        }
    }
}

/// Body of `POST /api/shards`.
#[derive(Debug, Deserialize)]
pub struct AddShardRequest {
    pub key: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Inferred from the URL scheme when omitted.
    #[serde(default)]
    pub driver: Option<Driver>,
    #[serde(default)]
    pub initial_size: Option<u32>,
    #[serde(default)]
    pub min_idle: Option<u32>,
    #[serde(default)]
    pub max_active: Option<u32>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub cache: Option<CacheEndpoint>,
}

impl AddShardRequest {
    pub fn into_descriptor(self) -> ShardResult<ShardDescriptor> {
        let driver = match self.driver {
            Some(driver) => driver,
            None => Driver::from_url(&self.url).ok_or_else(|| {
                ShardError::invalid_argument("Cannot infer driver from connection URL; set driver")
            })?,
        };
        Ok(ShardDescriptor {
            key: self.key,
            url: self.url,
            username: self.username,
            password: self.password,
            driver,
            pool: PoolSizing {
                initial_size: self.initial_size,
                min_idle: self.min_idle,
                max_active: self.max_active,
                max_wait_ms: self.max_wait_ms,
            },
            cache: self.cache,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheEntryRequest {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct DataOutput<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    shard: Option<String>,
    data: T,
}

fn data<T>(shard: Option<String>, data: T) -> Json<DataOutput<T>> {
    Json(DataOutput {
        success: true,
        shard,
        data,
    })
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    success: bool,
    status: &'static str,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
    api_calls: u64,
    shard_count: usize,
    default_shard: String,
    version: &'static str,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let auth = state.auth.clone();
    let guard = move |route: MethodRouter<AppState>| -> MethodRouter<AppState> {
        if auth.is_enabled() {
            route.route_layer(middleware::from_fn_with_state(
                auth.clone(),
                auth_middleware,
            ))
        } else {
            route
        }
    };

    Router::new()
        .route("/api/shards", get(list_shards).merge(guard(post(add_shard))))
        .route("/api/shards/{key}", guard(delete(remove_shard)))
        .route(
            "/api/shards/{key}/cache",
            guard(post(add_cache_binding).delete(remove_cache_binding)),
        )
        .route("/api/cache-bindings", get(list_cache_bindings))
        .route("/api/shards/{key}/cache/entries", post(set_cache_entry))
        .route("/api/shards/{key}/cache/entries/{name}", get(get_cache_entry))
        .route(
            "/api/shards/{key}/users",
            post(create_user_on).get(list_users_on),
        )
        .route(
            "/api/shards/{key}/users/{id}",
            get(get_user_on).put(update_user_on).delete(delete_user_on),
        )
        .route("/api/users", post(create_user).get(list_users))
        .route("/api/all/users", post(create_user_everywhere).get(list_users_everywhere))
        .route("/api/info/status", get(status))
        .layer(middleware::from_fn_with_state(state.clone(), routing_scope))
        .with_state(state)
}

/// Run the request in a fresh routing scope, applying `X-Shard-Key` if present.
async fn routing_scope(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.counters.record();
    // An unreadable header is rejected, never routed to the default shard
    let requested = match request.headers().get(SHARD_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(value)) => Some(value.trim().to_string()),
        Some(Err(_)) => {
            warn!("Rejected request with a non-ASCII shard header");
            return ShardError::invalid_argument(format!(
                "The {} header must be a visible ASCII shard key",
                SHARD_HEADER
            ))
            .into_response();
        }
    };

    RoutingContext::scope(None, async move {
        if let Some(key) = requested {
            if let Err(e) = state.service.switch_to(&key) {
                warn!(shard = %key, error = %e, "Rejected request for unknown shard");
                return e.into_response();
            }
        }
        next.run(request).await
    })
    .await
}

async fn list_shards(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list_shards())
}

async fn add_shard(
    State(state): State<AppState>,
    Json(request): Json<AddShardRequest>,
) -> ShardResult<impl IntoResponse> {
    let descriptor = request.into_descriptor()?;
    let output = state.service.add_shard(descriptor).await?;
    Ok((StatusCode::CREATED, Json(output)))
}

async fn remove_shard(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ShardResult<impl IntoResponse> {
    Ok(Json(state.service.remove_shard(&key).await?))
}

async fn add_cache_binding(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(endpoint): Json<CacheEndpoint>,
) -> ShardResult<impl IntoResponse> {
    let output = state.service.add_cache_binding(&key, endpoint).await?;
    Ok((StatusCode::CREATED, Json(output)))
}

async fn remove_cache_binding(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ShardResult<impl IntoResponse> {
    Ok(Json(state.service.remove_cache_binding(&key).await?))
}

async fn list_cache_bindings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list_cache_bindings())
}

async fn set_cache_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(entry): Json<CacheEntryRequest>,
) -> ShardResult<impl IntoResponse> {
    let ttl = entry.ttl_secs.map(Duration::from_secs);
    let output = state
        .service
        .cache_set(&key, &entry.name, &entry.value, ttl)
        .await?;
    Ok(Json(output))
}

async fn get_cache_entry(
    State(state): State<AppState>,
    Path((key, name)): Path<(String, String)>,
) -> ShardResult<impl IntoResponse> {
    let value = state.service.cache_get(&key, &name).await?;
    Ok(data(Some(key), value))
}

async fn create_user_on(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(new_user): Json<NewUser>,
) -> ShardResult<impl IntoResponse> {
    let users = state.service.users();
    let user = state
        .service
        .executor()
        .run(&key, || users.create(&new_user))
        .await?;
    Ok((StatusCode::CREATED, data(Some(key), user)))
}

async fn list_users_on(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ShardResult<impl IntoResponse> {
    let users = state.service.users();
    let list = state.service.executor().run(&key, || users.list()).await?;
    Ok(data(Some(key), list))
}

async fn get_user_on(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, i64)>,
) -> ShardResult<impl IntoResponse> {
    let users = state.service.users();
    let user = state
        .service
        .executor()
        .run(&key, || users.find_by_id(id))
        .await?;
    Ok(data(Some(key), user))
}

async fn update_user_on(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, i64)>,
    Json(changes): Json<NewUser>,
) -> ShardResult<impl IntoResponse> {
    let users = state.service.users();
    let user = state
        .service
        .executor()
        .run(&key, || users.update(id, &changes))
        .await?;
    Ok(data(Some(key), user))
}

async fn delete_user_on(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, i64)>,
) -> ShardResult<impl IntoResponse> {
    let users = state.service.users();
    state
        .service
        .executor()
        .run(&key, || users.delete(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shard named by the request marker, for echoing in responses.
fn current_shard(state: &AppState) -> String {
    RoutingContext::get().unwrap_or_else(|| state.service.registry().default_key().to_string())
}

async fn create_user(
    State(state): State<AppState>,
    Json(new_user): Json<NewUser>,
) -> ShardResult<impl IntoResponse> {
    let user = state.service.users().create(&new_user).await?;
    Ok((StatusCode::CREATED, data(Some(current_shard(&state)), user)))
}

async fn list_users(State(state): State<AppState>) -> ShardResult<impl IntoResponse> {
    let list = state.service.users().list().await?;
    Ok(data(Some(current_shard(&state)), list))
}

async fn create_user_everywhere(
    State(state): State<AppState>,
    Json(new_user): Json<NewUser>,
) -> ShardResult<impl IntoResponse> {
    new_user.validate()?;
    let users = state.service.users();
    let output = state
        .service
        .run_on_all_shards(|| users.create(&new_user))
        .await;
    Ok(Json(output))
}

async fn list_users_everywhere(State(state): State<AppState>) -> impl IntoResponse {
    let users = state.service.users();
    Json(state.service.run_on_all_shards(|| users.list()).await)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.service.registry();
    Json(StatusOutput {
        success: true,
        status: "RUNNING",
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        api_calls: state.counters.api_calls(),
        shard_count: registry.len(),
        default_shard: registry.default_key().to_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// HTTP server that owns the shutdown sequence.
pub struct HttpTransport {
    state: AppState,
    host: String,
    port: u16,
}

impl HttpTransport {
    pub fn new(state: AppState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state,
            host: host.into(),
            port,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serve until SIGINT/SIGTERM, then close every shard.
    pub async fn run(&self) -> ShardResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting shard router HTTP server on {}", bind_addr);

        let app = router(self.state.clone());

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ShardError::unavailable(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        // Keep-alive connections may hold the server open, so force exit after a timeout
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        self.state.service.registry().close_all().await;
                        return Err(ShardError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for connections to close (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        info!("Closing shards");
        self.state.service.registry().close_all().await;
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
