//! Shard-related data models.
//!
//! This module defines the descriptor a shard is created from and the
//! secret-free views handed to collaborators.

use crate::config::PoolSizing;
use crate::error::{ShardError, ShardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;

/// Longest accepted shard key.
pub const MAX_KEY_LEN: usize = 64;

/// Supported relational drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[serde(alias = "postgresql", alias = "pg")]
    Postgres,
    /// Includes MariaDB
    #[serde(alias = "mariadb")]
    MySql,
    Sqlite,
}

impl Driver {
    /// Infer the driver from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySql)
        } else if lower.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Get the display name for this driver.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Whether the driver talks to a server and therefore needs credentials.
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for Driver {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ShardError::invalid_argument(format!(
                "Unknown driver '{}'. Expected one of: postgres, mysql, sqlite",
                other
            ))),
        }
    }
}

/// Network endpoint of a cache server bound to a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEndpoint {
    pub host: String,
    pub port: u16,
}

impl CacheEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.host.trim().is_empty() {
            return Err(ShardError::invalid_argument("Cache host cannot be empty"));
        }
        if self.port == 0 {
            return Err(ShardError::invalid_argument("Cache port must be greater than 0"));
        }
        Ok(())
    }

    /// Redis connection URL for this endpoint. IPv6 literals are bracketed.
    pub fn redis_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("redis://[{}]:{}/", self.host, self.port)
        } else {
            format!("redis://{}:{}/", self.host, self.port)
        }
    }
}

impl std::fmt::Display for CacheEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for CacheEndpoint {
    type Err = ShardError;

    /// Parse `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(|| {
            ShardError::invalid_argument(format!("Cache endpoint '{}' must be host:port", s))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port.parse::<u16>().map_err(|e| {
            ShardError::invalid_argument(format!("Invalid cache port '{}': {}", port, e))
        })?;
        let endpoint = Self::new(host, port);
        endpoint.validate()?;
        Ok(endpoint)
    }
}

/// Everything needed to provision one shard. Never mutated once registered;
/// an update is a remove followed by an add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub key: String,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub driver: Driver,
    #[serde(default)]
    pub pool: PoolSizing,
    #[serde(default)]
    pub cache: Option<CacheEndpoint>,
}

impl ShardDescriptor {
    /// Create a descriptor with default pool sizing and no cache.
    pub fn new(key: impl Into<String>, url: impl Into<String>, driver: Driver) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            username: None,
            password: None,
            driver,
            pool: PoolSizing::default(),
            cache: None,
        }
    }

    /// Create a descriptor, inferring the driver from the URL scheme.
    pub fn from_url(key: impl Into<String>, url: impl Into<String>) -> ShardResult<Self> {
        let url = url.into();
        let driver = Driver::from_url(&url).ok_or_else(|| {
            ShardError::invalid_argument("Cannot infer driver from connection URL scheme")
        })?;
        Ok(Self::new(key, url, driver))
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_pool(mut self, pool: PoolSizing) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_cache(mut self, cache: CacheEndpoint) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Check every field required to provision this shard.
    pub fn validate(&self) -> ShardResult<()> {
        validate_key(&self.key)?;

        if self.url.trim().is_empty() {
            return Err(ShardError::invalid_argument(format!(
                "Shard '{}' has an empty connection URL",
                self.key
            )));
        }

        match Driver::from_url(&self.url) {
            Some(scheme_driver) if scheme_driver == self.driver => {}
            Some(scheme_driver) => {
                return Err(ShardError::invalid_argument(format!(
                    "Driver {} does not match the {} connection URL of shard '{}'",
                    self.driver, scheme_driver, self.key
                )));
            }
            None => {
                return Err(ShardError::invalid_argument(format!(
                    "Unsupported connection URL scheme for shard '{}'",
                    self.key
                )));
            }
        }

        if self.driver.is_networked() && self.effective_username().is_none() {
            return Err(ShardError::invalid_argument(format!(
                "Shard '{}' needs credentials: set a username or put it in the URL",
                self.key
            )));
        }

        self.pool.validate().map_err(ShardError::invalid_argument)?;

        if let Some(cache) = &self.cache {
            cache.validate()?;
        }

        Ok(())
    }

    /// Username from the explicit field, falling back to the URL user-info.
    pub fn effective_username(&self) -> Option<String> {
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .or_else(|| {
                Url::parse(&self.url)
                    .ok()
                    .map(|u| u.username().to_string())
                    .filter(|u| !u.is_empty())
            })
    }

    /// Get a display-safe version of the connection URL (credentials masked).
    pub fn masked_url(&self) -> String {
        if let Ok(mut url) = Url::parse(&self.url) {
            if url.password().is_some() && url.set_password(Some("****")).is_ok() {
                return url.to_string();
            }
            return self.url.clone();
        }
        if let Some(at_pos) = self.url.find('@') {
            if let Some(colon_pos) = self.url[..at_pos].rfind(':') {
                return format!("{}****{}", &self.url[..colon_pos + 1], &self.url[at_pos..]);
            }
        }
        self.url.clone()
    }
}

/// Validate a shard key: non-empty, at most [`MAX_KEY_LEN`] characters of `[A-Za-z0-9_-]`.
pub fn validate_key(key: &str) -> ShardResult<()> {
    if key.is_empty() {
        return Err(ShardError::invalid_argument("Shard key cannot be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ShardError::invalid_argument(format!(
            "Shard key is longer than {} characters",
            MAX_KEY_LEN
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ShardError::invalid_argument(format!(
            "Shard key contains invalid characters: {}",
            key
        )));
    }
    Ok(())
}

/// Lifecycle of a registered shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Active,
    Removed,
}

impl ShardState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Shard information returned by listings (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct ShardSummary {
    pub key: String,
    pub driver: Driver,
    /// Connection URL with the password masked.
    pub url: String,
    pub is_default: bool,
    pub state: ShardState,
    /// Bound cache endpoint as `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    pub initial_size: u32,
    pub min_idle: u32,
    pub max_active: u32,
    pub max_wait_ms: u64,
    pub created_at: DateTime<Utc>,
}
