//! Configuration handling for the shard router.
//!
//! This module provides configuration management via CLI arguments and environment variables,
//! and the parser for `key=url?options` shard arguments.

use crate::models::{CacheEndpoint, Driver, ShardDescriptor};
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_SHARD_KEY: &str = "default";
pub const DEFAULT_SHARD_URL: &str = "sqlite::memory:";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CACHE_CONNECT_TIMEOUT_SECS: u64 = 2;

// Pool sizing defaults
pub const DEFAULT_INITIAL_SIZE: u32 = 5;
pub const DEFAULT_MIN_IDLE: u32 = 5;
pub const DEFAULT_MAX_ACTIVE: u32 = 20;
pub const DEFAULT_MAX_WAIT_MS: u64 = 60_000;

/// Connection pool sizing for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolSizing {
    /// Connections opened eagerly when the shard is added (default: 5)
    pub initial_size: Option<u32>,
    /// Idle connections the pool keeps open (default: 5)
    pub min_idle: Option<u32>,
    /// Upper bound on open connections (default: 20)
    pub max_active: Option<u32>,
    /// Longest wait for a pooled connection, in milliseconds (default: 60000)
    pub max_wait_ms: Option<u64>,
}

impl PoolSizing {
    /// Unset, the default is capped at the effective `max_active`.
    pub fn initial_size_or_default(&self) -> u32 {
        self.initial_size
            .unwrap_or_else(|| DEFAULT_INITIAL_SIZE.min(self.max_active_or_default()))
    }

    /// Unset, the default is capped at the effective `max_active`.
    pub fn min_idle_or_default(&self) -> u32 {
        self.min_idle
            .unwrap_or_else(|| DEFAULT_MIN_IDLE.min(self.max_active_or_default()))
    }

    pub fn max_active_or_default(&self) -> u32 {
        self.max_active.unwrap_or(DEFAULT_MAX_ACTIVE)
    }

    pub fn max_wait_or_default(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms.unwrap_or(DEFAULT_MAX_WAIT_MS))
    }

    /// Validate sizing against the effective values and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        let max = self.max_active_or_default();
        if max == 0 {
            return Err("max_active must be greater than 0".to_string());
        }
        if self.min_idle_or_default() > max {
            return Err(format!(
                "min_idle ({}) cannot exceed max_active ({})",
                self.min_idle_or_default(),
                max
            ));
        }
        if self.initial_size_or_default() > max {
            return Err(format!(
                "initial_size ({}) cannot exceed max_active ({})",
                self.initial_size_or_default(),
                max
            ));
        }
        if self.max_wait_ms == Some(0) {
            return Err("max_wait must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Option keys extracted from shard URL query parameters; everything else reaches the driver.
const SHARD_OPTION_KEYS: &[&str] = &[
    "username",
    "password",
    "driver",
    "initial_size",
    "min_idle",
    "max_active",
    "max_wait",
    "cache",
];

/// Parse a shard from a CLI argument.
///
/// # Format
///
/// - `url` - key derived from the database name in the URL path
/// - `key=url` - named shard
/// - `key=url?username=app&password=pw&max_active=50&cache=localhost:6379`
///
/// ```text
/// east=postgres://db-east:5432/app?username=app&password=secret
/// west=mysql://app:pw@db-west:3306/app?max_active=40&cache=redis-west:6379
/// archive=sqlite:archive.db
/// ```
pub fn parse_shard(s: &str) -> Result<ShardDescriptor, String> {
    parse_shard_with_key(s, None)
}

/// Parse a shard argument, forcing its key when `key` is given.
pub fn parse_shard_with_key(s: &str, key: Option<&str>) -> Result<ShardDescriptor, String> {
    // Keys never contain ':' or '?', so an '=' after either belongs to the URL.
    let (explicit_key, url_str) = match s.find('=') {
        Some(idx) if !s[..idx].contains(':') && !s[..idx].contains('?') => {
            (Some(s[..idx].trim()), &s[idx + 1..])
        }
        _ => (None, s),
    };

    let mut url = Url::parse(url_str).map_err(|e| format!("Invalid URL: {e}"))?;
    let mut opts = extract_options(&mut url, SHARD_OPTION_KEYS);

    let driver = match opts.remove("driver") {
        Some(name) => name.parse::<Driver>().map_err(|e| e.to_string())?,
        None => Driver::from_url(url.as_str())
            .ok_or_else(|| format!("Cannot infer driver from URL scheme '{}'", url.scheme()))?,
    };

    let cache = opts
        .remove("cache")
        .map(|v| v.parse::<CacheEndpoint>())
        .transpose()
        .map_err(|e| e.to_string())?;

    let pool = PoolSizing {
        initial_size: sizing_option(&mut opts, "initial_size")?,
        min_idle: sizing_option(&mut opts, "min_idle")?,
        max_active: sizing_option(&mut opts, "max_active")?,
        max_wait_ms: sizing_option(&mut opts, "max_wait")?,
    };
    pool.validate()?;

    // Key priority: forced > explicit > database name
    let key = key
        .map(String::from)
        .or_else(|| explicit_key.map(String::from))
        .or_else(|| db_name(&url))
        .ok_or_else(|| "Shard key is required: use key=url".to_string())?;

    Ok(ShardDescriptor {
        key,
        url: url.to_string(),
        username: opts.remove("username"),
        password: opts.remove("password"),
        driver,
        pool,
        cache,
    })
}

/// Take a numeric sizing option out of `opts`; a value that does not parse is an error.
fn sizing_option<T>(opts: &mut HashMap<String, String>, name: &str) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    opts.remove(name)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| format!("Invalid value '{}' for {}: {}", v, name, e))
        })
        .transpose()
}

/// Parse a `key=host:port` cache binding argument.
pub fn parse_cache_binding(s: &str) -> Result<(String, CacheEndpoint), String> {
    let (key, endpoint) = s
        .split_once('=')
        .ok_or_else(|| format!("Cache binding '{}' must be key=host:port", s))?;
    let endpoint = endpoint
        .parse::<CacheEndpoint>()
        .map_err(|e| e.to_string())?;
    Ok((key.trim().to_string(), endpoint))
}

/// Extract router-specific options from URL query params, keeping others for the driver.
/// Uses proper URL encoding to preserve special characters in remaining params.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

fn db_name(url: &Url) -> Option<String> {
    url.path()
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches(".sqlite").trim_end_matches(".db"))
        .filter(|s| !s.is_empty() && !s.starts_with(':'))
        .map(String::from)
}

/// Configuration for the shard router.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "shard-router",
    about = "Runtime shard registry with per-request routing to database pools and caches",
    version,
    author
)]
pub struct Config {
    /// Connection URL of the default shard. Accepts the same options as --shard.
    #[arg(
        long = "default-shard",
        value_name = "URL",
        default_value = DEFAULT_SHARD_URL,
        env = "SHARD_DEFAULT_URL"
    )]
    pub default_shard: String,

    /// Key of the default shard; it can never be removed.
    #[arg(long, default_value = DEFAULT_SHARD_KEY, env = "SHARD_DEFAULT_KEY")]
    pub default_key: String,

    /// Additional shards registered at startup.
    /// Format: "key=url" with optional ?username=&password=&max_active=&cache=host:port
    /// Can be specified multiple times.
    #[arg(
        short = 's',
        long = "shard",
        value_name = "KEY=URL",
        env = "SHARD_URLS",
        value_delimiter = ','
    )]
    pub shards: Vec<String>,

    /// Cache bindings registered at startup. Format: "key=host:port"
    #[arg(
        long = "cache",
        value_name = "KEY=HOST:PORT",
        env = "SHARD_CACHES",
        value_delimiter = ','
    )]
    pub caches: Vec<String>,

    /// HTTP host to bind to
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "SHARD_HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "SHARD_HTTP_PORT")]
    pub http_port: u16,

    /// Time-to-live of cached records in seconds
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL_SECS, env = "SHARD_CACHE_TTL")]
    pub cache_ttl: u64,

    /// Timeout for the first connection to a cache server in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CACHE_CONNECT_TIMEOUT_SECS,
        env = "SHARD_CACHE_CONNECT_TIMEOUT"
    )]
    pub cache_connect_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SHARD_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SHARD_JSON_LOGS")]
    pub json_logs: bool,

    /// Bearer tokens guarding the shard administration endpoints.
    /// Can be specified multiple times or as comma-separated values.
    #[arg(
        long = "auth-token",
        value_name = "TOKEN",
        env = "SHARD_AUTH_TOKENS",
        value_delimiter = ','
    )]
    pub auth_tokens: Vec<String>,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            default_shard: DEFAULT_SHARD_URL.to_string(),
            default_key: DEFAULT_SHARD_KEY.to_string(),
            shards: Vec::new(),
            caches: Vec::new(),
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            cache_ttl: DEFAULT_CACHE_TTL_SECS,
            cache_connect_timeout: DEFAULT_CACHE_CONNECT_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
            auth_tokens: Vec::new(),
        }
    }

    /// Parse the default shard descriptor.
    pub fn default_descriptor(&self) -> Result<ShardDescriptor, String> {
        parse_shard_with_key(&self.default_shard, Some(&self.default_key))
    }

    /// Parse all additional shard descriptors.
    pub fn parse_shards(&self) -> Result<Vec<ShardDescriptor>, String> {
        self.shards.iter().map(|s| parse_shard(s)).collect()
    }

    /// Parse all cache bindings.
    pub fn parse_cache_bindings(&self) -> Result<Vec<(String, CacheEndpoint)>, String> {
        self.caches.iter().map(|s| parse_cache_binding(s)).collect()
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn cache_connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.cache_connect_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
