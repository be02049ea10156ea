use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::CacheConfig;
use crate::limiter::RateLimitConfig;
use crate::pool::PoolConfig;

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections opened at startup and kept warm
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Hard cap on live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds a caller waits for a connection before giving up
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,

    /// Seconds an idle connection is kept before retirement
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds a connection lives at most
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: u64,

    /// Consecutive connect failures tolerated per acquire
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Seconds between connect attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    /// Seconds between background health sweeps (0 disables)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Check idle connections are alive before reuse
    #[serde(default = "default_true")]
    pub test_on_acquire: bool,
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    10
}

fn default_connection_timeout() -> f64 {
    30.0
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_max_lifetime() -> u64 {
    3600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connection_timeout: default_connection_timeout(),
            idle_timeout: default_idle_timeout(),
            max_lifetime: default_max_lifetime(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            health_check_interval: default_health_check_interval(),
            test_on_acquire: default_true(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_connections,
            max_size: self.max_connections,
            acquire_timeout: saturating_secs_f64(self.connection_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            max_lifetime: Duration::from_secs(self.max_lifetime),
            retry_attempts: self.retry_attempts,
            retry_delay: saturating_secs_f64(self.retry_delay),
            health_check_interval: non_zero_secs(self.health_check_interval),
            test_on_acquire: self.test_on_acquire,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of cached results
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Maximum accounted bytes across all cached results
    #[serde(default = "default_cache_max_size_bytes")]
    pub max_size_bytes: Option<usize>,

    /// Seconds a cached result stays valid
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    /// Seconds between expiry sweeps (0 disables)
    #[serde(default = "default_cache_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Results larger than this share of `max_size_bytes` are not cached
    #[serde(default = "default_max_entry_fraction")]
    pub max_entry_fraction: f64,
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_cache_max_size_bytes() -> Option<usize> {
    Some(64 * 1024 * 1024)
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_cleanup_interval() -> u64 {
    60
}

fn default_max_entry_fraction() -> f64 {
    0.5
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_size: default_cache_max_size(),
            max_size_bytes: default_cache_max_size_bytes(),
            ttl_seconds: default_cache_ttl(),
            cleanup_interval: default_cache_cleanup_interval(),
            max_entry_fraction: default_max_entry_fraction(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_size,
            max_size_bytes: self.max_size_bytes,
            ttl: Duration::from_secs(self.ttl_seconds),
            max_entry_fraction: self.max_entry_fraction,
            sweep_interval: non_zero_secs(self.cleanup_interval),
        }
    }
}

/// Rate limiting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Seconds of inactivity before a caller's bucket is forgotten (0 keeps all)
    #[serde(default = "default_prune_after")]
    pub prune_after: u64,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst_limit() -> u32 {
    10
}

fn default_prune_after() -> u64 {
    600
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            requests_per_minute: default_requests_per_minute(),
            burst_limit: default_burst_limit(),
            prune_after: default_prune_after(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            rate_per_minute: self.requests_per_minute,
            burst: self.burst_limit,
            prune_after: non_zero_secs(self.prune_after),
        }
    }
}

/// Seconds as a `Duration`, clamped instead of panicking on values no
/// `Duration` can hold. `validate` rejects those values up front.
fn saturating_secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

fn representable_secs(secs: f64) -> bool {
    Duration::try_from_secs_f64(secs).is_ok()
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every setting and report all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.pool.max_connections == 0 {
            errors.push("max_connections must be positive".to_string());
        }
        if self.pool.min_connections > self.pool.max_connections {
            errors.push("min_connections cannot exceed max_connections".to_string());
        }
        if !(representable_secs(self.pool.connection_timeout) && self.pool.connection_timeout > 0.0) {
            errors.push("connection_timeout must be a positive number of seconds".to_string());
        }
        if !representable_secs(self.pool.retry_delay) {
            errors.push("retry_delay must be a non-negative number of seconds".to_string());
        }

        if self.cache.max_size == 0 {
            errors.push("cache max_size must be positive".to_string());
        }
        if self.cache.max_size_bytes == Some(0) {
            errors.push("cache max_size_bytes must be positive".to_string());
        }
        if self.cache.ttl_seconds == 0 {
            errors.push("cache ttl_seconds must be positive".to_string());
        }
        if !(self.cache.max_entry_fraction > 0.0 && self.cache.max_entry_fraction <= 1.0) {
            errors.push("cache max_entry_fraction must be in (0, 1]".to_string());
        }

        if self.rate_limit.requests_per_minute == 0 {
            errors.push("requests_per_minute must be positive".to_string());
        }
        if self.rate_limit.burst_limit == 0 {
            errors.push("burst_limit must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration validation failed: {}", errors.join("; "));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Look up `NAME`, preferring `<PROFILE>_NAME` when a profile is given
fn env_var(profile: Option<&str>, name: &str) -> Option<String> {
    if let Some(profile) = profile {
        let prefixed = format!("{}_{}", profile.to_uppercase(), name);
        if let Ok(value) = std::env::var(&prefixed) {
            return Some(value);
        }
    }
    std::env::var(name).ok()
}

fn env_parse<T: FromStr>(profile: Option<&str>, name: &str, target: &mut T) {
    if let Some(raw) = env_var(profile, name) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable environment value"),
        }
    }
}

fn env_bool(profile: Option<&str>, name: &str, target: &mut bool) {
    if let Some(raw) = env_var(profile, name) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => *target = true,
            "false" | "0" | "no" | "off" => *target = false,
            _ => warn!(variable = name, value = %raw, "Ignoring unparsable environment flag"),
        }
    }
}

/// Load configuration from environment variables
///
/// Every setting falls back to its default when unset:
/// - POOL_MIN_CONNECTIONS / POOL_MAX_CONNECTIONS
/// - POOL_CONNECTION_TIMEOUT / POOL_IDLE_TIMEOUT / POOL_MAX_LIFETIME (seconds)
/// - POOL_RETRY_ATTEMPTS / POOL_RETRY_DELAY / POOL_HEALTH_CHECK_INTERVAL
/// - CACHE_ENABLED / CACHE_MAX_SIZE / CACHE_MAX_BYTES / CACHE_TTL / CACHE_CLEANUP_INTERVAL
/// - RATE_LIMIT_ENABLED / RATE_LIMIT_RPM / RATE_LIMIT_BURST
///
/// With a profile, `<PROFILE>_NAME` takes precedence over `NAME`.
pub fn load_from_env(profile: Option<&str>) -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let pool = &mut config.pool;
    env_parse(profile, "POOL_MIN_CONNECTIONS", &mut pool.min_connections);
    env_parse(profile, "POOL_MAX_CONNECTIONS", &mut pool.max_connections);
    env_parse(profile, "POOL_CONNECTION_TIMEOUT", &mut pool.connection_timeout);
    env_parse(profile, "POOL_IDLE_TIMEOUT", &mut pool.idle_timeout);
    env_parse(profile, "POOL_MAX_LIFETIME", &mut pool.max_lifetime);
    env_parse(profile, "POOL_RETRY_ATTEMPTS", &mut pool.retry_attempts);
    env_parse(profile, "POOL_RETRY_DELAY", &mut pool.retry_delay);
    env_parse(profile, "POOL_HEALTH_CHECK_INTERVAL", &mut pool.health_check_interval);

    let cache = &mut config.cache;
    env_bool(profile, "CACHE_ENABLED", &mut cache.enabled);
    env_parse(profile, "CACHE_MAX_SIZE", &mut cache.max_size);
    if let Some(raw) = env_var(profile, "CACHE_MAX_BYTES") {
        match raw.trim() {
            "" | "0" | "none" => cache.max_size_bytes = None,
            value => match value.parse() {
                Ok(bytes) => cache.max_size_bytes = Some(bytes),
                Err(_) => warn!(variable = "CACHE_MAX_BYTES", value = %raw, "Ignoring unparsable environment value"),
            },
        }
    }
    env_parse(profile, "CACHE_TTL", &mut cache.ttl_seconds);
    env_parse(profile, "CACHE_CLEANUP_INTERVAL", &mut cache.cleanup_interval);

    let rate_limit = &mut config.rate_limit;
    env_bool(profile, "RATE_LIMIT_ENABLED", &mut rate_limit.enabled);
    env_parse(profile, "RATE_LIMIT_RPM", &mut rate_limit.requests_per_minute);
    env_parse(profile, "RATE_LIMIT_BURST", &mut rate_limit.burst_limit);

    Ok(config)
}

/// Load configuration from file or environment, then validate it
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `profile_name` - Optional profile prefix for environment variables
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => {
            info!(path, "Loading configuration from file");
            load_from_yaml(path)?
        }
        None => {
            info!(profile = profile_name.unwrap_or("default"), "Loading configuration from environment");
            load_from_env(profile_name)?
        }
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml_str() {
        let yaml = r#"
pool:
  min_connections: 2
  max_connections: 8
  connection_timeout: 0.5
  idle_timeout: 120

cache:
  max_size: 50
  max_size_bytes: null
  ttl_seconds: 30

rate_limit:
  enabled: false
  requests_per_minute: 120
  burst_limit: 20
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.idle_timeout, 120);
        assert_eq!(config.pool.max_lifetime, 3600);
        assert_eq!(config.cache.max_size, 50);
        assert_eq!(config.cache.max_size_bytes, None);
        assert!(config.cache.enabled);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.burst_limit, 20);

        let pool = config.pool.to_pool_config();
        assert_eq!(pool.acquire_timeout, Duration::from_millis(500));
        assert_eq!(pool.health_check_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_default_values() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());

        let cache = config.cache.to_cache_config();
        assert_eq!(cache.ttl, Duration::from_secs(300));
        assert_eq!(cache.sweep_interval, Some(Duration::from_secs(60)));

        let limiter = config.rate_limit.to_rate_limit_config();
        assert_eq!(limiter.rate_per_minute, 60);
        assert_eq!(limiter.burst, 10);
    }

    #[test]
    fn test_zero_interval_disables_background_work() {
        let mut config = Config::default();
        config.pool.health_check_interval = 0;
        config.cache.cleanup_interval = 0;
        config.rate_limit.prune_after = 0;

        assert_eq!(config.pool.to_pool_config().health_check_interval, None);
        assert_eq!(config.cache.to_cache_config().sweep_interval, None);
        assert_eq!(config.rate_limit.to_rate_limit_config().prune_after, None);
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = Config::default();
        config.pool.connection_timeout = 1e30;
        config.pool.retry_delay = f64::NAN;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("connection_timeout"));
        assert!(err.contains("retry_delay"));

        // Conversion clamps rather than panicking
        let pool = config.pool.to_pool_config();
        assert_eq!(pool.acquire_timeout, Duration::MAX);
        assert_eq!(pool.retry_delay, Duration::ZERO);
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let mut config = Config::default();
        config.pool.min_connections = 20;
        config.rate_limit.burst_limit = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("min_connections cannot exceed max_connections"));
        assert!(err.contains("burst_limit must be at least 1"));
    }
}
