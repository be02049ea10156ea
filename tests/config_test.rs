use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
pool:
  min_connections: 2
  max_connections: 20
  connection_timeout: 2.5
  idle_timeout: 60
  max_lifetime: 900
  retry_attempts: 5
  retry_delay: 0.25
  health_check_interval: 15
  test_on_acquire: false

cache:
  enabled: true
  max_size: 500
  max_size_bytes: 1048576
  ttl_seconds: 120
  cleanup_interval: 30

rate_limit:
  enabled: true
  requests_per_minute: 600
  burst_limit: 50
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = querygate::config::load_from_yaml(&config_path).unwrap();
    assert!(config.validate().is_ok());

    let pool = config.pool.to_pool_config();
    assert_eq!(pool.min_size, 2);
    assert_eq!(pool.max_size, 20);
    assert_eq!(pool.acquire_timeout, Duration::from_millis(2500));
    assert_eq!(pool.idle_timeout, Duration::from_secs(60));
    assert_eq!(pool.max_lifetime, Duration::from_secs(900));
    assert_eq!(pool.retry_attempts, 5);
    assert_eq!(pool.retry_delay, Duration::from_millis(250));
    assert_eq!(pool.health_check_interval, Some(Duration::from_secs(15)));
    assert!(!pool.test_on_acquire);

    let cache = config.cache.to_cache_config();
    assert_eq!(cache.max_entries, 500);
    assert_eq!(cache.max_size_bytes, Some(1_048_576));
    assert_eq!(cache.ttl, Duration::from_secs(120));
    assert_eq!(cache.sweep_interval, Some(Duration::from_secs(30)));

    let limits = config.rate_limit.to_rate_limit_config();
    assert_eq!(limits.rate_per_minute, 600);
    assert_eq!(limits.burst, 50);
}

/// Test that a missing file is reported with its path
#[test]
fn test_missing_yaml_file() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.yaml");

    let err = querygate::config::load_from_yaml(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("nope.yaml"));
}

/// Test that load_config validates what it loads
#[test]
fn test_load_config_rejects_invalid_file() {
    let yaml = r#"
pool:
  min_connections: 8
  max_connections: 4
cache:
  ttl_seconds: 0
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("bad.yaml");
    fs::write(&config_path, yaml).unwrap();

    let err = querygate::config::load_config(config_path.to_str(), None).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("min_connections cannot exceed max_connections"));
    assert!(message.contains("cache ttl_seconds must be positive"));
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config_with_profile() {
    // Profile-prefixed names keep this test independent of the process env
    env::set_var("QGTESTENV_POOL_MAX_CONNECTIONS", "7");
    env::set_var("QGTESTENV_POOL_CONNECTION_TIMEOUT", "0.5");
    env::set_var("QGTESTENV_CACHE_ENABLED", "off");
    env::set_var("QGTESTENV_CACHE_MAX_BYTES", "none");
    env::set_var("QGTESTENV_RATE_LIMIT_RPM", "240");
    env::set_var("QGTESTENV_RATE_LIMIT_BURST", "not-a-number");

    let config = querygate::config::load_from_env(Some("qgtestenv")).unwrap();

    assert_eq!(config.pool.max_connections, 7);
    assert_eq!(config.pool.connection_timeout, 0.5);
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.max_size_bytes, None);
    assert_eq!(config.rate_limit.requests_per_minute, 240);
    // Unparsable values fall back to the default
    assert_eq!(config.rate_limit.burst_limit, 10);

    for name in [
        "QGTESTENV_POOL_MAX_CONNECTIONS",
        "QGTESTENV_POOL_CONNECTION_TIMEOUT",
        "QGTESTENV_CACHE_ENABLED",
        "QGTESTENV_CACHE_MAX_BYTES",
        "QGTESTENV_RATE_LIMIT_RPM",
        "QGTESTENV_RATE_LIMIT_BURST",
    ] {
        env::remove_var(name);
    }
}

/// Test that the effective configuration renders back to loadable YAML
#[test]
fn test_config_yaml_round_trip() {
    let mut config = querygate::Config::default();
    config.pool.max_connections = 3;
    config.cache.max_size_bytes = None;

    let yaml = serde_yaml::to_string(&config).unwrap();
    let parsed: querygate::Config = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed, config);
}
