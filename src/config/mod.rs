//! Gateway configuration: CLI flags / env vars > TOML file > built-in
//! defaults, following the teacher daemon's `DaemonConfig::new` layering.
//!
//! Unlike the teacher, a malformed or unrecognized TOML field is a startup
//! error rather than a logged-and-ignored default fallback — a gateway
//! config typo should fail fast, not silently run with defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::compression::Algorithm;
use crate::protocol::Priority;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MAX_CONNECTIONS: usize = 1000;
const DEFAULT_MESSAGE_QUEUE_SIZE: usize = 100;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;
const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 5000;

const DEFAULT_SESSION_DURATION_SECS: u64 = 3600;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 1000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 100;
const DEFAULT_KEY_ROTATION_INTERVAL_SECS: u64 = 86400;
const DEFAULT_MAX_KEY_AGE_SECS: u64 = 604_800;
const DEFAULT_MAX_KEYS: usize = 5;

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 100;
const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
const DEFAULT_ANALYTICS_INTERVAL_MS: u64 = 5000;
const DEFAULT_TIMEOUT_HIGH_MS: u64 = 50;
const DEFAULT_TIMEOUT_MEDIUM_MS: u64 = 100;
const DEFAULT_TIMEOUT_LOW_MS: u64 = 200;
const DEFAULT_BATCH_COMPRESSION_MIN_SIZE: usize = 1024;
const DEFAULT_BATCH_COMPRESSION_LEVEL: u32 = 6;
const DEFAULT_THRESHOLD_HIGH: usize = 512;
const DEFAULT_THRESHOLD_MEDIUM: usize = 1024;
const DEFAULT_THRESHOLD_LOW: usize = 2048;

const DEFAULT_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_CACHE_TTL_MS: u64 = 300_000;
const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 1024;
const DEFAULT_INVALIDATION_INTERVAL_MS: u64 = 60_000;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_WARNING_THRESHOLD_MB: usize = 80;
const DEFAULT_MAX_MEMORY_MB: usize = 100;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_HALF_OPEN_LIMIT: u32 = 1;
const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;

// ─── TOML config file ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlServer {
    port: Option<u16>,
    max_connections: Option<usize>,
    message_queue_size: Option<usize>,
    max_message_size: Option<usize>,
    handler_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlRateLimit {
    window_ms: Option<u64>,
    max_requests: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlAuth {
    enabled: Option<bool>,
    api_keys: Option<Vec<String>>,
    session_duration_secs: Option<u64>,
    rate_limit: Option<TomlRateLimit>,
    key_rotation_interval_secs: Option<u64>,
    max_key_age_secs: Option<u64>,
    max_keys: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlPriorityTimeouts {
    high_ms: Option<u64>,
    medium_ms: Option<u64>,
    low_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlPriorityThresholds {
    high: Option<usize>,
    medium: Option<usize>,
    low: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlBatchCompression {
    enabled: Option<bool>,
    min_size: Option<usize>,
    level: Option<u32>,
    algorithm: Option<Algorithm>,
    priority_thresholds: TomlPriorityThresholds,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlBatching {
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    max_queue_size: Option<usize>,
    analytics_interval_ms: Option<u64>,
    timeouts: TomlPriorityTimeouts,
    compression: TomlBatchCompression,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlPriorityTtls {
    low_ms: Option<u64>,
    medium_ms: Option<u64>,
    high_ms: Option<u64>,
    critical_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlCacheTtl {
    priority_ttls: TomlPriorityTtls,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlMemoryMonitoring {
    enabled: Option<bool>,
    check_interval_ms: Option<u64>,
    warning_threshold_mb: Option<usize>,
    max_memory_mb: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlCache {
    capacity: Option<usize>,
    default_ttl_ms: Option<u64>,
    compression_enabled: Option<bool>,
    compression_threshold_bytes: Option<usize>,
    invalidation_interval_ms: Option<u64>,
    ttl: TomlCacheTtl,
    memory_monitoring: TomlMemoryMonitoring,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlCircuitBreaker {
    failure_threshold: Option<u32>,
    reset_timeout_ms: Option<u64>,
    half_open_limit: Option<u32>,
}

/// `{config path}` — every field optional; anything present but unrecognized
/// is a hard error (see module docs).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TomlConfig {
    log: Option<String>,
    server: TomlServer,
    auth: TomlAuth,
    batching: TomlBatching,
    cache: TomlCache,
    circuit_breaker: TomlCircuitBreaker,
}

fn load_toml(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        return Ok(TomlConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
}

// ─── Resolved config ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub message_queue_size: usize,
    pub max_message_size: usize,
    pub handler_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub api_keys: Vec<String>,
    pub session_duration: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
    pub key_rotation_interval: Duration,
    pub max_key_age: Duration,
    pub max_keys: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PriorityTimeouts {
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
}

impl PriorityTimeouts {
    pub fn get(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High | Priority::Critical => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PriorityThresholds {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityThresholds {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::High | Priority::Critical => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub min_size: usize,
    pub level: u32,
    pub algorithm: Algorithm,
    pub priority_thresholds: PriorityThresholds,
}

#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_queue_size: usize,
    pub analytics_interval: Duration,
    pub timeouts: PriorityTimeouts,
    pub compression: CompressionSettings,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityTtls {
    pub low: Option<Duration>,
    pub medium: Option<Duration>,
    pub high: Option<Duration>,
    pub critical: Option<Duration>,
}

impl PriorityTtls {
    pub fn get(&self, priority: Priority) -> Option<Duration> {
        match priority {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryMonitoring {
    pub enabled: bool,
    pub check_interval: Duration,
    pub warning_threshold_bytes: usize,
    pub max_memory_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub default_ttl: Duration,
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
    pub invalidation_interval: Duration,
    pub priority_ttls: PriorityTtls,
    pub memory_monitoring: MemoryMonitoring,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_limit: u32,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub batching: BatchingConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Build config from CLI/env overrides plus an optional TOML file.
    ///
    /// Priority (highest to lowest): CLI / env flag > TOML file > built-in
    /// default. An unreadable or malformed TOML file is a hard error.
    pub fn load(
        config_path: Option<PathBuf>,
        cli_port: Option<u16>,
        cli_log: Option<String>,
    ) -> Result<Self> {
        let toml = match config_path {
            Some(path) => load_toml(&path)?,
            None => TomlConfig::default(),
        };

        let log = cli_log
            .or(toml.log)
            .unwrap_or_else(|| "info".to_string());

        let server = ServerConfig {
            port: cli_port.or(toml.server.port).unwrap_or(DEFAULT_PORT),
            max_connections: toml.server.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            message_queue_size: toml
                .server
                .message_queue_size
                .unwrap_or(DEFAULT_MESSAGE_QUEUE_SIZE),
            max_message_size: toml
                .server
                .max_message_size
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            handler_timeout: Duration::from_millis(
                toml.server
                    .handler_timeout_ms
                    .unwrap_or(DEFAULT_HANDLER_TIMEOUT_MS),
            ),
        };

        let rate_limit = toml.auth.rate_limit.unwrap_or_default();
        let auth = AuthConfig {
            enabled: toml.auth.enabled.unwrap_or(true),
            api_keys: toml.auth.api_keys.unwrap_or_default(),
            session_duration: Duration::from_secs(
                toml.auth
                    .session_duration_secs
                    .unwrap_or(DEFAULT_SESSION_DURATION_SECS),
            ),
            rate_limit_window: Duration::from_millis(
                rate_limit.window_ms.unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_MS),
            ),
            rate_limit_max: rate_limit
                .max_requests
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
            key_rotation_interval: Duration::from_secs(
                toml.auth
                    .key_rotation_interval_secs
                    .unwrap_or(DEFAULT_KEY_ROTATION_INTERVAL_SECS),
            ),
            max_key_age: Duration::from_secs(
                toml.auth.max_key_age_secs.unwrap_or(DEFAULT_MAX_KEY_AGE_SECS),
            ),
            max_keys: toml.auth.max_keys.unwrap_or(DEFAULT_MAX_KEYS),
        };

        let batching = BatchingConfig {
            batch_size: toml.batching.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_timeout: Duration::from_millis(
                toml.batching
                    .batch_timeout_ms
                    .unwrap_or(DEFAULT_BATCH_TIMEOUT_MS),
            ),
            max_queue_size: toml
                .batching
                .max_queue_size
                .unwrap_or(DEFAULT_MAX_QUEUE_SIZE),
            analytics_interval: Duration::from_millis(
                toml.batching
                    .analytics_interval_ms
                    .unwrap_or(DEFAULT_ANALYTICS_INTERVAL_MS),
            ),
            timeouts: PriorityTimeouts {
                high: Duration::from_millis(toml.batching.timeouts.high_ms.unwrap_or(DEFAULT_TIMEOUT_HIGH_MS)),
                medium: Duration::from_millis(toml.batching.timeouts.medium_ms.unwrap_or(DEFAULT_TIMEOUT_MEDIUM_MS)),
                low: Duration::from_millis(toml.batching.timeouts.low_ms.unwrap_or(DEFAULT_TIMEOUT_LOW_MS)),
            },
            compression: {
                let min_size = toml
                    .batching
                    .compression
                    .min_size
                    .unwrap_or(DEFAULT_BATCH_COMPRESSION_MIN_SIZE);
                CompressionSettings {
                    enabled: toml.batching.compression.enabled.unwrap_or(true),
                    min_size,
                    level: toml.batching.compression.level.unwrap_or(DEFAULT_BATCH_COMPRESSION_LEVEL),
                    algorithm: toml.batching.compression.algorithm.unwrap_or(Algorithm::Gzip),
                    // A priority with no explicit override compresses at the
                    // same size as `minSize`; only the documented defaults
                    // (high lower, low higher) deviate from it out of the box.
                    priority_thresholds: PriorityThresholds {
                        high: toml
                            .batching
                            .compression
                            .priority_thresholds
                            .high
                            .unwrap_or(DEFAULT_THRESHOLD_HIGH.min(min_size)),
                        medium: toml
                            .batching
                            .compression
                            .priority_thresholds
                            .medium
                            .unwrap_or(min_size),
                        low: toml
                            .batching
                            .compression
                            .priority_thresholds
                            .low
                            .unwrap_or(DEFAULT_THRESHOLD_LOW.max(min_size)),
                    },
                }
            },
        };

        let cache = CacheConfig {
            capacity: toml.cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
            default_ttl: Duration::from_millis(
                toml.cache.default_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS),
            ),
            compression_enabled: toml.cache.compression_enabled.unwrap_or(true),
            compression_threshold_bytes: toml
                .cache
                .compression_threshold_bytes
                .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD_BYTES),
            invalidation_interval: Duration::from_millis(
                toml.cache
                    .invalidation_interval_ms
                    .unwrap_or(DEFAULT_INVALIDATION_INTERVAL_MS),
            ),
            priority_ttls: PriorityTtls {
                low: toml.cache.ttl.priority_ttls.low_ms.map(Duration::from_millis),
                medium: toml.cache.ttl.priority_ttls.medium_ms.map(Duration::from_millis),
                high: toml.cache.ttl.priority_ttls.high_ms.map(Duration::from_millis),
                critical: toml.cache.ttl.priority_ttls.critical_ms.map(Duration::from_millis),
            },
            memory_monitoring: MemoryMonitoring {
                enabled: toml.cache.memory_monitoring.enabled.unwrap_or(true),
                check_interval: Duration::from_millis(
                    toml.cache
                        .memory_monitoring
                        .check_interval_ms
                        .unwrap_or(DEFAULT_CHECK_INTERVAL_MS),
                ),
                warning_threshold_bytes: toml
                    .cache
                    .memory_monitoring
                    .warning_threshold_mb
                    .unwrap_or(DEFAULT_WARNING_THRESHOLD_MB)
                    * 1024
                    * 1024,
                max_memory_bytes: toml
                    .cache
                    .memory_monitoring
                    .max_memory_mb
                    .unwrap_or(DEFAULT_MAX_MEMORY_MB)
                    * 1024
                    * 1024,
            },
        };

        let circuit_breaker = CircuitBreakerSettings {
            failure_threshold: toml
                .circuit_breaker
                .failure_threshold
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            reset_timeout: Duration::from_millis(
                toml.circuit_breaker
                    .reset_timeout_ms
                    .unwrap_or(DEFAULT_RESET_TIMEOUT_MS),
            ),
            half_open_limit: toml
                .circuit_breaker
                .half_open_limit
                .unwrap_or(DEFAULT_HALF_OPEN_LIMIT),
        };

        Ok(Self {
            server,
            auth,
            batching,
            cache,
            circuit_breaker,
            logging: LoggingConfig { level: log },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_file_and_no_overrides() {
        let cfg = GatewayConfig::load(None, None, None).unwrap();
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.auth.max_keys, DEFAULT_MAX_KEYS);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn cli_overrides_beat_defaults() {
        let cfg = GatewayConfig::load(None, Some(9000), Some("debug".into())).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn toml_file_overrides_defaults_but_not_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            "log = \"warn\"\n[server]\nport = 5555\n[auth]\nmax_keys = 2\n",
        )
        .unwrap();
        let cfg = GatewayConfig::load(Some(path), Some(9999), None).unwrap();
        assert_eq!(cfg.server.port, 9999, "CLI still wins over TOML");
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.auth.max_keys, 2);
    }

    #[test]
    fn unknown_field_in_toml_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "bogus_field = true\n").unwrap();
        assert!(GatewayConfig::load(Some(path), None, None).is_err());
    }
}
