//! ---
//! hydra_section: "01-core-functionality"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Shared primitives and utilities for the Hydra runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Key prefix shared by every Hydra implementation on the same store.
pub const DEFAULT_KEY_PREFIX: &str = "hydra:service";

fn default_redis_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_every_ticks() -> u32 {
    5
}

fn default_key_ttl() -> Duration {
    Duration::from_secs(3)
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_ladder() -> Vec<Duration> {
    vec![
        Duration::from_millis(10),
        Duration::from_millis(1000),
        Duration::from_millis(3000),
        Duration::from_millis(5000),
    ]
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for a Hydra instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydraConfig {
    /// Name peers address this service by. Must not contain `:` or `@`.
    #[serde(alias = "ServiceName")]
    pub service_name: String,
    /// Literal address, wildcard pattern (`10.0.*.*`) or empty for auto-detection.
    #[serde(default, rename = "serviceIP", alias = "serviceIp", alias = "ServiceIP")]
    pub service_ip: Option<String>,
    /// Advertised port.
    #[serde(default, alias = "ServicePort")]
    pub service_port: Option<u16>,
    /// Free-form service type.
    #[serde(default, alias = "ServiceType")]
    pub service_type: Option<String>,
    /// Free-form service description.
    #[serde(default, alias = "ServiceDescription")]
    pub service_description: Option<String>,
    /// Service version.
    #[serde(default, alias = "ServiceVersion")]
    pub service_version: Option<String>,
    /// Store connection settings.
    #[serde(default, alias = "Redis")]
    pub redis: RedisConfig,
    /// Presence timing.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Queue polling.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`HydraConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHydraConfig {
    /// The loaded configuration.
    pub config: HydraConfig,
    /// File it was read from.
    pub source: PathBuf,
}

impl HydraConfig {
    /// Environment variable naming a configuration file to load first.
    pub const ENV_CONFIG_PATH: &'static str = "HYDRA_CONFIG";

    /// Build a configuration with defaults for everything but the service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_ip: None,
            service_port: None,
            service_type: None,
            service_description: None,
            service_version: None,
            redis: RedisConfig::default(),
            presence: PresenceConfig::default(),
            queue: QueueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a single file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_path(path.as_ref().to_path_buf())
    }

    /// Load configuration, respecting the `HYDRA_CONFIG` override before the candidates.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHydraConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedHydraConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedHydraConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let config = if is_toml {
            toml::from_str::<HydraConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::from_json(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON, unwrapping the conventional `{"hydra": {...}}` wrapper when present.
    pub fn from_json(content: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(content)?;
        let inner = match &value {
            JsonValue::Object(map) => map
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("hydra"))
                .map(|(_, inner)| inner.clone())
                .unwrap_or(value),
            _ => value,
        };
        Ok(serde_json::from_value(inner)?)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        let name = self.service_name.trim();
        if name.is_empty() {
            return Err(anyhow!("serviceName must not be empty"));
        }
        if name.contains(':') || name.contains('@') {
            return Err(anyhow!(
                "serviceName '{}' must not contain ':' or '@'",
                self.service_name
            ));
        }
        self.redis.validate()?;
        self.presence.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for HydraConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config = Self::from_json(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection settings for a Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Server host name.
    #[serde(default = "default_redis_host", alias = "Host")]
    pub host: String,
    /// Server port.
    #[serde(default = "default_redis_port", alias = "Port")]
    pub port: u16,
    /// Database index.
    #[serde(default, alias = "Db")]
    pub db: i64,
    /// Extra connection options appended to the URL query.
    #[serde(default, alias = "Options")]
    pub options: Option<String>,
    /// Prefix of every key and channel name.
    #[serde(default = "default_key_prefix")]
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            options: None,
            prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Reject an empty host or prefix.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("redis host cannot be empty"));
        }
        if self.prefix.trim().is_empty() {
            return Err(anyhow!("redis key prefix cannot be empty"));
        }
        Ok(())
    }

    /// `host:port`, the form peers log and compare against.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection string assembled from host, port and store-specific options.
    pub fn connection_string(&self) -> String {
        match self.options.as_deref().map(str::trim) {
            Some(options) if !options.is_empty() => format!("{},{}", self.host_port(), options),
            _ => self.host_port(),
        }
    }

    /// URL form understood by the Redis client.
    pub fn url(&self) -> String {
        format!("redis://{}/{}", self.host_port(), self.db)
    }
}

/// Presence and health publication timings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceConfig {
    /// Time between presence writes.
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: Duration,
    /// Health is written every this many ticks.
    #[serde(default = "default_health_every_ticks")]
    pub health_every_ticks: u32,
    /// Time to live of the liveness, health and registration keys.
    #[serde(default = "default_key_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub key_ttl: Duration,
    /// Upper bound spent draining inbound handlers during shutdown.
    #[serde(default = "default_flush_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub flush_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            health_every_ticks: default_health_every_ticks(),
            key_ttl: default_key_ttl(),
            flush_timeout: default_flush_timeout(),
        }
    }
}

impl PresenceConfig {
    /// Reject a zero tick, a zero health interval, and a TTL shorter than the tick.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(anyhow!("presence tick interval must be non-zero"));
        }
        if self.health_every_ticks == 0 {
            return Err(anyhow!("health interval must be at least one tick"));
        }
        if self.key_ttl < self.tick_interval {
            return Err(anyhow!(
                "presence key ttl ({:?}) shorter than tick interval ({:?})",
                self.key_ttl,
                self.tick_interval
            ));
        }
        Ok(())
    }
}

/// Queue processor polling settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Delay ladder walked on consecutive empty dequeues; the first entry is the base delay.
    #[serde(default = "default_backoff_ladder")]
    #[serde_as(as = "Vec<DurationMilliSeconds<u64>>")]
    pub backoff_ms: Vec<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ladder(),
        }
    }
}

impl QueueConfig {
    /// Reject an empty ladder, a zero base delay, and a decreasing ladder.
    pub fn validate(&self) -> Result<()> {
        let Some(base) = self.backoff_ms.first() else {
            return Err(anyhow!("queue backoff ladder must not be empty"));
        };
        if base.is_zero() {
            return Err(anyhow!("queue base delay must be non-zero"));
        }
        if self.backoff_ms.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(anyhow!("queue backoff ladder must be non-decreasing"));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Console output format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// File name prefix of the rolling log, when `directory` is set.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_conventional_wrapper() {
        let config = HydraConfig::from_str(
            r#"{
                "hydra": {
                    "serviceName": "queuer-svcs",
                    "serviceIP": "10.0.*.*",
                    "servicePort": 5000,
                    "serviceType": "queuer",
                    "serviceDescription": "Queue consumer",
                    "redis": { "host": "redis", "port": 6380, "db": 2, "options": "abortConnect=false" }
                }
            }"#,
        )
        .expect("config parses");

        assert_eq!(config.service_name, "queuer-svcs");
        assert_eq!(config.service_ip.as_deref(), Some("10.0.*.*"));
        assert_eq!(config.service_port, Some(5000));
        assert_eq!(config.redis.db, 2);
        assert_eq!(config.redis.prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(
            config.redis.connection_string(),
            "redis:6380,abortConnect=false"
        );
        assert_eq!(config.redis.url(), "redis://redis:6380/2");
    }

    #[test]
    fn defaults_follow_presence_protocol() {
        let config = HydraConfig::new("svc");
        assert_eq!(config.presence.tick_interval, Duration::from_secs(1));
        assert_eq!(config.presence.health_every_ticks, 5);
        assert_eq!(config.presence.key_ttl, Duration::from_secs(3));
        assert_eq!(config.queue.backoff_ms.len(), 4);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_invalid_service_names() {
        assert!(HydraConfig::new("").validate().is_err());
        assert!(HydraConfig::new("bad:name").validate().is_err());
    }

    #[test]
    fn rejects_decreasing_backoff() {
        let mut config = HydraConfig::new("svc");
        config.queue.backoff_ms = vec![Duration::from_millis(100), Duration::from_millis(10)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn connection_string_without_options() {
        let redis = RedisConfig {
            options: Some("  ".into()),
            ..RedisConfig::default()
        };
        assert_eq!(redis.connection_string(), "127.0.0.1:6379");
    }
}
