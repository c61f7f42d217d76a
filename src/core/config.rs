//! Service configuration for atomd.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - CLI argument overrides
//! - Validation and defaults
//! - A file watcher that re-reads the stats config on change

use crate::core::{AtomdError, Result};
use crate::engine::stats_config::{StatsConfig, MAX_BUCKET_SIZE};
use crate::schema::{AtomSchema, SchemaRegistry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for atomd
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Engine limits and defaults
    pub engine: EngineConfig,
    /// Pulled-atom defaults
    pub puller: PullerConfig,
    /// Package table limits
    pub uid_map: UidMapConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Atom schemas declared in addition to the built-in ones
    pub schemas: Vec<AtomSchema>,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port for config upload, atom ingress and reports
    pub http_port: u16,
    /// Bind address
    pub bind_address: IpAddr,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrently installed stats configs
    pub max_configs: usize,
    /// Distinct dimension keys a metric may track per bucket
    pub max_dimensions_per_metric: usize,
    /// Bucket size for metrics that do not declare one
    #[serde(with = "humantime_serde")]
    pub default_bucket_size: Duration,
}

/// Puller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullerConfig {
    /// Cool-down for pullers registered without one
    #[serde(with = "humantime_serde")]
    pub default_cool_down: Duration,
    /// Timeout for pullers registered without one
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// How often the pull alarm checks for due receivers
    #[serde(with = "humantime_serde")]
    pub alarm_interval: Duration,
}

/// UidMap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UidMapConfig {
    /// Removed packages kept for reporting
    pub max_deleted_apps: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured (JSON) logging format
    pub structured: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            puller: PullerConfig::default(),
            uid_map: UidMapConfig::default(),
            logging: LoggingConfig::default(),
            schemas: Vec::new(),
            debug: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_port: 8125,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_configs: 32,
            max_dimensions_per_metric: 800,
            default_bucket_size: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl Default for PullerConfig {
    fn default() -> Self {
        PullerConfig {
            default_cool_down: crate::puller::DEFAULT_COOL_DOWN,
            default_timeout: crate::puller::DEFAULT_TIMEOUT,
            alarm_interval: Duration::from_secs(1),
        }
    }
}

impl Default for UidMapConfig {
    fn default() -> Self {
        UidMapConfig {
            max_deleted_apps: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            return Err(AtomdError::config("http_port must be greater than 0"));
        }

        if self.engine.max_configs == 0 {
            return Err(AtomdError::config("max_configs must be greater than 0"));
        }

        if self.engine.max_dimensions_per_metric == 0 {
            return Err(AtomdError::config(
                "max_dimensions_per_metric must be greater than 0",
            ));
        }

        if self.engine.default_bucket_size.is_zero() {
            return Err(AtomdError::config("default_bucket_size must be non-zero"));
        }
        if self.engine.default_bucket_size > MAX_BUCKET_SIZE {
            return Err(AtomdError::config(format!(
                "default_bucket_size must not exceed {:?}",
                MAX_BUCKET_SIZE
            )));
        }

        if self.puller.default_timeout.is_zero() {
            return Err(AtomdError::config("puller default_timeout must be non-zero"));
        }

        if self.puller.alarm_interval.is_zero() {
            return Err(AtomdError::config("puller alarm_interval must be non-zero"));
        }

        for schema in &self.schemas {
            if schema.atom_id <= 0 {
                return Err(AtomdError::config(format!(
                    "Schema '{}' has invalid atom id {}",
                    schema.name, schema.atom_id
                )));
            }
        }

        Ok(())
    }

    /// Built-in atom schemas plus the declared ones. Declarations override
    /// built-ins with the same id.
    pub fn schema_registry(&self) -> SchemaRegistry {
        let mut registry = SchemaRegistry::with_builtin_atoms();
        for schema in &self.schemas {
            if registry.register(schema.clone()).is_some() {
                tracing::info!("Schema for atom {} overrides built-in", schema.atom_id);
            }
        }
        registry
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Parses a YAML (or JSON) document. Enum variants carrying data are read
/// as single-key maps, e.g. `{ field: 3 }` or `first_n_samples: 5`.
pub fn parse_yaml<T: DeserializeOwned>(text: &str) -> std::result::Result<T, serde_yaml::Error> {
    serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(text))
}

/// Configuration builder for programmatic construction
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = parse_yaml(yaml)
            .map_err(|e| AtomdError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.server.http_port = port;
        self
    }

    /// Set the config limit
    pub fn max_configs(mut self, count: usize) -> Self {
        self.config.engine.max_configs = count;
        self
    }

    /// Set the per-metric dimension limit
    pub fn max_dimensions_per_metric(mut self, count: usize) -> Self {
        self.config.engine.max_dimensions_per_metric = count;
        self
    }

    /// Set the default bucket size
    pub fn default_bucket_size(mut self, size: Duration) -> Self {
        self.config.engine.default_bucket_size = size;
        self
    }

    /// Declare an additional atom schema
    pub fn schema(mut self, schema: AtomSchema) -> Self {
        self.config.schemas.push(schema);
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Watches a stats config file and publishes every parseable revision.
pub struct ConfigWatcher {
    path: PathBuf,
    tx: tokio::sync::watch::Sender<StatsConfig>,
    rx: tokio::sync::watch::Receiver<StatsConfig>,
}

impl ConfigWatcher {
    /// Create a new stats config watcher
    pub fn new(path: PathBuf, initial: StatsConfig) -> Self {
        let (tx, rx) = tokio::sync::watch::channel(initial);
        ConfigWatcher { path, tx, rx }
    }

    /// Get a receiver for stats config updates
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<StatsConfig> {
        self.rx.clone()
    }

    /// Start watching for changes. Returns when the watcher shuts down.
    pub async fn watch(self) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| AtomdError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| AtomdError::config(format!("Failed to watch stats config: {}", e)))?;

        tracing::info!("Watching stats config file: {:?}", self.path);

        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, notify::EventKind::Modify(_)) {
                continue;
            }
            tracing::info!("Stats config file changed, reloading...");

            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::error!("Failed to read stats config file: {}", e);
                    continue;
                },
            };
            match StatsConfig::from_yaml(&content) {
                Ok(config) => {
                    if self.tx.send(config).is_err() {
                        tracing::debug!("No stats config subscribers left, stopping watcher");
                        break;
                    }
                },
                Err(e) => tracing::error!("{}", e),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldType;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let mut config = Config::default();
        config.engine.max_configs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.default_bucket_size = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.default_bucket_size = Duration::from_secs(300 * 365 * 24 * 60 * 60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .http_port(9091)
            .max_configs(4)
            .max_dimensions_per_metric(10)
            .default_bucket_size(Duration::from_secs(60))
            .debug(true)
            .build();

        assert!(config.is_ok());
        let config = config.unwrap();
        assert_eq!(config.server.http_port, 9091);
        assert_eq!(config.engine.max_configs, 4);
        assert_eq!(config.engine.max_dimensions_per_metric, 10);
        assert_eq!(config.engine.default_bucket_size, Duration::from_secs(60));
        assert!(config.debug);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
server:
  bind_address: "127.0.0.1"
  http_port: 9125
engine:
  max_configs: 8
  default_bucket_size: 1m
puller:
  default_timeout: 500ms
schemas:
  - atom_id: 100001
    name: BatteryLevel
    fields: [int]
    pulled: true
"#;

        let config = ConfigBuilder::new().from_yaml(yaml).unwrap().build();

        assert!(config.is_ok());
        let config = config.unwrap();
        assert_eq!(config.server.http_port, 9125);
        assert_eq!(config.engine.max_configs, 8);
        assert_eq!(config.engine.default_bucket_size, Duration::from_secs(60));
        assert_eq!(config.puller.default_timeout, Duration::from_millis(500));

        let registry = config.schema_registry();
        let battery = registry.get(100001).unwrap();
        assert!(battery.pulled);
        assert_eq!(battery.field_type(1), Some(FieldType::Int));
    }

    #[test]
    fn test_invalid_schema_id() {
        let config = ConfigBuilder::new()
            .schema(AtomSchema::new(-1, "Broken", vec![]))
            .build();
        assert!(config.is_err());
    }
}
