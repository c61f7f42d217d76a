//! Command-line interface for atomd.
//!
//! Run `atomd --stats-config metrics.yaml` to start the HTTP API with a
//! stats config installed, or `atomd --stats-config metrics.yaml --replay
//! atoms.jsonl` to aggregate a recorded atom log offline.

use crate::application::Application;
use crate::core::config::ConfigBuilder;
use crate::core::{AtomdError, Config, Result};
use clap::Parser;
use std::path::PathBuf;

/// Config-driven telemetry atom aggregation daemon.
#[derive(Parser, Debug)]
#[command(name = "atomd")]
#[command(version, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// HTTP port for the API
    #[arg(long, env = "ATOMD_HTTP_PORT")]
    pub port: Option<u16>,

    /// Service configuration file (default: ~/.config/atomd/config.yaml)
    #[arg(short, long, env = "ATOMD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stats config to install at startup
    #[arg(short, long, env = "ATOMD_STATS_CONFIG")]
    pub stats_config: Option<PathBuf>,

    /// Reinstall the stats config whenever the file changes
    #[arg(short, long)]
    pub watch: bool,

    /// Maximum number of installed stats configs
    #[arg(long, env = "ATOMD_MAX_CONFIGS")]
    pub max_configs: Option<usize>,

    /// Replay a JSON-lines atom log, print the report and exit
    #[arg(long, value_name = "ATOMS_JSONL")]
    pub replay: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "ATOMD_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Show version information
    #[arg(short = 'V', long = "show-version")]
    pub version: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = if let Some(path) = &self.config {
            path.clone()
        } else {
            let default_path = dirs::config_dir()
                .map(|d| d.join("atomd").join("config.yaml"))
                .unwrap_or_else(|| PathBuf::from("~/.config/atomd/config.yaml"));

            if default_path.exists() {
                default_path
            } else {
                return self.build_config_from_args(builder);
            }
        };

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                builder = builder.from_yaml(&content)?;
                tracing::info!("Loaded configuration from: {:?}", config_path);
            },
            Err(e) if self.config.is_some() => {
                return Err(AtomdError::config(format!(
                    "Failed to read config file {:?}: {}",
                    config_path, e
                )));
            },
            Err(_) => {
                tracing::debug!("No config file found at {:?}, using defaults", config_path);
            },
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(port) = self.port {
            builder = builder.http_port(port);
        }
        if let Some(limit) = self.max_configs {
            builder = builder.max_configs(limit);
        }
        builder.debug(self.debug).build()
    }

    /// Initialize logging. `ATOMD_LOG_LEVEL` sets the default filter,
    /// `RUST_LOG` overrides it and `--debug` forces debug.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level = std::env::var("ATOMD_LOG_LEVEL")
            .unwrap_or_else(|_| config.logging.level.as_str().to_string());
        let log_level = if self.debug {
            "debug"
        } else {
            env_log_level.as_str()
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = if config.logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| AtomdError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute the atomd application.
pub async fn execute(cli: Cli) -> Result<()> {
    if cli.version {
        println!("atomd {}", env!("CARGO_PKG_VERSION"));
        println!("Config-driven telemetry atom aggregation daemon");
        return Ok(());
    }

    let config = cli.load_config().await?;
    cli.init_logging(&config)?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  HTTP port: {}", config.server.http_port);
        println!("  Max configs: {}", config.engine.max_configs);
        println!(
            "  Max dimensions per metric: {}",
            config.engine.max_dimensions_per_metric
        );
        println!("  Declared atom schemas: {}", config.schemas.len());
        if let Some(path) = &cli.stats_config {
            let stats_config = crate::application::load_stats_config(path).await?;
            stats_config.validate(&config.schema_registry())?;
            println!("  Stats config {:?}: {} metrics", path, stats_config.metric_count());
        }
        return Ok(());
    }

    let mut app = Application::new(config)?;
    if let Some(path) = cli.stats_config.clone() {
        app = app.with_stats_config(path, cli.watch).await?;
    }

    if let Some(path) = &cli.replay {
        let report = app.replay(path).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    app.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["atomd"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.watch);
        assert!(cli.stats_config.is_none());
        assert!(cli.replay.is_none());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from(["atomd", "--port", "9000", "--max-configs", "4"]).unwrap();
        let config = cli.build_config_from_args(ConfigBuilder::new()).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.engine.max_configs, 4);
    }

    #[tokio::test]
    async fn test_missing_explicit_config_file() {
        let cli = Cli::try_parse_from(["atomd", "--config", "/nonexistent/atomd.yaml"]).unwrap();
        assert!(cli.load_config().await.is_err());
    }
}
