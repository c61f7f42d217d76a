//! Main application wiring for atomd.

use crate::core::clock::elapsed_realtime_ns;
use crate::core::{Atom, AtomdError, Config, ConfigKey, ConfigWatcher, Result};
use crate::engine::{StatsConfig, StatsEngine};
use crate::receiver;
use crate::report::ConfigMetricsReport;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Key under which a stats config loaded from disk is installed.
pub const LOCAL_CONFIG_KEY: ConfigKey = ConfigKey { uid: 0, id: 1 };

/// Coordinates the engine, the HTTP API, the pull alarm and the stats
/// config watcher.
pub struct Application {
    engine: Arc<StatsEngine>,
    config: Config,
    stats_config: Option<StatsConfig>,
    stats_config_path: Option<PathBuf>,
    watch: bool,
}

impl Application {
    /// Create a new Application with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        let engine = Arc::new(StatsEngine::from_config(&config)?);
        Ok(Self {
            engine,
            config,
            stats_config: None,
            stats_config_path: None,
            watch: false,
        })
    }

    /// Installs the stats config at `path` under [`LOCAL_CONFIG_KEY`]. With
    /// `watch`, later edits of the file are re-uploaded while running.
    pub async fn with_stats_config(mut self, path: PathBuf, watch: bool) -> Result<Self> {
        let stats_config = load_stats_config(&path).await?;
        self.engine
            .upload(LOCAL_CONFIG_KEY, &stats_config, elapsed_realtime_ns())?;
        tracing::info!(
            "Installed stats config {:?} ({} metrics)",
            path,
            stats_config.metric_count()
        );
        self.stats_config = Some(stats_config);
        self.stats_config_path = Some(path);
        self.watch = watch;
        Ok(self)
    }

    /// Feeds a JSON-lines file of atoms through the engine and returns the
    /// report of the local config. The local config is reinstalled with its
    /// time base at the first atom so recorded timestamps are not late.
    pub async fn replay(&self, path: &Path) -> Result<ConfigMetricsReport> {
        let stats_config = self
            .stats_config
            .as_ref()
            .ok_or_else(|| AtomdError::config("Replay needs a stats config"))?;
        let content = tokio::fs::read_to_string(path).await?;

        let mut atoms = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Atom>(line) {
                Ok(atom) => atoms.push(atom),
                Err(e) => {
                    tracing::warn!("Skipping line {} of {:?}: {}", line_no + 1, path, e);
                    self.engine.monitor().record_atom_dropped(&e.to_string());
                },
            }
        }

        let first_ns = atoms.iter().map(Atom::elapsed_timestamp_ns).min().unwrap_or(0);
        let last_ns = atoms.iter().map(Atom::elapsed_timestamp_ns).max().unwrap_or(0);
        self.engine.upload(LOCAL_CONFIG_KEY, stats_config, first_ns)?;

        let mut accepted = 0usize;
        for atom in &atoms {
            if self.engine.log_event(atom).await {
                accepted += 1;
            }
        }
        tracing::info!("Replayed {} of {} atoms from {:?}", accepted, atoms.len(), path);
        self.engine.query(LOCAL_CONFIG_KEY, last_ns + 1, false)
    }

    /// Run until the HTTP server fails or ctrl-c is received.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting atomd");

        let alarm_engine = Arc::clone(&self.engine);
        let alarm_interval = self.config.puller.alarm_interval;
        let alarm_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(alarm_interval);
            loop {
                ticker.tick().await;
                let served = alarm_engine.on_alarm(elapsed_realtime_ns()).await;
                if served > 0 {
                    tracing::trace!("Pull alarm served {} receivers", served);
                }
            }
        });

        let watcher_handle = match (&self.stats_config_path, self.watch) {
            (Some(path), true) => Some(spawn_stats_config_watcher(
                Arc::clone(&self.engine),
                path.clone(),
            )),
            _ => None,
        };

        let shutdown = tokio::signal::ctrl_c();
        let result = tokio::select! {
            result = receiver::serve(Arc::clone(&self.engine), &self.config.server) => {
                if let Err(e) = &result {
                    tracing::error!("HTTP server error: {}", e);
                }
                result
            }
            _ = shutdown => {
                tracing::info!("Received shutdown signal, stopping...");
                Ok(())
            }
        };

        alarm_handle.abort();
        if let Some(handle) = watcher_handle {
            handle.abort();
        }
        result
    }

    /// Get a reference to the engine.
    pub fn engine(&self) -> &Arc<StatsEngine> {
        &self.engine
    }

    /// Get a reference to the service configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Reads and parses a stats config file.
pub async fn load_stats_config(path: &Path) -> Result<StatsConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AtomdError::config(format!("Failed to read stats config {:?}: {}", path, e)))?;
    StatsConfig::from_yaml(&content)
}

fn spawn_stats_config_watcher(
    engine: Arc<StatsEngine>,
    path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let initial = match load_stats_config(&path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Stats config watcher not started: {}", e);
                return;
            },
        };
        let watcher = ConfigWatcher::new(path, initial);
        let mut updates = watcher.subscribe();
        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                tracing::error!("Stats config watcher failed: {}", e);
            }
        });
        while updates.changed().await.is_ok() {
            let config = updates.borrow_and_update().clone();
            match engine.upload(LOCAL_CONFIG_KEY, &config, elapsed_realtime_ns()) {
                Ok(_) => tracing::info!("Stats config reloaded"),
                Err(e) => tracing::error!("Reloaded stats config rejected: {}", e),
            }
        }
    })
}
