//! The stats engine: the registry of installed configs and the entry point
//! for atoms, pulls and report queries.
//!
//! Configs live in a [`DashMap`] keyed by [`ConfigKey`], each behind its own
//! mutex. Atoms visit every config in turn; two configs never contend with
//! each other, and a query only blocks the config it reads.

pub mod activation;
pub mod predicate;
pub mod processor;
pub mod stats_config;

pub use processor::{AtomOutcome, ConfigProcessor, PullRequest, ScheduledPull};
pub use stats_config::StatsConfig;

use crate::core::config::{Config, EngineConfig};
use crate::core::error::{AtomdError, Result};
use crate::core::types::{Atom, ConfigKey};
use crate::monitoring::{EngineStats, Monitor};
use crate::puller::{PullOutcome, PullReceiver, PullerManager};
use crate::report::ConfigMetricsReport;
use crate::schema::SchemaRegistry;
use crate::subscriber::SubscriberReporter;
use crate::uid_map::UidMap;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A pull requested by a config while processing an atom. Carries the
/// config generation so the result is dropped if the config was replaced
/// in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPull {
    pub config_key: ConfigKey,
    pub generation: u64,
    pub request: PullRequest,
}

pub struct StatsEngine {
    settings: EngineConfig,
    schemas: SchemaRegistry,
    configs: DashMap<ConfigKey, Arc<Mutex<ConfigProcessor>>>,
    /// Serializes uploads and removals so the config limit check, the pull
    /// schedule and the insert happen as one step.
    install_lock: Mutex<()>,
    next_generation: AtomicU64,
    uid_map: RwLock<UidMap>,
    pullers: Arc<PullerManager>,
    subscribers: SubscriberReporter,
    monitor: Arc<Monitor>,
}

impl StatsEngine {
    pub fn new(settings: EngineConfig, schemas: SchemaRegistry) -> Self {
        Self::with_uid_map(settings, schemas, UidMap::default())
    }

    fn with_uid_map(settings: EngineConfig, schemas: SchemaRegistry, uid_map: UidMap) -> Self {
        let monitor = Arc::new(Monitor::new());
        Self {
            settings,
            schemas,
            configs: DashMap::new(),
            install_lock: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            uid_map: RwLock::new(uid_map),
            pullers: Arc::new(PullerManager::new(monitor.clone())),
            subscribers: SubscriberReporter::new(),
            monitor,
        }
    }

    /// Builds an engine from the service configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_uid_map(
            config.engine.clone(),
            config.schema_registry(),
            UidMap::new(config.uid_map.max_deleted_apps),
        ))
    }

    /// Validates and installs `config` under `key`, replacing (and
    /// discarding the data of) any config already there. On error the
    /// previous config stays installed.
    pub fn upload(&self, key: ConfigKey, config: &StatsConfig, now_ns: i64) -> Result<ConfigKey> {
        let matchers = match config.validate(&self.schemas) {
            Ok(matchers) => matchers,
            Err(e) => {
                tracing::warn!("Rejected config {}: {}", key, e);
                self.monitor.record_config_upload(false);
                self.monitor.record_error("config", format!("{}: {}", key, e));
                return Err(e.into());
            },
        };
        let _install = self.install_lock.lock();
        if !self.configs.contains_key(&key) && self.configs.len() >= self.settings.max_configs {
            self.monitor.record_config_upload(false);
            return Err(AtomdError::TooManyConfigs {
                limit: self.settings.max_configs,
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let processor = ConfigProcessor::new(
            key,
            generation,
            config,
            matchers,
            &self.schemas,
            &self.settings,
            now_ns,
        );

        self.pullers.unregister_config(key);
        for pull in processor.scheduled_pulls() {
            self.pullers.register_receiver(
                pull.atom_tag,
                PullReceiver {
                    config_key: key,
                    metric_id: pull.metric_id,
                    generation,
                },
                pull.next_pull_ns,
                pull.interval_ns,
            );
        }

        let replaced = self
            .configs
            .insert(key, Arc::new(Mutex::new(processor)))
            .is_some();
        self.monitor.record_config_upload(true);
        tracing::info!(
            "{} config {} ({} metrics, generation {})",
            if replaced { "Replaced" } else { "Installed" },
            key,
            config.metric_count(),
            generation
        );
        Ok(key)
    }

    /// Removes a config together with its data, pull schedule and
    /// subscribers.
    pub fn remove(&self, key: ConfigKey) -> Result<()> {
        let _install = self.install_lock.lock();
        if self.configs.remove(&key).is_none() {
            return Err(AtomdError::ConfigNotFound(key));
        }
        self.pullers.unregister_config(key);
        self.subscribers.unset_config(key);
        tracing::info!("Removed config {}", key);
        Ok(())
    }

    /// Feeds one atom through every config. Returns the pulls the configs
    /// asked for; malformed atoms are dropped and counted.
    pub fn on_log_event(&self, atom: &Atom) -> Vec<PendingPull> {
        if let Err(e) = atom.validate() {
            tracing::debug!("Dropping atom {}: {}", atom.atom_id(), e);
            self.monitor.record_atom_dropped(&e.to_string());
            return Vec::new();
        }
        self.monitor.record_atom_received();

        let uid_map = self.uid_map.read();
        let mut pending = Vec::new();
        let mut matched = false;
        for entry in self.configs.iter() {
            let mut processor = entry.value().lock();
            let outcome = processor.on_atom(atom, &uid_map);
            matched |= outcome.matched;
            for _ in 0..outcome.anomalies {
                self.monitor.record_anomaly();
            }
            for (subscription, alert) in outcome.alerts {
                if self
                    .subscribers
                    .alert_broadcast_subscriber(*entry.key(), &subscription, alert)
                {
                    self.monitor.record_broadcast();
                }
            }
            let generation = processor.generation();
            pending.extend(outcome.pull_requests.into_iter().map(|request| PendingPull {
                config_key: *entry.key(),
                generation,
                request,
            }));
        }
        if matched {
            self.monitor.record_atom_matched();
        }
        pending
    }

    /// Feeds one atom and runs any pulls it triggered. Returns false when
    /// the atom was malformed and dropped.
    pub async fn log_event(&self, atom: &Atom) -> bool {
        let accepted = atom.validate().is_ok();
        for pull in self.on_log_event(atom) {
            self.execute_pull(pull).await;
        }
        accepted
    }

    /// Runs a triggered pull outside every config lock and delivers the
    /// result.
    pub async fn execute_pull(&self, pull: PendingPull) {
        let started = Instant::now();
        let outcome = self
            .pullers
            .pull(pull.request.atom_tag, pull.request.request_ns)
            .await;
        self.deliver_pull(
            pull.config_key,
            pull.generation,
            pull.request.metric_id,
            pull.request.request_ns,
            started.elapsed(),
            &outcome,
        );
    }

    fn deliver_pull(
        &self,
        key: ConfigKey,
        generation: u64,
        metric_id: i64,
        request_ns: i64,
        delay: Duration,
        outcome: &PullOutcome,
    ) {
        let Some(processor) = self.processor(key) else {
            tracing::debug!("Config {} went away before its pull completed", key);
            return;
        };
        let mut processor = processor.lock();
        if processor.generation() != generation {
            tracing::debug!(
                "Dropping pull for config {}: generation {} replaced by {}",
                key,
                generation,
                processor.generation()
            );
            return;
        }
        let uid_map = self.uid_map.read();
        processor.on_pull_result(metric_id, request_ns, delay, outcome, &uid_map);
    }

    /// Runs every periodic pull that is due at `now_ns`. Returns how many
    /// receivers were served.
    pub async fn on_alarm(&self, now_ns: i64) -> usize {
        let pulls = self
            .pullers
            .on_alarm_fired(now_ns)
            .into_iter()
            .map(|(atom_tag, receivers)| async move {
                let started = Instant::now();
                let outcome = self.pullers.pull(atom_tag, now_ns).await;
                (receivers, started.elapsed(), outcome)
            });

        let mut served = 0;
        for (receivers, delay, outcome) in join_all(pulls).await {
            for receiver in receivers {
                self.deliver_pull(
                    receiver.config_key,
                    receiver.generation,
                    receiver.metric_id,
                    now_ns,
                    delay,
                    &outcome,
                );
                served += 1;
            }
        }
        self.pullers.clear_puller_cache_if_necessary(now_ns).await;
        served
    }

    fn processor(&self, key: ConfigKey) -> Option<Arc<Mutex<ConfigProcessor>>> {
        self.configs.get(&key).map(|entry| entry.value().clone())
    }

    /// Snapshots a config's metrics, optionally draining them in the same
    /// critical section.
    pub fn query(&self, key: ConfigKey, dump_ns: i64, clear: bool) -> Result<ConfigMetricsReport> {
        let processor = self.processor(key).ok_or(AtomdError::ConfigNotFound(key))?;
        let report = processor.lock().dump(dump_ns, clear);
        self.monitor.record_report();
        tracing::debug!(
            "Served report for {} ({} metrics, clear={})",
            key,
            report.metrics.len(),
            clear
        );
        Ok(report)
    }

    /// Drops a config's accumulated data without reporting it.
    pub fn clear_report(&self, key: ConfigKey, now_ns: i64) -> Result<()> {
        let processor = self.processor(key).ok_or(AtomdError::ConfigNotFound(key))?;
        processor.lock().clear(now_ns);
        Ok(())
    }

    pub fn config_keys(&self) -> Vec<ConfigKey> {
        let mut keys: Vec<ConfigKey> = self.configs.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.monitor.snapshot(self.configs.len())
    }

    pub fn uid_map(&self) -> &RwLock<UidMap> {
        &self.uid_map
    }

    pub fn pullers(&self) -> &Arc<PullerManager> {
        &self.pullers
    }

    pub fn subscribers(&self) -> &SubscriberReporter {
        &self.subscribers
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }
}
