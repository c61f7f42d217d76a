//! Engine monitoring and health reporting.
//!
//! Counters are plain atomics bumped on the ingest hot path; everything else
//! is computed when a snapshot is requested.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

/// Recent error messages kept for `/v1/stats`.
const MAX_RECENT_ERRORS: usize = 100;

/// System health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    /// All systems operational.
    Healthy,
    /// Pulls or ingestion are failing but configs are still served.
    Degraded,
    /// Most pulls or atoms are failing.
    Unhealthy,
}

impl SystemHealth {
    /// Severity score (0-100).
    pub fn severity(&self) -> u8 {
        match self {
            SystemHealth::Healthy => 0,
            SystemHealth::Degraded => 25,
            SystemHealth::Unhealthy => 75,
        }
    }
}

/// Error tracking helper.
#[derive(Debug, Default)]
struct ErrorTracker {
    categories: BTreeMap<String, u64>,
    recent: VecDeque<(SystemTime, String)>,
    total: u64,
}

impl ErrorTracker {
    fn record_error(&mut self, category: &str, message: String) {
        self.total += 1;
        *self.categories.entry(category.to_string()).or_insert(0) += 1;
        self.recent.push_back((SystemTime::now(), message));
        if self.recent.len() > MAX_RECENT_ERRORS {
            self.recent.pop_front();
        }
    }
}

/// Counters shared by the engine, the puller manager and the receivers.
#[derive(Debug)]
pub struct Monitor {
    atoms_received: AtomicU64,
    atoms_dropped: AtomicU64,
    atoms_matched: AtomicU64,
    config_uploads: AtomicU64,
    config_rejections: AtomicU64,
    reports_served: AtomicU64,
    pulls: AtomicU64,
    pull_cache_hits: AtomicU64,
    pull_timeouts: AtomicU64,
    pull_failures: AtomicU64,
    anomalies: AtomicU64,
    broadcasts: AtomicU64,
    errors: Mutex<ErrorTracker>,
    started: Instant,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            atoms_received: AtomicU64::new(0),
            atoms_dropped: AtomicU64::new(0),
            atoms_matched: AtomicU64::new(0),
            config_uploads: AtomicU64::new(0),
            config_rejections: AtomicU64::new(0),
            reports_served: AtomicU64::new(0),
            pulls: AtomicU64::new(0),
            pull_cache_hits: AtomicU64::new(0),
            pull_timeouts: AtomicU64::new(0),
            pull_failures: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            errors: Mutex::new(ErrorTracker::default()),
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn record_atom_received(&self) {
        self.atoms_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A malformed atom was dropped at ingress.
    pub fn record_atom_dropped(&self, reason: &str) {
        self.atoms_dropped.fetch_add(1, Ordering::Relaxed);
        self.record_error("ingress", reason.to_string());
    }

    #[inline]
    pub fn record_atom_matched(&self) {
        self.atoms_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_upload(&self, accepted: bool) {
        if accepted {
            self.config_uploads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.config_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_report(&self) {
        self.reports_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pull(&self) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pull_cache_hit(&self) {
        self.pull_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pull_timeout(&self, atom_tag: i32) {
        self.pull_timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_error("pull", format!("Pull of atom {} timed out", atom_tag));
    }

    pub fn record_pull_failure(&self, atom_tag: i32, reason: &str) {
        self.pull_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error("pull", format!("Pull of atom {} failed: {}", atom_tag, reason));
    }

    pub fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, category: &str, message: String) {
        self.errors.lock().record_error(category, message);
    }

    /// Healthy unless a large share of pulls or atoms are failing.
    pub fn health(&self) -> SystemHealth {
        let failure_rate = |failed: u64, total: u64| {
            if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            }
        };
        let pulls = self.pulls.load(Ordering::Relaxed);
        let pull_failed =
            self.pull_timeouts.load(Ordering::Relaxed) + self.pull_failures.load(Ordering::Relaxed);
        let received = self.atoms_received.load(Ordering::Relaxed);
        let dropped = self.atoms_dropped.load(Ordering::Relaxed);

        let worst = failure_rate(pull_failed, pulls).max(failure_rate(dropped, received + dropped));
        if worst >= 0.5 {
            SystemHealth::Unhealthy
        } else if worst >= 0.1 {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        }
    }

    pub fn snapshot(&self, active_configs: usize) -> EngineStats {
        let errors = self.errors.lock();
        EngineStats {
            health: self.health(),
            uptime_seconds: self.started.elapsed().as_secs(),
            active_configs,
            atoms_received: self.atoms_received.load(Ordering::Relaxed),
            atoms_dropped: self.atoms_dropped.load(Ordering::Relaxed),
            atoms_matched: self.atoms_matched.load(Ordering::Relaxed),
            config_uploads: self.config_uploads.load(Ordering::Relaxed),
            config_rejections: self.config_rejections.load(Ordering::Relaxed),
            reports_served: self.reports_served.load(Ordering::Relaxed),
            pulls: self.pulls.load(Ordering::Relaxed),
            pull_cache_hits: self.pull_cache_hits.load(Ordering::Relaxed),
            pull_timeouts: self.pull_timeouts.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            total_errors: errors.total,
            error_categories: errors.categories.clone(),
            recent_errors: errors.recent.iter().rev().take(10).map(|(_, m)| m.clone()).collect(),
        }
    }
}

/// Point-in-time copy of every counter, served by `/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub health: SystemHealth,
    pub uptime_seconds: u64,
    pub active_configs: usize,
    pub atoms_received: u64,
    pub atoms_dropped: u64,
    pub atoms_matched: u64,
    pub config_uploads: u64,
    pub config_rejections: u64,
    pub reports_served: u64,
    pub pulls: u64,
    pub pull_cache_hits: u64,
    pub pull_timeouts: u64,
    pub pull_failures: u64,
    pub anomalies: u64,
    pub broadcasts: u64,
    pub total_errors: u64,
    pub error_categories: BTreeMap<String, u64>,
    pub recent_errors: Vec<String>,
}
