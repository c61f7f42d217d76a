//! Pulled-atom sources.
//!
//! Pulled atoms are produced on demand by registered callbacks. Each puller
//! is keyed by `(atom_tag, uid)` and carries a cool-down: a second pull
//! within the cool-down is served from the cache. Every callback invocation
//! runs under a timeout so an unresponsive source yields a failed pull
//! instead of stalling ingestion.
//!
//! The manager also keeps the periodic pull schedule. Metrics register as
//! receivers with an interval; [`PullerManager::on_alarm_fired`] returns the
//! receivers that are due.

use crate::core::error::Result;
use crate::core::types::{Atom, ConfigKey, FieldValue};
use crate::monitoring::Monitor;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of pulled atoms.
#[async_trait]
pub trait PullAtomCallback: Send + Sync {
    async fn on_pull_atom(&self, atom_tag: i32) -> Result<Vec<Atom>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullAtomMetadata {
    pub cool_down: Duration,
    pub timeout: Duration,
    /// Fields summed when a pull returns several atoms that agree on every
    /// other field.
    pub additive_fields: Vec<u32>,
}

impl Default for PullAtomMetadata {
    fn default() -> Self {
        Self {
            cool_down: DEFAULT_COOL_DOWN,
            timeout: DEFAULT_TIMEOUT,
            additive_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PullerKey {
    pub atom_tag: i32,
    pub uid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullFailure {
    NoPuller,
    Timeout,
    Error(String),
}

impl fmt::Display for PullFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullFailure::NoPuller => f.write_str("no puller registered"),
            PullFailure::Timeout => f.write_str("pull timed out"),
            PullFailure::Error(reason) => write!(f, "pull failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    Success(Vec<Atom>),
    Failed(PullFailure),
}

/// A metric waiting for periodic pulls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullReceiver {
    pub config_key: ConfigKey,
    pub metric_id: i64,
    /// Upload generation of the config, so a replaced config never receives
    /// data meant for its predecessor.
    pub generation: u64,
}

#[derive(Debug, Default)]
struct PullCache {
    last_pull_ns: Option<i64>,
    data: Vec<Atom>,
}

struct Puller {
    key: PullerKey,
    metadata: PullAtomMetadata,
    callback: Arc<dyn PullAtomCallback>,
    cache: tokio::sync::Mutex<PullCache>,
}

impl Puller {
    fn cool_down_ns(&self) -> i64 {
        i64::try_from(self.metadata.cool_down.as_nanos()).unwrap_or(i64::MAX)
    }

    async fn pull(&self, now_ns: i64, monitor: &Monitor) -> PullOutcome {
        let atom_tag = self.key.atom_tag;
        let mut cache = self.cache.lock().await;
        if let Some(last) = cache.last_pull_ns {
            if now_ns - last < self.cool_down_ns() {
                monitor.record_pull_cache_hit();
                return PullOutcome::Success(cache.data.clone());
            }
        }

        monitor.record_pull();
        let pulled = tokio::time::timeout(
            self.metadata.timeout,
            self.callback.on_pull_atom(atom_tag),
        )
        .await;
        match pulled {
            Ok(Ok(atoms)) => {
                let atoms: Vec<Atom> = atoms
                    .into_iter()
                    .filter(|atom| atom.atom_id() == atom_tag)
                    .map(|atom| atom.with_timestamp_ns(now_ns))
                    .collect();
                let atoms = merge_additive(atoms, &self.metadata.additive_fields);
                tracing::debug!("Pulled {} atoms for tag {}", atoms.len(), atom_tag);
                cache.last_pull_ns = Some(now_ns);
                cache.data = atoms.clone();
                PullOutcome::Success(atoms)
            },
            Ok(Err(e)) => {
                tracing::warn!("Pull of atom {} failed: {}", atom_tag, e);
                monitor.record_pull_failure(atom_tag, &e.to_string());
                *cache = PullCache::default();
                PullOutcome::Failed(PullFailure::Error(e.to_string()))
            },
            Err(_) => {
                tracing::warn!(
                    "Pull of atom {} timed out after {:?}",
                    atom_tag,
                    self.metadata.timeout
                );
                monitor.record_pull_timeout(atom_tag);
                *cache = PullCache::default();
                PullOutcome::Failed(PullFailure::Timeout)
            },
        }
    }
}

#[derive(Debug)]
struct ReceiverInfo {
    receiver: PullReceiver,
    next_pull_ns: i64,
    interval_ns: i64,
}

pub struct PullerManager {
    pullers: RwLock<BTreeMap<PullerKey, Arc<Puller>>>,
    receivers: Mutex<HashMap<i32, Vec<ReceiverInfo>>>,
    monitor: Arc<Monitor>,
}

impl PullerManager {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self {
            pullers: RwLock::new(BTreeMap::new()),
            receivers: Mutex::new(HashMap::new()),
            monitor,
        }
    }

    /// Registers (or replaces) the callback for `atom_tag` owned by `uid`.
    pub fn register_pull_atom_callback(
        &self,
        uid: i32,
        atom_tag: i32,
        metadata: PullAtomMetadata,
        callback: Arc<dyn PullAtomCallback>,
    ) {
        let key = PullerKey { atom_tag, uid };
        tracing::info!(
            "Registered puller for atom {} (uid {}, cool-down {:?}, timeout {:?})",
            atom_tag,
            uid,
            metadata.cool_down,
            metadata.timeout
        );
        self.pullers.write().insert(
            key,
            Arc::new(Puller {
                key,
                metadata,
                callback,
                cache: tokio::sync::Mutex::new(PullCache::default()),
            }),
        );
    }

    pub fn unregister_pull_atom_callback(&self, uid: i32, atom_tag: i32) -> bool {
        self.pullers
            .write()
            .remove(&PullerKey { atom_tag, uid })
            .is_some()
    }

    pub fn puller_for_matcher_exists(&self, atom_tag: i32) -> bool {
        self.find(atom_tag).is_some()
    }

    /// Lowest uid wins when several owners registered the same tag.
    fn find(&self, atom_tag: i32) -> Option<Arc<Puller>> {
        let lo = PullerKey {
            atom_tag,
            uid: i32::MIN,
        };
        let hi = PullerKey {
            atom_tag,
            uid: i32::MAX,
        };
        self.pullers
            .read()
            .range(lo..=hi)
            .next()
            .map(|(_, puller)| puller.clone())
    }

    /// Pulls `atom_tag`, serving from cache within the cool-down. Returned
    /// atoms are stamped with `now_ns`.
    pub async fn pull(&self, atom_tag: i32, now_ns: i64) -> PullOutcome {
        match self.find(atom_tag) {
            Some(puller) => puller.pull(now_ns, &self.monitor).await,
            None => {
                tracing::debug!("No puller for atom {}", atom_tag);
                PullOutcome::Failed(PullFailure::NoPuller)
            },
        }
    }

    fn all_pullers(&self) -> Vec<Arc<Puller>> {
        self.pullers.read().values().cloned().collect()
    }

    /// Empties every cache. Returns how many held data.
    pub async fn force_clear_puller_cache(&self) -> usize {
        let mut cleared = 0;
        for puller in self.all_pullers() {
            let mut cache = puller.cache.lock().await;
            if cache.last_pull_ns.is_some() {
                *cache = PullCache::default();
                cleared += 1;
            }
        }
        cleared
    }

    /// Empties caches whose cool-down has elapsed.
    pub async fn clear_puller_cache_if_necessary(&self, now_ns: i64) -> usize {
        let mut cleared = 0;
        for puller in self.all_pullers() {
            let mut cache = puller.cache.lock().await;
            if cache
                .last_pull_ns
                .is_some_and(|last| now_ns - last >= puller.cool_down_ns())
            {
                *cache = PullCache::default();
                cleared += 1;
            }
        }
        cleared
    }

    /// Schedules `receiver` for pulls of `atom_tag` every `interval_ns`,
    /// starting at `next_pull_ns`.
    pub fn register_receiver(
        &self,
        atom_tag: i32,
        receiver: PullReceiver,
        next_pull_ns: i64,
        interval_ns: i64,
    ) {
        let mut receivers = self.receivers.lock();
        let entries = receivers.entry(atom_tag).or_default();
        entries.retain(|info| info.receiver != receiver);
        entries.push(ReceiverInfo {
            receiver,
            next_pull_ns,
            interval_ns: interval_ns.max(1),
        });
    }

    pub fn unregister_receiver(&self, atom_tag: i32, receiver: &PullReceiver) {
        let mut receivers = self.receivers.lock();
        if let Some(entries) = receivers.get_mut(&atom_tag) {
            entries.retain(|info| &info.receiver != receiver);
            if entries.is_empty() {
                receivers.remove(&atom_tag);
            }
        }
    }

    /// Drops every receiver belonging to a config.
    pub fn unregister_config(&self, config_key: ConfigKey) {
        let mut receivers = self.receivers.lock();
        for entries in receivers.values_mut() {
            entries.retain(|info| info.receiver.config_key != config_key);
        }
        receivers.retain(|_, entries| !entries.is_empty());
    }

    /// Due receivers grouped by atom tag. Each due receiver is rescheduled to
    /// its first slot after `now_ns`; missed slots are skipped, not replayed.
    pub fn on_alarm_fired(&self, now_ns: i64) -> Vec<(i32, Vec<PullReceiver>)> {
        let mut receivers = self.receivers.lock();
        let mut due: Vec<(i32, Vec<PullReceiver>)> = Vec::new();
        for (atom_tag, entries) in receivers.iter_mut() {
            let mut hits = Vec::new();
            for info in entries.iter_mut() {
                if info.next_pull_ns <= now_ns {
                    hits.push(info.receiver.clone());
                    let missed = (now_ns - info.next_pull_ns) / info.interval_ns;
                    info.next_pull_ns += (missed + 1) * info.interval_ns;
                }
            }
            if !hits.is_empty() {
                due.push((*atom_tag, hits));
            }
        }
        due.sort_by_key(|(atom_tag, _)| *atom_tag);
        due
    }

    /// Earliest scheduled pull, if any receiver is registered.
    pub fn next_pull_time_ns(&self) -> Option<i64> {
        self.receivers
            .lock()
            .values()
            .flatten()
            .map(|info| info.next_pull_ns)
            .min()
    }
}

/// Combines atoms that agree on every non-additive field by summing their
/// additive fields. Order of first appearance is kept.
fn merge_additive(atoms: Vec<Atom>, additive_fields: &[u32]) -> Vec<Atom> {
    if additive_fields.is_empty() {
        return atoms;
    }
    let is_additive = |index: usize| {
        u32::try_from(index + 1).is_ok_and(|position| additive_fields.contains(&position))
    };
    let same_identity = |a: &Atom, b: &Atom| {
        a.attribution_chain() == b.attribution_chain()
            && a.fields().len() == b.fields().len()
            && a
                .fields()
                .iter()
                .zip(b.fields())
                .enumerate()
                .all(|(i, (x, y))| is_additive(i) || x == y)
    };

    let mut merged: Vec<Atom> = Vec::with_capacity(atoms.len());
    for atom in atoms {
        let Some(existing) = merged.iter_mut().find(|m| same_identity(m, &atom)) else {
            merged.push(atom);
            continue;
        };
        let fields: Vec<FieldValue> = existing
            .fields()
            .iter()
            .zip(atom.fields())
            .enumerate()
            .map(|(i, (x, y))| if is_additive(i) { add(x, y) } else { x.clone() })
            .collect();
        let combined = Atom::builder(existing.atom_id())
            .timestamp_ns(existing.elapsed_timestamp_ns())
            .attribution_chain(existing.attribution_chain().to_vec())
            .fields(fields)
            .build();
        if let Ok(combined) = combined {
            *existing = combined;
        }
    }
    merged
}

fn add(a: &FieldValue, b: &FieldValue) -> FieldValue {
    match (a, b) {
        (FieldValue::Int(x), FieldValue::Int(y)) => FieldValue::Int(x.saturating_add(*y)),
        (FieldValue::Long(x), FieldValue::Long(y)) => FieldValue::Long(x.saturating_add(*y)),
        (FieldValue::Float(x), FieldValue::Float(y)) => FieldValue::Float(x + y),
        _ => a.clone(),
    }
}
