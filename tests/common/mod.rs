//! Common test utilities and fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use atomd_lib::core::config::EngineConfig;
use atomd_lib::core::{Atom, ConfigKey, FieldType, Result};
use atomd_lib::engine::{StatsConfig, StatsEngine};
use atomd_lib::puller::PullAtomCallback;
use atomd_lib::schema::{atom_ids, AtomSchema, SchemaRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const SEC: i64 = 1_000_000_000;

/// Atom id of the test-only `LabelReported { label: string, value: int }`.
pub const LABEL_REPORTED: i32 = 100_001;

pub const KEY: ConfigKey = ConfigKey { uid: 1000, id: 1 };

/// Built-in schemas plus [`LABEL_REPORTED`].
pub fn schemas() -> SchemaRegistry {
    let mut registry = SchemaRegistry::with_builtin_atoms();
    registry.register(AtomSchema::new(
        LABEL_REPORTED,
        "LabelReported",
        vec![FieldType::String, FieldType::Int],
    ));
    registry
}

pub fn engine() -> StatsEngine {
    StatsEngine::new(EngineConfig::default(), schemas())
}

/// Engine with `yaml` installed under [`KEY`] at time base 0.
pub fn engine_with(yaml: &str) -> StatsEngine {
    let engine = engine();
    engine.upload(KEY, &stats_config(yaml), 0).unwrap();
    engine
}

pub fn stats_config(yaml: &str) -> StatsConfig {
    StatsConfig::from_yaml(yaml).unwrap()
}

pub fn label(ts: i64, label: &str) -> Atom {
    Atom::builder(LABEL_REPORTED)
        .timestamp_ns(ts)
        .string(label)
        .int(1)
        .build()
        .unwrap()
}

pub fn crumb(ts: i64, label: i32, state: i32) -> Atom {
    Atom::builder(atom_ids::APP_BREADCRUMB_REPORTED)
        .timestamp_ns(ts)
        .int(1000)
        .int(label)
        .enumeration(state)
        .build()
        .unwrap()
}

pub fn wakelock(ts: i64, tag: &str, state: i32) -> Atom {
    Atom::builder(atom_ids::WAKELOCK_STATE_CHANGED)
        .timestamp_ns(ts)
        .attribution(1000, "system")
        .enumeration(1)
        .string(tag)
        .enumeration(state)
        .build()
        .unwrap()
}

pub fn process_memory(uid: i32, process: &str, rss_bytes: i64) -> Atom {
    Atom::builder(atom_ids::PROCESS_MEMORY_STATE)
        .int(uid)
        .string(process)
        .long(0)
        .long(0)
        .long(rss_bytes)
        .build()
        .unwrap()
}

/// Pull callback returning a fixed set of atoms and counting its calls.
pub struct StaticPuller {
    atoms: Mutex<Vec<Atom>>,
    calls: AtomicUsize,
}

impl StaticPuller {
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self {
            atoms: Mutex::new(atoms),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_atoms(&self, atoms: Vec<Atom>) {
        *self.atoms.lock().unwrap() = atoms;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PullAtomCallback for StaticPuller {
    async fn on_pull_atom(&self, _atom_tag: i32) -> Result<Vec<Atom>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.atoms.lock().unwrap().clone())
    }
}

/// Asserts the per-dimension totals of a count metric.
#[macro_export]
macro_rules! assert_count_totals {
    ($report:expr, $metric_id:expr, { $($dim:expr => $count:expr),* $(,)? }) => {{
        let totals = $report
            .metric($metric_id)
            .expect("metric missing from report")
            .count_totals();
        let expected: std::collections::BTreeMap<String, i64> =
            [$(($dim.to_string(), $count)),*].into_iter().collect();
        pretty_assertions::assert_eq!(totals, expected);
    }};
}
