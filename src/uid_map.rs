//! Uid → package mapping and isolated-uid resolution.
//!
//! Dimension projection resolves attribution uids through
//! [`UidMap::host_uid_or_self`] so work done in isolated processes is
//! attributed to the owning app.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Default number of removed apps kept for reporting.
pub const DEFAULT_MAX_DELETED_APPS: usize = 100;

/// One installed package as reported by the package manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UidMapEntry {
    pub uid: i32,
    pub package: String,
    pub version: i64,
    #[serde(default)]
    pub version_string: String,
    #[serde(default)]
    pub installer: String,
}

/// Snapshot row of the uid map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageInfo {
    pub uid: i32,
    pub package: String,
    pub version: i64,
    pub version_string: String,
    pub installer: String,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
struct AppData {
    version: i64,
    version_string: String,
    installer: String,
    deleted: bool,
}

#[derive(Debug)]
pub struct UidMap {
    apps: BTreeMap<(i32, String), AppData>,
    isolated: HashMap<i32, i32>,
    /// Removed apps in removal order; bounded by `max_deleted_apps`.
    deleted_apps: VecDeque<(i32, String)>,
    max_deleted_apps: usize,
    last_update_ns: i64,
}

impl Default for UidMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELETED_APPS)
    }
}

impl UidMap {
    pub fn new(max_deleted_apps: usize) -> Self {
        Self {
            apps: BTreeMap::new(),
            isolated: HashMap::new(),
            deleted_apps: VecDeque::new(),
            max_deleted_apps,
            last_update_ns: 0,
        }
    }

    /// Replaces the whole map with a fresh package listing.
    pub fn update_map(&mut self, timestamp_ns: i64, entries: Vec<UidMapEntry>) {
        self.apps.clear();
        self.deleted_apps.clear();
        for entry in entries {
            self.apps.insert(
                (entry.uid, entry.package),
                AppData {
                    version: entry.version,
                    version_string: entry.version_string,
                    installer: entry.installer,
                    deleted: false,
                },
            );
        }
        self.last_update_ns = timestamp_ns;
        tracing::debug!("Uid map replaced with {} packages", self.apps.len());
    }

    /// Installs or upgrades a single package.
    pub fn update_app(
        &mut self,
        timestamp_ns: i64,
        package: &str,
        uid: i32,
        version: i64,
        version_string: &str,
        installer: &str,
    ) {
        let key = (uid, package.to_string());
        self.deleted_apps.retain(|k| k != &key);
        self.apps.insert(
            key,
            AppData {
                version,
                version_string: version_string.to_string(),
                installer: installer.to_string(),
                deleted: false,
            },
        );
        self.last_update_ns = timestamp_ns;
    }

    /// Marks a package as removed. Removed packages stay visible in
    /// snapshots until the deleted-app guardrail evicts them.
    pub fn remove_app(&mut self, timestamp_ns: i64, package: &str, uid: i32) {
        let key = (uid, package.to_string());
        let Some(app) = self.apps.get_mut(&key) else {
            return;
        };
        if app.deleted {
            return;
        }
        app.deleted = true;
        self.deleted_apps.push_back(key);
        while self.deleted_apps.len() > self.max_deleted_apps {
            if let Some(oldest) = self.deleted_apps.pop_front() {
                self.apps.remove(&oldest);
            }
        }
        self.last_update_ns = timestamp_ns;
    }

    pub fn has_app(&self, uid: i32, package: &str) -> bool {
        self.apps
            .get(&(uid, package.to_string()))
            .is_some_and(|app| !app.deleted)
    }

    /// Installed package names for a uid, lowercased when `normalize` is set.
    pub fn app_names_for_uid(&self, uid: i32, normalize: bool) -> Vec<String> {
        self.apps
            .range((uid, String::new())..)
            .take_while(|((u, _), _)| *u == uid)
            .filter(|(_, app)| !app.deleted)
            .map(|((_, name), _)| if normalize { name.to_lowercase() } else { name.clone() })
            .collect()
    }

    /// Version of an installed package, 0 when unknown.
    pub fn app_version(&self, uid: i32, package: &str) -> i64 {
        self.apps
            .get(&(uid, package.to_string()))
            .filter(|app| !app.deleted)
            .map_or(0, |app| app.version)
    }

    pub fn assign_isolated_uid(&mut self, isolated_uid: i32, parent_uid: i32) {
        self.isolated.insert(isolated_uid, parent_uid);
    }

    pub fn remove_isolated_uid(&mut self, isolated_uid: i32) {
        self.isolated.remove(&isolated_uid);
    }

    /// Parent uid for isolated uids, the uid itself otherwise.
    pub fn host_uid_or_self(&self, uid: i32) -> i32 {
        self.isolated.get(&uid).copied().unwrap_or(uid)
    }

    pub fn last_update_ns(&self) -> i64 {
        self.last_update_ns
    }

    pub fn snapshot(&self) -> Vec<PackageInfo> {
        self.apps
            .iter()
            .map(|((uid, package), app)| PackageInfo {
                uid: *uid,
                package: package.clone(),
                version: app.version,
                version_string: app.version_string.clone(),
                installer: app.installer.clone(),
                deleted: app.deleted,
            })
            .collect()
    }
}
