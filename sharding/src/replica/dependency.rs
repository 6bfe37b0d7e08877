//! Per-key dependency tracking.
//!
//! The map records the last committed writer of every key so that a later
//! transaction touching the same key can be flagged as dependent before the
//! upstream coordinator orders it.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

/// Last-writer record for one key.
#[derive(Debug, Clone)]
pub struct TransactionDependencyInfo {
    /// The last committed write value
    pub value: Vec<u8>,
    /// The transaction that wrote it
    pub dependent_tx_id: String,
    /// When the record stops being considered by evaluation
    pub expiry_time: SystemTime,
    /// Whether that writer was itself marked dependent
    pub has_dependency: bool,
}

/// Mapping from key to the last committed writer.
///
/// Readers run concurrently; updates take the write lock per request and
/// hold it only across the overwrite. Expired records are ignored by
/// evaluation and reclaimed lazily by [`DependencyMap::sweep_expired`];
/// nothing schedules the sweep, so a bounded workload simply carries the
/// stale entries.
pub struct DependencyMap {
    entries: RwLock<HashMap<String, TransactionDependencyInfo>>,
    expiry: Duration,
}

impl DependencyMap {
    pub fn new(expiry: Duration) -> Self {
        DependencyMap {
            entries: RwLock::new(HashMap::new()),
            expiry,
        }
    }

    /// Evaluate a request against the map.
    ///
    /// Read-set keys are checked before write-set keys; within each set the
    /// keys are scanned in sorted order and the first live record wins, so
    /// every replica with the same map content reports the same dependent.
    /// Returns the dependent transaction ID, or `None` when the request is
    /// independent.
    pub fn check(
        &self,
        read_set: &BTreeMap<String, Vec<u8>>,
        write_set: &BTreeMap<String, Vec<u8>>,
    ) -> Option<String> {
        let entries = self.entries.read().unwrap();
        let now = SystemTime::now();

        for key in read_set.keys().chain(write_set.keys()) {
            if let Some(info) = entries.get(key) {
                if info.expiry_time <= now {
                    continue;
                }
                return Some(info.dependent_tx_id.clone());
            }
        }
        None
    }

    /// Overwrite the record of every written key with the committing
    /// transaction, stamping the evaluation verdict onto the new records.
    pub fn update(
        &self,
        tx_id: &str,
        write_set: &BTreeMap<String, Vec<u8>>,
        has_dependency: bool,
    ) {
        let mut entries = self.entries.write().unwrap();
        let expiry_time = SystemTime::now() + self.expiry;

        for (key, value) in write_set {
            entries.insert(
                key.clone(),
                TransactionDependencyInfo {
                    value: value.clone(),
                    dependent_tx_id: tx_id.to_string(),
                    expiry_time,
                    has_dependency,
                },
            );
        }
    }

    /// Current record for a key, if any (expired records included).
    pub fn get(&self, key: &str) -> Option<TransactionDependencyInfo> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Remove every expired record under the write lock. Returns the number
    /// of records removed.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let now = SystemTime::now();
        let before = entries.len();
        entries.retain(|_, info| info.expiry_time > now);
        before - entries.len()
    }
}
