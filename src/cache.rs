//! # Aggregation Cache
//!
//! Run-scoped snapshot of the canonical record store. Loaded once at the
//! start of a run; every read during the run goes through the cache instead
//! of re-querying the store. The cache owns its records and clones only at
//! the boundary where a caller asks for a snapshot, so handed-out copies are
//! unaffected by later cache mutation.

use hashbrown::HashMap;
use tracing::debug;

use crate::error::Result;
use crate::model::CanonicalRecord;
use crate::store::RecordStore;

/// In-memory snapshot of one store destination, keyed by record key.
#[derive(Debug, Clone, Default)]
pub struct AggregationCache {
    records: HashMap<String, CanonicalRecord>,
}

impl AggregationCache {
    /// Load the full current contents of a destination.
    pub fn load(store: &dyn RecordStore, destination: &str) -> Result<Self> {
        let rows = store.query(destination)?;
        let mut records = HashMap::with_capacity(rows.len());
        for row in rows {
            records.insert(row.key.clone(), row);
        }
        debug!(destination, size = records.len(), "aggregation cache loaded");
        Ok(Self { records })
    }

    /// Build a cache directly from records (used by expiration, which works
    /// on the same snapshot shape).
    pub fn from_records(rows: Vec<CanonicalRecord>) -> Self {
        let mut records = HashMap::with_capacity(rows.len());
        for row in rows {
            records.insert(row.key.clone(), row);
        }
        Self { records }
    }

    /// Owned copy of the record under `key`, if cached.
    pub fn get(&self, key: &str) -> Option<CanonicalRecord> {
        self.records.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Mutate the cached record under `key` in place, if present.
    pub fn update<F>(&mut self, key: &str, f: F)
    where
        F: FnOnce(&mut CanonicalRecord),
    {
        if let Some(record) = self.records.get_mut(key) {
            f(record);
        }
    }

    /// Drop a record from the cache (key-reuse purge path).
    pub fn remove(&mut self, key: &str) -> Option<CanonicalRecord> {
        self.records.remove(key)
    }

    /// Keys whose alias set links more than one identity value.
    pub fn keys_with_multivalue_alias(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, record)| record.has_multivalue_alias())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Iterate the cached records.
    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(key: &str, aliases: &[&str]) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(key, key);
        record.aliases = aliases.iter().map(|s| s.to_string()).collect();
        record
    }

    #[test]
    fn test_load_snapshots_destination() {
        let mut store = MemoryStore::with_destinations(["hosts_collection"]);
        store
            .batch_save(
                "hosts_collection",
                vec![record("1.1.1.1", &["1.1.1.1"]), record("2.2.2.2", &["2.2.2.2"])],
            )
            .unwrap();
        let cache = AggregationCache::load(&store, "hosts_collection").unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("1.1.1.1"));
    }

    #[test]
    fn test_get_returns_independent_copy() {
        let mut cache =
            AggregationCache::from_records(vec![record("1.1.1.1", &["1.1.1.1", "2.2.2.2"])]);
        let snapshot = cache.get("1.1.1.1").unwrap();
        cache.update("1.1.1.1", |r| r.aliases = vec!["1.1.1.1".to_string()]);
        // the copy handed out earlier is unchanged
        assert_eq!(snapshot.aliases.len(), 2);
        assert_eq!(cache.get("1.1.1.1").unwrap().aliases.len(), 1);
    }

    #[test]
    fn test_keys_with_multivalue_alias() {
        let cache = AggregationCache::from_records(vec![
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2"]),
            record("3.3.3.3", &["3.3.3.3"]),
        ]);
        assert_eq!(
            cache.keys_with_multivalue_alias(),
            vec!["1.1.1.1".to_string()]
        );
    }

    #[test]
    fn test_update_missing_key_is_noop() {
        let mut cache = AggregationCache::default();
        cache.update("9.9.9.9", |r| r.asset_group = Some("dmz".to_string()));
        assert!(cache.is_empty());
    }
}
