//! # Store Module
//!
//! The persistence contract the engine writes through. A store is addressed
//! by destination name and exposes a small key-value record surface;
//! everything beyond this contract (indexes, durability, transport) belongs
//! to the collaborator behind the trait.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::CanonicalRecord;

/// Destination-addressed record store.
///
/// `batch_save` has upsert semantics with last-write-wins per key within the
/// batch, which is what makes external retries of a run safe.
pub trait RecordStore {
    /// Return all records in a destination.
    fn query(&self, destination: &str) -> Result<Vec<CanonicalRecord>>;

    /// Return the record with the given key, if present.
    fn query_by_id(&self, destination: &str, key: &str) -> Result<Option<CanonicalRecord>>;

    /// Insert a new record. Fails if the key already exists.
    fn insert(&mut self, destination: &str, record: CanonicalRecord) -> Result<()>;

    /// Replace the record under `key` with the given payload.
    fn update(&mut self, destination: &str, key: &str, record: CanonicalRecord) -> Result<()>;

    /// Delete a record by key. Returns whether a record was removed.
    fn delete_by_id(&mut self, destination: &str, key: &str) -> Result<bool>;

    /// Upsert a batch of records, last write wins per key.
    fn batch_save(&mut self, destination: &str, records: Vec<CanonicalRecord>) -> Result<()>;
}

/// In-memory `RecordStore` used as the reference implementation and test
/// double. Destinations must be created before they can be read; writes to
/// an unknown destination fail the way a missing collection would.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    destinations: BTreeMap<String, BTreeMap<String, CanonicalRecord>>,
    failing: BTreeSet<String>,
    /// Count of `batch_save` calls per destination, for write-path tests.
    batch_calls: BTreeMap<String, Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given destinations pre-provisioned.
    pub fn with_destinations<I, S>(destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = Self::default();
        for destination in destinations {
            store.destinations.insert(destination.into(), BTreeMap::new());
        }
        store
    }

    /// Provision an empty destination.
    pub fn create_destination(&mut self, destination: impl Into<String>) {
        self.destinations.entry(destination.into()).or_default();
    }

    /// Make every access to a destination fail, simulating a lost backend.
    pub fn set_failing(&mut self, destination: impl Into<String>) {
        self.failing.insert(destination.into());
    }

    /// Sizes of the batches written to a destination, in call order.
    pub fn batch_sizes(&self, destination: &str) -> &[usize] {
        self.batch_calls
            .get(destination)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn dest(&self, destination: &str) -> Result<&BTreeMap<String, CanonicalRecord>> {
        if self.failing.contains(destination) {
            return Err(anyhow!("destination {destination} is unreachable"));
        }
        self.destinations
            .get(destination)
            .ok_or_else(|| anyhow!("unknown destination {destination}"))
    }

    fn dest_mut(&mut self, destination: &str) -> Result<&mut BTreeMap<String, CanonicalRecord>> {
        if self.failing.contains(destination) {
            return Err(anyhow!("destination {destination} is unreachable"));
        }
        self.destinations
            .get_mut(destination)
            .ok_or_else(|| anyhow!("unknown destination {destination}"))
    }
}

impl RecordStore for MemoryStore {
    fn query(&self, destination: &str) -> Result<Vec<CanonicalRecord>> {
        Ok(self.dest(destination)?.values().cloned().collect())
    }

    fn query_by_id(&self, destination: &str, key: &str) -> Result<Option<CanonicalRecord>> {
        Ok(self.dest(destination)?.get(key).cloned())
    }

    fn insert(&mut self, destination: &str, record: CanonicalRecord) -> Result<()> {
        let dest = self.dest_mut(destination)?;
        if dest.contains_key(&record.key) {
            return Err(anyhow!(
                "key {} already exists in {destination}",
                record.key
            ));
        }
        dest.insert(record.key.clone(), record);
        Ok(())
    }

    fn update(&mut self, destination: &str, key: &str, record: CanonicalRecord) -> Result<()> {
        let dest = self.dest_mut(destination)?;
        if !dest.contains_key(key) {
            return Err(anyhow!("key {key} not found in {destination}"));
        }
        dest.insert(key.to_string(), record);
        Ok(())
    }

    fn delete_by_id(&mut self, destination: &str, key: &str) -> Result<bool> {
        Ok(self.dest_mut(destination)?.remove(key).is_some())
    }

    fn batch_save(&mut self, destination: &str, records: Vec<CanonicalRecord>) -> Result<()> {
        let count = records.len();
        let dest = self.dest_mut(destination)?;
        for record in records {
            dest.insert(record.key.clone(), record);
        }
        self.batch_calls
            .entry(destination.to_string())
            .or_default()
            .push(count);
        Ok(())
    }
}
