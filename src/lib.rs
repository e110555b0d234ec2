//! # Hostmaster
//!
//! A host presence mastering engine: folds per-source observation feeds into
//! one canonical record per host identity, reconciles alias sets across
//! sources, and retires records whose last sighting is older than their
//! asset group's staleness window.
//!
//! The engine is storage-agnostic: all persistence goes through the
//! [`store::RecordStore`] trait, with [`store::MemoryStore`] as the reference
//! implementation. Runs are single-threaded and synchronous; callers
//! serialize runs against the same destinations.

pub mod aggregate;
pub mod alias;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod expire;
pub mod merge;
pub mod model;
pub mod store;
pub mod temporal;
pub mod utils;

// Re-export main types for convenience
pub use aggregate::{AggregationSummary, Aggregator};
pub use config::{EngineConfig, SourceSettings, DEFAULT_MAX_AGE_DAYS};
pub use error::{EngineError, Result};
pub use expire::{ExpirationSummary, Expirator};
pub use model::{CanonicalRecord, Expiry, FieldValue, SourceObservation};
pub use store::{MemoryStore, RecordStore};

use chrono::NaiveDateTime;

/// Main API for host presence mastering.
pub struct Hostmaster {
    store: Box<dyn RecordStore>,
    config: EngineConfig,
}

impl Hostmaster {
    /// Create an engine over an in-memory store, mainly for tests and
    /// examples.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    /// Create an engine over a custom store implementation.
    pub fn with_store<S>(config: EngineConfig, store: S) -> Self
    where
        S: RecordStore + 'static,
    {
        Self {
            store: Box::new(store),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store_mut(&mut self) -> &mut dyn RecordStore {
        self.store.as_mut()
    }

    /// Run one aggregation pass for a source's observation batch.
    pub fn aggregate(
        &mut self,
        settings: &SourceSettings,
        observations: &[SourceObservation],
    ) -> Result<AggregationSummary> {
        Aggregator::new(&self.config, settings).run(self.store.as_mut(), observations)
    }

    /// Run one expiration pass as of the given wall-clock time.
    pub fn expire(&mut self, now: NaiveDateTime) -> Result<ExpirationSummary> {
        Expirator::new(&self.config).run(self.store.as_mut(), now)
    }

    /// Run one expiration pass as of the current UTC time.
    pub fn expire_now(&mut self) -> Result<ExpirationSummary> {
        self.expire(chrono::Utc::now().naive_utc())
    }
}
