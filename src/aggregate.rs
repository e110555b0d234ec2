//! # Aggregation Run
//!
//! Folds one source's observation batch into the canonical record store:
//! validate each observation, merge its timestamps into the provisional
//! record, copy allow-listed fields, reconcile alias sets across the batch
//! and the cached store contents, then write everything back through the
//! batched buffer.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::alias;
use crate::buffer::WriteBuffer;
use crate::cache::AggregationCache;
use crate::config::{EngineConfig, SourceSettings};
use crate::error::Result;
use crate::expire::purge_record_sources;
use crate::merge;
use crate::model::{CanonicalRecord, Expiry, SourceObservation};
use crate::store::RecordStore;
use crate::utils::{parse_multivalue, sanitize_key};

/// Counters reported by one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationSummary {
    /// Observations folded into canonical records.
    pub aggregated: usize,
    /// Observations skipped as unprocessable.
    pub skipped_invalid: usize,
    /// Records whose alias set was corrected during reconciliation.
    pub alias_updates: usize,
}

/// Why an observation cannot be aggregated.
fn validation_error(observation: &SourceObservation) -> Option<&'static str> {
    if observation.identity.is_empty() {
        return Some("observation has no identity value");
    }
    if observation
        .expired
        .as_deref()
        .filter(|v| !v.is_empty())
        .is_none()
    {
        return Some("observation has no expiration flag");
    }
    if observation
        .last_seen
        .as_deref()
        .filter(|v| !v.is_empty())
        .is_none()
    {
        return Some("observation has no last-seen timestamp");
    }
    None
}

/// One aggregation pass folding a source's observations into the canonical
/// store.
pub struct Aggregator<'a> {
    config: &'a EngineConfig,
    settings: &'a SourceSettings,
    run_id: String,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a EngineConfig, settings: &'a SourceSettings) -> Self {
        Self {
            config,
            settings,
            run_id: crate::utils::generate_run_id(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Aggregate a batch of observations in input order and write the
    /// resulting records back through the store.
    pub fn run(
        &self,
        store: &mut dyn RecordStore,
        observations: &[SourceObservation],
    ) -> Result<AggregationSummary> {
        self.config.validate()?;
        let mut cache = AggregationCache::load(store, &self.config.canonical_destination)?;
        let cached_multivalue_keys = cache.keys_with_multivalue_alias();
        info!(
            run_id = %self.run_id,
            source = %self.settings.name,
            observations = observations.len(),
            cached = cache.len(),
            "aggregation run started"
        );

        let mut summary = AggregationSummary::default();
        let mut batch: BTreeMap<String, CanonicalRecord> = BTreeMap::new();

        for observation in observations {
            if let Some(reason) = validation_error(observation) {
                warn!(
                    run_id = %self.run_id,
                    identity = %observation.identity,
                    reason,
                    "observation skipped"
                );
                summary.skipped_invalid += 1;
                continue;
            }
            let Some(key) = sanitize_key(&observation.identity) else {
                summary.skipped_invalid += 1;
                continue;
            };

            match self.fold(store, &mut cache, &mut batch, &key, observation) {
                Ok(()) => {}
                Err(err) if err.is_item_error() => {
                    warn!(
                        run_id = %self.run_id,
                        identity = %observation.identity,
                        error = %err,
                        "observation skipped"
                    );
                    summary.skipped_invalid += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let resolution = alias::resolve_alias_sets(&mut cache, &mut batch, &cached_multivalue_keys);
        summary.alias_updates = resolution.corrections();
        summary.aggregated = batch.len();

        let mut buffer = WriteBuffer::new(self.config.max_batch);
        buffer.enqueue_all(
            &self.config.canonical_destination,
            resolution.existing_only.into_values(),
        );
        buffer.enqueue_all(&self.config.canonical_destination, batch.into_values());
        buffer.flush_all(store)?;

        info!(
            run_id = %self.run_id,
            source = %self.settings.name,
            aggregated = summary.aggregated,
            skipped = summary.skipped_invalid,
            alias_updates = summary.alias_updates,
            "aggregation run finished"
        );
        Ok(summary)
    }

    /// Fold one validated observation into the provisional record for `key`.
    fn fold(
        &self,
        store: &mut dyn RecordStore,
        cache: &mut AggregationCache,
        batch: &mut BTreeMap<String, CanonicalRecord>,
        key: &str,
        observation: &SourceObservation,
    ) -> Result<()> {
        let mut record = match batch.get(key) {
            Some(provisional) => provisional.clone(),
            None => match cache.get(key) {
                Some(mut cached) => {
                    if !cached.expired.is_active() {
                        // the key is being reused after retirement: stale
                        // per-source data must not leak into the new lifecycle
                        info!(
                            run_id = %self.run_id,
                            key,
                            "expired key reused, purging prior lifecycle"
                        );
                        purge_record_sources(store, &mut cached, self.config);
                        cache.remove(key);
                        CanonicalRecord::new(key, observation.identity.clone())
                    } else {
                        cached
                    }
                }
                None => CanonicalRecord::new(key, observation.identity.clone()),
            },
        };

        let existing = if record.first_seen.is_some() {
            Some(&record)
        } else {
            None
        };
        let update = merge::merge_timestamps(
            existing,
            observation.last_seen.as_deref(),
            &self.settings.name,
            self.config,
        )?;
        update.apply(&mut record, &self.settings.name);

        let fields = merge::extract_aggregation_fields(observation, self.settings, self.config);
        record.extra.extend(fields);

        if let Some(group) = &self.settings.asset_group {
            record.asset_group = Some(group.clone());
        }
        // the feed's expired flag is carried through as reported, not reset
        record.expired = observation
            .expired
            .clone()
            .map(Expiry::from)
            .unwrap_or_default();

        if let Some(raw) = observation.aliases_raw.as_deref() {
            if let Some(values) =
                parse_multivalue(raw, self.config.mv_delimiter, self.config.mv_sentinel)
            {
                let mut aliases: BTreeSet<String> = values.into_iter().collect();
                aliases.insert(observation.identity.clone());
                record.aliases = aliases.into_iter().collect();
            }
        }

        batch.insert(key.to_string(), record);
        Ok(())
    }
}
