//! # Expiration
//!
//! Retires canonical records whose last sighting is older than their asset
//! group's staleness window, repairs alias sets that referenced them, and
//! cascades the retirement to the per-source record stores. Retirement is a
//! soft tombstone: the record stays queryable with `expired` carrying the
//! retirement timestamp. Hard deletion only happens on the key-reuse path
//! during aggregation.

use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::buffer::WriteBuffer;
use crate::cache::AggregationCache;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{CanonicalRecord, Expiry};
use crate::store::RecordStore;
use crate::temporal;

/// Counters reported by one expiration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirationSummary {
    /// Records retired this run.
    pub expired: usize,
    /// Records evaluated and left live.
    pub active: usize,
    /// Live records rewritten only because their alias set referenced a
    /// retiring identity.
    pub modified: usize,
    /// Records skipped as unprocessable.
    pub skipped_invalid: usize,
}

/// Why a stored record cannot be evaluated for expiration.
fn validation_error(record: &CanonicalRecord, config: &EngineConfig) -> Option<String> {
    if record.key.is_empty() {
        return Some("record has no key".to_string());
    }
    if record.identity.is_empty() {
        return Some("record has no identity value".to_string());
    }
    match temporal::parse_optional(record.last_seen.as_deref(), &config.time_format) {
        Ok(Some(_)) => {}
        Ok(None) => return Some("record has no last-seen timestamp".to_string()),
        Err(_) => {
            return Some(format!(
                "last-seen timestamp {:?} is unparseable",
                record.last_seen.as_deref().unwrap_or_default()
            ))
        }
    }
    if let Some(group) = record.asset_group.as_deref().filter(|g| !g.is_empty()) {
        if !config.knows_group(group) {
            return Some(format!("asset group {group:?} is not configured"));
        }
    }
    None
}

/// Decide whether a record is past its staleness window.
///
/// Age is day-granular: a record is expired only when strictly more whole
/// days than the group's window have elapsed, so a partial day over the
/// threshold keeps it live. Identities on the pre-expired list are retired
/// regardless of age; in forced mode that list is the entire decision and
/// the age check is skipped.
pub fn is_expired(
    record: &CanonicalRecord,
    now: NaiveDateTime,
    config: &EngineConfig,
) -> Result<bool> {
    if config.pre_expired.iter().any(|id| id == &record.identity) {
        return Ok(true);
    }
    if config.force_expire {
        return Ok(false);
    }
    let last_seen = record.last_seen.as_deref().unwrap_or_default();
    let parsed = temporal::parse_timestamp(last_seen, &config.time_format)?;
    let max_age = config.max_age_for(record.asset_group.as_deref());
    Ok(temporal::age_in_days(now, parsed) > max_age)
}

/// Remove retiring identities from the alias sets of records that stay live.
///
/// Each retiring record with a linked alias set collapses to its own
/// identity. Live records that referenced a retiring identity lose that
/// member and are returned as modified; when an entire alias group retires
/// together there is no live member left to edit, so nothing is touched.
pub fn strip_expiring_aliases(
    expiring: &mut [CanonicalRecord],
    active: &mut [CanonicalRecord],
) -> BTreeSet<String> {
    let retiring: BTreeSet<String> = expiring.iter().map(|r| r.identity.clone()).collect();

    for record in expiring.iter_mut() {
        if record.has_multivalue_alias() {
            record.collapse_aliases();
        }
    }

    let mut modified = BTreeSet::new();
    for record in active.iter_mut() {
        let before = record.aliases.len();
        record.aliases.retain(|alias| !retiring.contains(alias.as_str()));
        if record.aliases.len() != before {
            modified.insert(record.key.clone());
        }
    }
    modified
}

/// Propagate a retirement to every per-source record store that still holds
/// a row for this key. A store failure on one source is logged and that
/// source skipped; the remaining sources still get their tombstone.
fn cascade_tombstones(
    store: &mut dyn RecordStore,
    buffer: &mut WriteBuffer,
    record: &CanonicalRecord,
    stamp: &str,
    config: &EngineConfig,
) -> Result<()> {
    for source in record.source_names() {
        let destination = config.source_destination(&source);
        match store.query_by_id(&destination, &record.key) {
            Ok(Some(mut source_record)) => {
                source_record.expired = Expiry::At(stamp.to_string());
                buffer.enqueue(&destination, source_record);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    key = %record.key,
                    destination = %destination,
                    error = %err,
                    "per-source store unreachable, skipping tombstone"
                );
            }
        }
    }
    Ok(())
}

/// Hard-delete every per-source record implicated by a canonical record and
/// drop its per-source timestamp fields. Used when an expired key is reused
/// by a fresh observation and must not carry stale per-source data forward.
pub fn purge_record_sources(
    store: &mut dyn RecordStore,
    record: &mut CanonicalRecord,
    config: &EngineConfig,
) {
    for source in record.source_names() {
        let destination = config.source_destination(&source);
        match store.delete_by_id(&destination, &record.key) {
            Ok(_) => {}
            Err(err) => {
                warn!(
                    key = %record.key,
                    destination = %destination,
                    error = %err,
                    "per-source store unreachable, skipping purge"
                );
            }
        }
    }
    record.clear_sources();
}

/// One expiration pass over the canonical record store.
pub struct Expirator<'a> {
    config: &'a EngineConfig,
    run_id: String,
}

impl<'a> Expirator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            run_id: crate::utils::generate_run_id(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Evaluate every canonical record against its staleness window as of
    /// `now`, retire the stale ones, repair alias sets, cascade tombstones
    /// to the per-source stores, and write everything back.
    pub fn run(
        &self,
        store: &mut dyn RecordStore,
        now: NaiveDateTime,
    ) -> Result<ExpirationSummary> {
        self.config.validate()?;
        let cache = AggregationCache::load(store, &self.config.canonical_destination)?;
        info!(
            run_id = %self.run_id,
            records = cache.len(),
            forced = self.config.force_expire,
            "expiration run started"
        );

        let mut summary = ExpirationSummary::default();
        let mut expiring: Vec<CanonicalRecord> = Vec::new();
        let mut active: Vec<CanonicalRecord> = Vec::new();

        let mut snapshot: Vec<&CanonicalRecord> = cache.records().collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        for record in snapshot {
            if let Some(reason) = validation_error(record, self.config) {
                warn!(run_id = %self.run_id, key = %record.key, reason = %reason, "record skipped");
                summary.skipped_invalid += 1;
                continue;
            }
            if !record.expired.is_active() {
                continue;
            }
            if is_expired(record, now, self.config)? {
                expiring.push(record.clone());
            } else {
                active.push(record.clone());
            }
        }

        let modified_keys = strip_expiring_aliases(&mut expiring, &mut active);
        let stamp = temporal::format_timestamp(now, &self.config.time_format);

        let mut buffer = WriteBuffer::new(self.config.max_batch);
        for record in &mut expiring {
            record.expired = Expiry::At(stamp.clone());
            cascade_tombstones(store, &mut buffer, record, &stamp, self.config)?;
            buffer.enqueue(&self.config.canonical_destination, record.clone());
        }
        for record in active.iter().filter(|r| modified_keys.contains(&r.key)) {
            buffer.enqueue(&self.config.canonical_destination, record.clone());
        }
        buffer.flush_all(store)?;

        summary.expired = expiring.len();
        summary.active = active.len();
        summary.modified = modified_keys.len();
        info!(
            run_id = %self.run_id,
            expired = summary.expired,
            active = summary.active,
            modified = summary.modified,
            skipped = summary.skipped_invalid,
            "expiration run finished"
        );
        Ok(summary)
    }
}
