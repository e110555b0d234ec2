//! # Identity Set Resolver
//!
//! Keeps alias sets consistent as observations arrive claiming different
//! group memberships than what is already persisted. Reconciliation is a
//! single direct pass over this run's batch plus cached multi-alias entries;
//! it does not iterate repairs to a transitive fixed point, so a member
//! untouched by the run converges on a later run.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::cache::AggregationCache;
use crate::model::CanonicalRecord;
use crate::utils::sanitize_key;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct AliasResolution {
    /// Batch keys whose alias set changed during reconciliation.
    pub updated_batch_keys: BTreeSet<String>,
    /// Records that must be persisted even though this run's observations
    /// never touched them, keyed by record key. Their only change is the
    /// corrected alias set.
    pub existing_only: BTreeMap<String, CanonicalRecord>,
}

impl AliasResolution {
    /// Total number of records whose alias set was corrected.
    pub fn corrections(&self) -> usize {
        self.updated_batch_keys.len() + self.existing_only.len()
    }
}

fn alias_set(record: Option<&CanonicalRecord>) -> Option<BTreeSet<String>> {
    record.map(|r| r.aliases.iter().cloned().collect())
}

/// Merge a cached and an incoming alias set into the corrected membership.
///
/// Returns `None` when nothing needs to change: both sides absent, or both
/// already agree.
pub fn merge_alias_sets(
    cached: Option<&BTreeSet<String>>,
    incoming: Option<&BTreeSet<String>>,
) -> Option<Vec<String>> {
    match (cached, incoming) {
        (None, None) => None,
        (Some(c), Some(i)) if c == i => None,
        (Some(c), Some(i)) => Some(c.union(i).cloned().collect()),
        (Some(c), None) => Some(c.iter().cloned().collect()),
        (None, Some(i)) => Some(i.iter().cloned().collect()),
    }
}

/// Synchronize alias sets across the cache and this run's batch.
///
/// Candidates are keys whose alias set has more than one member on either
/// side. For each candidate whose cached and provisional sets differ, the
/// corrected set is the union of both, written through to the batch record,
/// the cache entry, and (for records not otherwise touched this run) an
/// existing-only side collection. When the cached set is not a subset of the
/// incoming one, members of the union that the batch never claims are also
/// scheduled so the corrected group membership reaches them.
pub fn resolve_alias_sets(
    cache: &mut AggregationCache,
    batch: &mut BTreeMap<String, CanonicalRecord>,
    cached_multivalue_keys: &[String],
) -> AliasResolution {
    let mut candidates: BTreeSet<String> = cached_multivalue_keys.iter().cloned().collect();
    candidates.extend(
        batch
            .iter()
            .filter(|(_, record)| record.has_multivalue_alias())
            .map(|(key, _)| key.clone()),
    );

    let mut resolution = AliasResolution::default();

    for key in candidates {
        let cached_record = cache.get(&key);
        let cached = alias_set(cached_record.as_ref());
        let incoming = alias_set(batch.get(&key));

        let Some(new_aliases) = merge_alias_sets(cached.as_ref(), incoming.as_ref()) else {
            continue;
        };

        if let Some(record) = batch.get_mut(&key) {
            if record.aliases != new_aliases {
                record.aliases = new_aliases.clone();
                resolution.updated_batch_keys.insert(key.clone());
            }
        }

        let cached_changed = cached
            .as_ref()
            .map(|c| c.iter().cloned().collect::<Vec<_>>() != new_aliases)
            .unwrap_or(false);
        if cached_changed {
            cache.update(&key, |record| record.aliases = new_aliases.clone());
            if !batch.contains_key(&key) && !resolution.existing_only.contains_key(&key) {
                if let Some(mut record) = cached_record.clone() {
                    record.aliases = new_aliases.clone();
                    resolution.existing_only.insert(key.clone(), record);
                }
            }
        }

        // Split/merge repair: when the cache claims membership the batch no
        // longer does (or vice versa), members of the union the batch never
        // touches must still learn the corrected group.
        let needs_repair = match (&cached, &incoming) {
            (Some(c), Some(i)) => !c.is_subset(i),
            _ => false,
        };
        if needs_repair {
            for member in &new_aliases {
                let Some(member_key) = sanitize_key(member) else {
                    continue;
                };
                if batch.contains_key(&member_key)
                    || resolution.existing_only.contains_key(&member_key)
                {
                    continue;
                }
                if let Some(mut member_record) = cache.get(&member_key) {
                    member_record.aliases = new_aliases.clone();
                    cache.update(&member_key, |record| record.aliases = new_aliases.clone());
                    resolution.existing_only.insert(member_key, member_record);
                }
            }
        }
    }

    debug!(
        updated_batch = resolution.updated_batch_keys.len(),
        existing_only = resolution.existing_only.len(),
        "alias reconciliation pass complete"
    );
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, aliases: &[&str]) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(key, key);
        record.aliases = aliases.iter().map(|s| s.to_string()).collect();
        record
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_alias_sets() {
        assert_eq!(merge_alias_sets(None, None), None);
        assert_eq!(
            merge_alias_sets(Some(&set(&["a", "b"])), Some(&set(&["a", "b"]))),
            None
        );
        assert_eq!(
            merge_alias_sets(Some(&set(&["a", "b"])), Some(&set(&["b", "c"]))),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(
            merge_alias_sets(Some(&set(&["b", "a"])), None),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            merge_alias_sets(None, Some(&set(&["c", "a"]))),
            Some(vec!["a".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_batch_records_converge_to_union() {
        let mut cache = AggregationCache::from_records(vec![
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2"]),
            record("2.2.2.2", &["2.2.2.2", "3.3.3.3"]),
        ]);
        let cached_keys = cache.keys_with_multivalue_alias();
        let mut batch = BTreeMap::new();
        batch.insert(
            "1.1.1.1".to_string(),
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2"]),
        );
        batch.insert(
            "2.2.2.2".to_string(),
            record("2.2.2.2", &["1.1.1.1", "2.2.2.2"]),
        );

        resolve_alias_sets(&mut cache, &mut batch, &cached_keys);

        // record 2 had cached {2,3} and incoming {1,2}: union reaches both
        assert_eq!(
            batch["2.2.2.2"].aliases,
            vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]
        );
        assert_eq!(
            cache.get("2.2.2.2").unwrap().aliases,
            vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]
        );
    }

    #[test]
    fn test_cached_only_record_scheduled_as_existing_only() {
        let mut cache = AggregationCache::from_records(vec![record(
            "1.1.1.1",
            &["1.1.1.1", "2.2.2.2"],
        )]);
        let cached_keys = cache.keys_with_multivalue_alias();
        let mut batch = BTreeMap::new();
        // this run only claims a partial group for a different key
        batch.insert(
            "2.2.2.2".to_string(),
            record("2.2.2.2", &["2.2.2.2", "3.3.3.3"]),
        );

        let resolution = resolve_alias_sets(&mut cache, &mut batch, &cached_keys);

        // cached 1.1.1.1 was never in the batch but its set stays as-is
        // (union with an absent incoming side changes nothing)
        assert!(!resolution.existing_only.contains_key("1.1.1.1"));
        assert_eq!(batch["2.2.2.2"].aliases, vec!["2.2.2.2", "3.3.3.3"]);
    }

    #[test]
    fn test_subset_repair_reaches_unclaimed_members() {
        // cached group {1,2,3}; incoming batch claims only {1,2,4} for key 1
        let mut cache = AggregationCache::from_records(vec![
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
            record("3.3.3.3", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
        ]);
        let cached_keys = cache.keys_with_multivalue_alias();
        let mut batch = BTreeMap::new();
        batch.insert(
            "1.1.1.1".to_string(),
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2", "4.4.4.4"]),
        );

        let resolution = resolve_alias_sets(&mut cache, &mut batch, &cached_keys);

        let union = vec![
            "1.1.1.1".to_string(),
            "2.2.2.2".to_string(),
            "3.3.3.3".to_string(),
            "4.4.4.4".to_string(),
        ];
        assert_eq!(batch["1.1.1.1"].aliases, union);
        // 3.3.3.3 is in the cache but not the batch: it still receives the
        // corrected membership
        let repaired = resolution.existing_only.get("3.3.3.3").unwrap();
        assert_eq!(repaired.aliases, union);
        assert_eq!(cache.get("3.3.3.3").unwrap().aliases, union);
    }

    #[test]
    fn test_incoming_superset_leaves_members_for_next_run() {
        // cached group {1,2}; the batch grows key 1's set to {1,2,3}. The
        // cached set is a subset of the incoming one, so no member repair
        // fires: cached-only member 2 keeps its old set until it is next
        // observed
        let mut cache = AggregationCache::from_records(vec![
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2"]),
            record("2.2.2.2", &["1.1.1.1", "2.2.2.2"]),
        ]);
        let cached_keys = cache.keys_with_multivalue_alias();
        let mut batch = BTreeMap::new();
        batch.insert(
            "1.1.1.1".to_string(),
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2", "3.3.3.3"]),
        );

        let resolution = resolve_alias_sets(&mut cache, &mut batch, &cached_keys);

        assert_eq!(
            batch["1.1.1.1"].aliases,
            vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]
        );
        assert!(resolution.existing_only.is_empty());
        assert_eq!(
            cache.get("2.2.2.2").unwrap().aliases,
            vec!["1.1.1.1", "2.2.2.2"]
        );
    }

    #[test]
    fn test_identical_sets_are_left_alone() {
        let mut cache = AggregationCache::from_records(vec![record(
            "1.1.1.1",
            &["1.1.1.1", "2.2.2.2"],
        )]);
        let cached_keys = cache.keys_with_multivalue_alias();
        let mut batch = BTreeMap::new();
        batch.insert(
            "1.1.1.1".to_string(),
            record("1.1.1.1", &["1.1.1.1", "2.2.2.2"]),
        );

        let resolution = resolve_alias_sets(&mut cache, &mut batch, &cached_keys);
        assert_eq!(resolution.corrections(), 0);
        assert!(resolution.updated_batch_keys.is_empty());
        assert!(resolution.existing_only.is_empty());
    }
}
