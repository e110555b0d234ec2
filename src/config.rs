//! # Configuration
//!
//! Immutable engine configuration. One `EngineConfig` value is built up
//! front, validated once, and passed by reference into every operation;
//! nothing mutates it mid-run.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

/// Fallback staleness window in days for groups without a configured window.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 180;

/// Global settings shared by aggregation and expiration runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Format string for every timestamp the engine parses or emits.
    pub time_format: String,
    /// Name of the primary identity field in observation feeds.
    pub identity_field: String,
    /// Name of the alias-list field in observation feeds.
    pub alias_field: String,
    /// Destination name of the canonical record store.
    pub canonical_destination: String,
    /// Suffix appended to a source name to form its storage destination,
    /// e.g. source `nscan` with suffix `collection` -> `nscan_collection`.
    pub destination_suffix: String,
    /// Asset group assumed when a record carries none.
    pub default_group: String,
    /// Maximum age in whole days per asset group.
    pub group_max_age: BTreeMap<String, i64>,
    /// Maximum records per store write call.
    pub max_batch: usize,
    /// Delimiter between members of a raw multi-value field.
    pub mv_delimiter: char,
    /// Optional sentinel wrapping each member of a raw multi-value field.
    pub mv_sentinel: char,
    /// When set, the expiration run retires exactly the supplied identity
    /// list and skips the age check.
    pub force_expire: bool,
    /// Identity values matched by an externally evaluated expression; these
    /// expire regardless of age.
    pub pre_expired: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_format: "%Y-%m-%d %H:%M:%S".to_string(),
            identity_field: "ip".to_string(),
            alias_field: "ip_addresses".to_string(),
            canonical_destination: "hosts_collection".to_string(),
            destination_suffix: "collection".to_string(),
            default_group: "default".to_string(),
            group_max_age: BTreeMap::new(),
            max_batch: 1000,
            mv_delimiter: ';',
            mv_sentinel: '$',
            force_expire: false,
            pre_expired: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Check that required settings are present before any processing.
    pub fn validate(&self) -> Result<()> {
        if self.time_format.is_empty() {
            return Err(EngineError::Configuration(
                "time_format is not set".to_string(),
            ));
        }
        if self.identity_field.is_empty() {
            return Err(EngineError::Configuration(
                "identity_field is not set".to_string(),
            ));
        }
        if self.max_batch == 0 {
            return Err(EngineError::Configuration(
                "max_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the staleness window for an asset group.
    pub fn with_group_max_age(mut self, group: impl Into<String>, days: i64) -> Self {
        self.group_max_age.insert(group.into(), days);
        self
    }

    /// True when the group is configured or is the default group.
    pub fn knows_group(&self, group: &str) -> bool {
        group == self.default_group || self.group_max_age.contains_key(group)
    }

    /// Staleness window in whole days for a record's group. An absent group
    /// means the default group; a known group without a configured window
    /// falls back to the 180-day default.
    pub fn max_age_for(&self, group: Option<&str>) -> i64 {
        let group = group.unwrap_or(&self.default_group);
        self.group_max_age
            .get(group)
            .copied()
            .unwrap_or(DEFAULT_MAX_AGE_DAYS)
    }

    /// Storage destination for one source's per-source records.
    pub fn source_destination(&self, source: &str) -> String {
        format!("{}_{}", source, self.destination_suffix)
    }
}

/// Per-source settings for one aggregation run, provisioned externally.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Source name; also names the per-source timestamp field.
    pub name: String,
    /// Asset group stamped onto every record this source aggregates.
    pub asset_group: Option<String>,
    /// Allow-list of observation fields copied verbatim into the canonical
    /// record.
    pub aggregation_fields: Vec<String>,
}

impl SourceSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            asset_group: None,
            aggregation_fields: Vec::new(),
        }
    }

    pub fn with_asset_group(mut self, group: impl Into<String>) -> Self {
        self.asset_group = Some(group.into());
        self
    }

    pub fn with_aggregation_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregation_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the aggregation allow-list from a raw comma-separated value, as
    /// configuration surfaces usually deliver it.
    pub fn with_aggregation_field_list(mut self, raw: &str) -> Self {
        self.aggregation_fields = crate::utils::normalize_field_list(raw);
        self
    }
}
