//! # Data Model
//!
//! Core data structures for host presence mastering: the canonical per-host
//! record, the transient per-source observation, and the small value types
//! they share.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Expiration state of a record.
///
/// The persisted form is a string: the sentinel `"false"` for a live record,
/// otherwise the timestamp at which the record was retired. Carrying the
/// timestamp makes the field both a flag and an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Expiry {
    /// The record is live.
    Active,
    /// The record was retired at the contained timestamp.
    At(String),
}

impl Expiry {
    pub fn is_active(&self) -> bool {
        matches!(self, Expiry::Active)
    }

    /// The retirement timestamp, if any.
    pub fn stamp(&self) -> Option<&str> {
        match self {
            Expiry::Active => None,
            Expiry::At(ts) => Some(ts),
        }
    }
}

impl Default for Expiry {
    fn default() -> Self {
        Expiry::Active
    }
}

impl From<String> for Expiry {
    fn from(value: String) -> Self {
        if value.is_empty() || value == "false" {
            Expiry::Active
        } else {
            Expiry::At(value)
        }
    }
}

impl From<Expiry> for String {
    fn from(value: Expiry) -> Self {
        match value {
            Expiry::Active => "false".to_string(),
            Expiry::At(ts) => ts,
        }
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Active => write!(f, "false"),
            Expiry::At(ts) => write!(f, "{}", ts),
        }
    }
}

/// An aggregation-field value copied verbatim from an observation.
///
/// `Empty` is an explicit null: an allow-listed field that the observation
/// did not carry is recorded as absent rather than dropped, so the stored
/// record keeps the full allow-list schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Empty,
    Single(String),
    Multi(Vec<String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Empty)
    }
}

/// The merged, persisted, per-identity aggregation result.
///
/// One live record exists per `key` at a time. `key` is the storage-safe
/// form of `identity` and is immutable once assigned; `identity` keeps the
/// original escaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Storage key uniquely naming this record's lifecycle.
    #[serde(rename = "_key")]
    pub key: String,
    /// Human-meaningful identity value (e.g. an address).
    pub identity: String,
    /// Identity values considered interchangeable with this host, sorted,
    /// including this record's own identity.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Earliest observation timestamp across all sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
    /// Latest observation timestamp across all sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    /// Per-source last-seen timestamps, keyed by source name.
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
    /// Classification selecting the staleness threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_group: Option<String>,
    /// Expiration state; `"false"` on the wire while live.
    #[serde(default)]
    pub expired: Expiry,
    /// Allow-listed aggregation fields copied from observations.
    #[serde(default)]
    pub extra: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    /// Create a fresh record for an identity, aliased only to itself.
    pub fn new(key: impl Into<String>, identity: impl Into<String>) -> Self {
        let key = key.into();
        let identity = identity.into();
        Self {
            key,
            aliases: vec![identity.clone()],
            identity,
            first_seen: None,
            last_seen: None,
            sources: BTreeMap::new(),
            asset_group: None,
            expired: Expiry::Active,
            extra: BTreeMap::new(),
        }
    }

    /// True when the alias set links this record to at least one other
    /// identity value.
    pub fn has_multivalue_alias(&self) -> bool {
        self.aliases.len() > 1
    }

    /// Names of the sources that have contributed a non-empty last-seen
    /// timestamp to this record.
    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|(_, ts)| !ts.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop all per-source timestamp fields. Used when a previously expired
    /// key is reused and must not carry stale per-source data forward.
    pub fn clear_sources(&mut self) {
        self.sources.clear();
    }

    /// Collapse the alias set to this record's own identity.
    pub fn collapse_aliases(&mut self) {
        self.aliases = vec![self.identity.clone()];
    }
}

/// One reported row from one observation source. Transient; validated and
/// folded into a `CanonicalRecord` during an aggregation run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceObservation {
    /// Identity value reported by the source.
    pub identity: String,
    /// Raw delimited alias-list value, if the source reports one.
    #[serde(default)]
    pub aliases_raw: Option<String>,
    /// Expiration flag as reported; required by validation.
    #[serde(default)]
    pub expired: Option<String>,
    /// Last-seen timestamp in the configured format; required by validation.
    #[serde(default)]
    pub last_seen: Option<String>,
    /// Named extra fields. A `__mv_`-prefixed variant of a field name carries
    /// the delimited multi-value form and wins over the scalar form.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Prefix marking the multi-value serialization of a field.
pub const MV_FIELD_PREFIX: &str = "__mv_";

impl SourceObservation {
    /// Create an observation with the required fields set.
    pub fn new(identity: impl Into<String>, last_seen: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            aliases_raw: None,
            expired: Some("false".to_string()),
            last_seen: Some(last_seen.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a raw alias-list value.
    pub fn with_aliases_raw(mut self, raw: impl Into<String>) -> Self {
        self.aliases_raw = Some(raw.into());
        self
    }

    /// Attach a named extra field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Mark the observation with an explicit expiration flag value.
    pub fn with_expired(mut self, expired: impl Into<String>) -> Self {
        self.expired = Some(expired.into());
        self
    }

    /// Get the multi-value form of a field, falling back to the scalar form.
    pub fn field_raw(&self, name: &str) -> Option<(&str, bool)> {
        let mv_name = format!("{}{}", MV_FIELD_PREFIX, name);
        if let Some(raw) = self.fields.get(&mv_name) {
            if !raw.is_empty() {
                return Some((raw.as_str(), true));
            }
        }
        self.fields
            .get(name)
            .filter(|v| !v.is_empty())
            .map(|v| (v.as_str(), false))
    }
}
