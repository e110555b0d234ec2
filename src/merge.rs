//! # Timestamp Merger
//!
//! Computes the first/last-seen updates one observation implies for one
//! canonical record, plus the verbatim copy of allow-listed aggregation
//! fields. Only fields that actually change are returned, so downstream
//! dirty-tracking can tell "no update needed" apart from "set to the same
//! value".

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::{EngineConfig, SourceSettings};
use crate::error::{EngineError, Result};
use crate::model::{CanonicalRecord, FieldValue, SourceObservation};
use crate::temporal;
use crate::utils::parse_multivalue;

/// The subset of timestamp fields an observation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampUpdate {
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    /// New value for the observing source's per-source field.
    pub source_last_seen: Option<String>,
}

impl TimestampUpdate {
    /// True when the observation required no timestamp changes.
    pub fn is_empty(&self) -> bool {
        self.first_seen.is_none() && self.last_seen.is_none() && self.source_last_seen.is_none()
    }

    /// Fold the changed fields into a record.
    pub fn apply(&self, record: &mut CanonicalRecord, source: &str) {
        if let Some(first) = &self.first_seen {
            record.first_seen = Some(first.clone());
        }
        if let Some(last) = &self.last_seen {
            record.last_seen = Some(last.clone());
        }
        if let Some(source_last) = &self.source_last_seen {
            record
                .sources
                .insert(source.to_string(), source_last.clone());
        }
    }
}

/// Parse a stored timestamp, treating a malformed value as absent.
///
/// A record already in the store with a bad timestamp must not poison the
/// run; it simply loses the comparison and gets overwritten.
fn parse_stored(value: Option<&str>, format: &str) -> Option<NaiveDateTime> {
    let value = value.filter(|v| !v.is_empty())?;
    match temporal::parse_timestamp(value, format) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(value, format, "stored timestamp unparseable, treating as absent");
            None
        }
    }
}

/// Compute the timestamp updates one observation implies.
///
/// The observation's last-seen timestamp is required and must parse with the
/// configured format; either failure rejects the whole observation. With no
/// existing record, all three fields initialize to the observation
/// timestamp. Otherwise `last_seen` and the per-source field only move
/// forward and `first_seen` only moves backward.
pub fn merge_timestamps(
    existing: Option<&CanonicalRecord>,
    observation_ts: Option<&str>,
    source: &str,
    config: &EngineConfig,
) -> Result<TimestampUpdate> {
    let observation_ts = match observation_ts.filter(|v| !v.is_empty()) {
        Some(ts) => ts,
        None => {
            return Err(EngineError::Validation(
                "observation missing last-seen timestamp".to_string(),
            ))
        }
    };
    let observed = temporal::parse_timestamp(observation_ts, &config.time_format)?;

    let Some(existing) = existing else {
        return Ok(TimestampUpdate {
            first_seen: Some(observation_ts.to_string()),
            last_seen: Some(observation_ts.to_string()),
            source_last_seen: Some(observation_ts.to_string()),
        });
    };

    let existing_first = parse_stored(existing.first_seen.as_deref(), &config.time_format);
    let existing_last = parse_stored(existing.last_seen.as_deref(), &config.time_format);
    let existing_source = parse_stored(
        existing.sources.get(source).map(String::as_str),
        &config.time_format,
    );

    let mut update = TimestampUpdate::default();
    if existing_last.map_or(true, |last| observed > last) {
        update.last_seen = Some(observation_ts.to_string());
    }
    if existing_first.map_or(true, |first| observed < first) {
        update.first_seen = Some(observation_ts.to_string());
    }
    if existing_source.map_or(true, |source_last| observed > source_last) {
        update.source_last_seen = Some(observation_ts.to_string());
    }
    Ok(update)
}

/// Copy allow-listed aggregation fields out of an observation.
///
/// The multi-value form of a field wins over the scalar form; an
/// allow-listed field the observation lacks maps to an explicit
/// `FieldValue::Empty`. The alias field is excluded even if allow-listed, to
/// guard against misconfiguration clobbering the reconciled alias set.
pub fn extract_aggregation_fields(
    observation: &SourceObservation,
    settings: &SourceSettings,
    config: &EngineConfig,
) -> BTreeMap<String, FieldValue> {
    let mut output = BTreeMap::new();
    for field in &settings.aggregation_fields {
        if field == &config.alias_field {
            continue;
        }
        let value = match observation.field_raw(field) {
            Some((raw, true)) => match parse_multivalue(raw, config.mv_delimiter, config.mv_sentinel)
            {
                Some(values) => FieldValue::Multi(values),
                None => FieldValue::Empty,
            },
            Some((raw, false)) => FieldValue::Single(raw.to_string()),
            None => FieldValue::Empty,
        };
        output.insert(field.clone(), value);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn existing(first: &str, last: &str, source_last: Option<&str>) -> CanonicalRecord {
        let mut record = CanonicalRecord::new("1.1.1.1", "1.1.1.1");
        record.first_seen = Some(first.to_string());
        record.last_seen = Some(last.to_string());
        if let Some(ts) = source_last {
            record.sources.insert("nscan".to_string(), ts.to_string());
        }
        record
    }

    #[test]
    fn test_new_record_initializes_all_fields() {
        let update =
            merge_timestamps(None, Some("2020-01-01 00:00:00"), "nscan", &config()).unwrap();
        assert_eq!(update.first_seen.as_deref(), Some("2020-01-01 00:00:00"));
        assert_eq!(update.last_seen.as_deref(), Some("2020-01-01 00:00:00"));
        assert_eq!(
            update.source_last_seen.as_deref(),
            Some("2020-01-01 00:00:00")
        );
    }

    #[test]
    fn test_newer_observation_advances_last_and_source() {
        let record = existing(
            "2020-01-01 00:00:00",
            "2020-02-01 00:00:00",
            Some("2020-02-01 00:00:00"),
        );
        let update = merge_timestamps(
            Some(&record),
            Some("2020-03-01 00:00:00"),
            "nscan",
            &config(),
        )
        .unwrap();
        assert_eq!(update.last_seen.as_deref(), Some("2020-03-01 00:00:00"));
        assert_eq!(
            update.source_last_seen.as_deref(),
            Some("2020-03-01 00:00:00")
        );
        assert!(update.first_seen.is_none());
    }

    #[test]
    fn test_intermediate_observation_updates_source_only() {
        let record = existing(
            "2020-01-01 00:00:00",
            "2020-01-01 00:00:00",
            Some("2020-01-05 00:00:00"),
        );
        let update = merge_timestamps(
            Some(&record),
            Some("2020-01-08 00:00:00"),
            "nscan",
            &config(),
        )
        .unwrap();
        assert_eq!(update.last_seen.as_deref(), Some("2020-01-08 00:00:00"));
        assert_eq!(
            update.source_last_seen.as_deref(),
            Some("2020-01-08 00:00:00")
        );
    }

    #[test]
    fn test_older_observation_changes_nothing() {
        let record = existing(
            "2020-01-01 00:00:00",
            "2020-01-01 00:00:00",
            Some("2020-01-05 00:00:00"),
        );
        let update = merge_timestamps(
            Some(&record),
            Some("2019-12-25 00:00:00"),
            "nscan",
            &config(),
        )
        .unwrap();
        // older than first_seen, so it becomes the new first_seen only
        assert_eq!(update.first_seen.as_deref(), Some("2019-12-25 00:00:00"));
        assert!(update.last_seen.is_none());
        assert!(update.source_last_seen.is_none());
    }

    #[test]
    fn test_equal_observation_is_empty_update() {
        let record = existing(
            "2020-01-01 00:00:00",
            "2020-01-01 00:00:00",
            Some("2020-01-01 00:00:00"),
        );
        let update = merge_timestamps(
            Some(&record),
            Some("2020-01-01 00:00:00"),
            "nscan",
            &config(),
        )
        .unwrap();
        assert!(update.is_empty());
    }

    #[test]
    fn test_missing_timestamp_is_validation_error() {
        let err = merge_timestamps(None, None, "nscan", &config()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = merge_timestamps(None, Some(""), "nscan", &config()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_unparseable_timestamp_is_time_parse_error() {
        let err = merge_timestamps(None, Some("01/02/2020"), "nscan", &config()).unwrap_err();
        assert!(matches!(err, EngineError::TimeParse { .. }));
    }

    #[test]
    fn test_apply_writes_only_changed_fields() {
        let mut record = existing(
            "2020-01-01 00:00:00",
            "2020-02-01 00:00:00",
            Some("2020-02-01 00:00:00"),
        );
        let update = TimestampUpdate {
            first_seen: None,
            last_seen: Some("2020-03-01 00:00:00".to_string()),
            source_last_seen: Some("2020-03-01 00:00:00".to_string()),
        };
        update.apply(&mut record, "nscan");
        assert_eq!(record.first_seen.as_deref(), Some("2020-01-01 00:00:00"));
        assert_eq!(record.last_seen.as_deref(), Some("2020-03-01 00:00:00"));
        assert_eq!(record.sources["nscan"], "2020-03-01 00:00:00");
    }

    #[test]
    fn test_extract_aggregation_fields() {
        let settings = SourceSettings::new("nscan")
            .with_aggregation_fields(["os", "owner", "site", "ip_addresses"]);
        let obs = SourceObservation::new("1.1.1.1", "2020-01-01 00:00:00")
            .with_field("os", "linux")
            .with_field("__mv_owner", "$alice$;$bob$")
            .with_field("ip_addresses", "1.1.1.1");
        let fields = extract_aggregation_fields(&obs, &settings, &config());
        assert_eq!(fields["os"], FieldValue::Single("linux".to_string()));
        assert_eq!(
            fields["owner"],
            FieldValue::Multi(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(fields["site"], FieldValue::Empty);
        // the alias field never rides along as an aggregation field
        assert!(!fields.contains_key("ip_addresses"));
    }
}
