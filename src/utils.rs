//! # Utilities Module
//!
//! Small pure helpers shared across the engine: storage-key sanitization,
//! delimited multi-value parsing, and field-list normalization.

/// Make an identity value safe for use as a storage key.
///
/// Some stores reject `/` (and silently break updates/queries while still
/// accepting inserts), so it is stripped rather than escaped. Returns `None`
/// for an empty input.
pub fn sanitize_key(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    Some(value.replace('/', ""))
}

/// Parse a delimited multi-value string into its member values.
///
/// Each value may be wrapped in a sentinel character, e.g. `$a$;$b$;$c$`
/// with delimiter `;` and sentinel `$`. A string whose only member is empty
/// collapses to `None` (the feed emits an empty string for a single or null
/// value).
pub fn parse_multivalue(raw: &str, delimiter: char, sentinel: char) -> Option<Vec<String>> {
    let values: Vec<String> = raw
        .split(delimiter)
        .map(|v| v.trim_matches(sentinel).to_string())
        .collect();

    if values.len() == 1 && values[0].is_empty() {
        return None;
    }
    Some(values)
}

/// Short opaque identifier correlating the log events of one run.
pub fn generate_run_id() -> String {
    format!("{:x}", chrono::Utc::now().timestamp_micros())
}

/// Normalize a comma-separated field-name list into trimmed names.
///
/// Empty input yields an empty list; blank entries are dropped.
pub fn normalize_field_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key_strips_slashes() {
        assert_eq!(sanitize_key("10.0.0.1/24"), Some("10.0.0.124".to_string()));
        assert_eq!(sanitize_key("10.0.0.1"), Some("10.0.0.1".to_string()));
        assert_eq!(sanitize_key(""), None);
    }

    #[test]
    fn test_parse_multivalue_sentinel_wrapped() {
        assert_eq!(
            parse_multivalue("$1.1.1.1$;$2.2.2.2$", ';', '$'),
            Some(vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()])
        );
    }

    #[test]
    fn test_parse_multivalue_plain() {
        assert_eq!(
            parse_multivalue("a;b", ';', '$'),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_parse_multivalue_empty_is_none() {
        assert_eq!(parse_multivalue("", ';', '$'), None);
        assert_eq!(parse_multivalue("$$", ';', '$'), None);
    }

    #[test]
    fn test_run_ids_are_nonempty_hex() {
        let id = generate_run_id();
        assert!(!id.is_empty());
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_normalize_field_list() {
        assert_eq!(
            normalize_field_list("os, owner ,site"),
            vec!["os".to_string(), "owner".to_string(), "site".to_string()]
        );
        assert!(normalize_field_list("").is_empty());
        assert_eq!(normalize_field_list("os,,"), vec!["os".to_string()]);
    }
}
