//! # Error Taxonomy
//!
//! Errors are split by recovery policy: `Validation` and `TimeParse` skip a
//! single item and the run continues, `StoreAccess` skips one destination,
//! `Configuration` aborts the run before any store access.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the aggregation and expiration engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An observation or record is missing a required field.
    /// Policy: skip the item, log, count it in the run summary.
    #[error("invalid record: {0}")]
    Validation(String),

    /// A timestamp did not match the configured time format.
    /// Policy: same as `Validation`.
    #[error("timestamp {value:?} does not match format {format:?}")]
    TimeParse { value: String, format: String },

    /// A store lookup or write failed for one destination.
    /// Policy: log a warning, skip that destination, continue the run.
    #[error("store access failed: {0}")]
    StoreAccess(#[from] anyhow::Error),

    /// Required global settings are missing.
    /// Policy: fatal, abort before touching the store.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// True for errors that skip a single item rather than a run.
    pub fn is_item_error(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::TimeParse { .. })
    }
}
