//! Error taxonomy for the ingestion engine.
//!
//! Engine entry points return [`HarvestError`] so callers can match on the
//! failure class. Configuration loading and the CLI wrap these in
//! `anyhow::Error` at the edges.
//!
//! Row-level normalization problems are never represented here: they
//! degrade to `None` fields inside [`crate::normalize`].

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Transient failures exhausted the retry ceiling. Fatal for the run,
    /// resumable on the next one.
    #[error("source unavailable for dataset '{dataset}' after {attempts} attempt(s): {message}")]
    SourceUnavailable {
        dataset: String,
        attempts: u32,
        message: String,
    },

    /// Non-transient rejection from the source (4xx other than 429, or an
    /// error object in the response body).
    #[error("source rejected request (HTTP {status}): {message}")]
    SourceRejected { status: u16, message: String },

    #[error("schema unavailable for dataset '{dataset}': {message}")]
    SchemaUnavailable { dataset: String, message: String },

    #[error("unknown field '{field}'; available columns: {}", .available.join(", "))]
    UnknownField {
        field: String,
        available: Vec<String>,
    },

    #[error("no date-like column in schema; available columns: {}", .available.join(", "))]
    NoDateField { available: Vec<String> },

    #[error("every candidate date field failed to count: {}", .tried.join(", "))]
    NoUsableDateField { tried: Vec<String> },

    #[error("unsafe SQL identifier: '{0}'")]
    UnsafeIdentifier(String),

    #[error("invalid watermark: {0}")]
    InvalidWatermark(String),

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    #[error("no row normalizer registered for kind '{0}'")]
    UnknownNormalizer(String),

    #[error("interrupted at page boundary")]
    Interrupted,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HarvestError {
    /// True for source-side rejections that signal an unsupported filter
    /// expression rather than a broken request.
    pub fn is_filter_rejection(&self) -> bool {
        matches!(self, HarvestError::SourceRejected { status: 400, .. })
    }
}

/// Truncate `message` to at most `max_chars` characters, never splitting a
/// UTF-8 sequence.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "ééééé";
        assert_eq!(truncate_message(text, 3), "ééé");
        assert_eq!(truncate_message(text, 10), text);
        assert_eq!(truncate_message("", 4), "");
    }

    #[test]
    fn unknown_field_lists_columns() {
        let err = HarvestError::UnknownField {
            field: "filed".into(),
            available: vec!["issuance_date".into(), "job__".into()],
        };
        let text = err.to_string();
        assert!(text.contains("'filed'"));
        assert!(text.contains("issuance_date, job__"));
    }

    #[test]
    fn only_400_counts_as_filter_rejection() {
        let bad_filter = HarvestError::SourceRejected {
            status: 400,
            message: "query.soql.type-mismatch".into(),
        };
        let not_found = HarvestError::SourceRejected {
            status: 404,
            message: "dataset.missing".into(),
        };
        assert!(bad_filter.is_filter_rejection());
        assert!(!not_found.is_filter_rejection());
    }
}
