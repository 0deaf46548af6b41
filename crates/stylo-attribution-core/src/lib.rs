//! Attribution, consent and form-safety core for the Stylo landing page.
//!
//! The browser is reached only through two capabilities so every component can
//! run against fakes:
//! - [`BrowserStorage`] for the tab-session and origin-persistent key/value scopes.
//! - [`TagBackend`] for the third-party tag globals (Google tag, Facebook Pixel).
//!
//! A page load starts with [`startup`], which captures campaign parameters,
//! restores attribution and initializes the [`AnalyticsDispatcher`] when consent
//! allows it.

pub mod analytics;
pub mod consent;
pub mod sanitize;
pub mod security;
pub mod storage;
pub mod utm;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub use analytics::{
    startup, AnalyticsDispatcher, ConversionEvent, PageLoad, RecordingTagBackend, TagBackend,
    TagCommand, TagConfig, TagEvent, TagKind,
};
pub use consent::{ConsentState, ConsentStore};
pub use sanitize::{
    is_valid_email, is_valid_phone, sanitize_form_data, sanitize_html, sanitize_text,
    sanitize_url, SanitizeOptions,
};
pub use security::{
    is_secure_input, sanitize_and_validate, submit_form, ContactRequest, SecurityGate,
    SecurityLog, SecurityReport, SubmissionOutcome, ValidationOutcome,
};
pub use storage::{BrowserStorage, MemoryStorage, StorageScope};
pub use utm::{AttributionRecord, UtmParameters, UtmStore};

/// Submitted form fields in insertion order.
pub type FormData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AttributionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("tag load error: {0}")]
    TagLoad(String),
}

/// What the page itself knows about the current visit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user_agent: String,
}

impl PageContext {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AttributionError> {
    let parsed = parse_rfc3339(value)?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AttributionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parses an RFC3339 timestamp with any offset.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, AttributionError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AttributionError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AttributionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AttributionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Milliseconds since the Unix epoch, saturating outside the `i64` range.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn rfc3339_round_trip_normalizes_to_utc() {
        let parsed = must_ok(parse_rfc3339("2026-10-17T14:30:00+02:00"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-10-17T12:30:00Z");
    }

    #[test]
    fn parse_utc_rejects_offsets() {
        assert!(parse_rfc3339_utc("2026-10-17T14:30:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-10-17T12:30:00Z").is_ok());
    }

    #[test]
    fn parse_accepts_millisecond_precision() {
        let parsed = must_ok(parse_rfc3339_utc("2026-10-17T12:30:00.250Z"));
        assert_eq!(parsed.millisecond(), 250);
    }

    #[test]
    fn unix_millis_counts_from_epoch() {
        let parsed = must_ok(parse_rfc3339_utc("1970-01-01T00:00:01.500Z"));
        assert_eq!(unix_millis(parsed), 1_500);
    }

    #[test]
    fn error_messages_name_their_kind() {
        assert_eq!(
            AttributionError::Encode("failed to encode attribution: x".to_string()).to_string(),
            "encode error: failed to encode attribution: x"
        );
        assert_eq!(
            AttributionError::Storage("quota".to_string()).to_string(),
            "storage error: quota"
        );
    }
}
