use std::fmt::Display;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::sanitize::{compile_pattern, is_valid_email, is_valid_phone, sanitize_form_data};
use crate::storage::{BrowserStorage, StorageScope};
use crate::{unix_millis, AttributionError, FormData, PageContext};

pub const SECURITY_LOG_KEY: &str = "security_log";
pub const MAX_LOG_ENTRIES: usize = 100;
pub const MAX_FIELD_LENGTH: usize = 1000;
pub const GENERIC_SUBMISSION_ERROR: &str = "An unexpected error occurred. Please try again.";

const REQUIRED_CONTACT_FIELDS: [&str; 3] = ["nome", "telefone", "email"];

fn xss_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)<script\b",
            r"(?i)javascript:",
            r"(?i)\bon[a-z]+\s*=",
            r"(?i)data:text/html",
            r"(?i)vbscript:",
        ]
        .into_iter()
        .map(compile_pattern)
        .collect()
    })
}

/// False when the input carries a known script-injection pattern.
#[must_use]
pub fn is_secure_input(input: &str) -> bool {
    !xss_patterns().iter().any(|pattern| pattern.is_match(input))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub sanitized: FormData,
    pub errors: Vec<String>,
}

/// Sanitizes every field, then checks string fields for injection patterns,
/// contact-field shape and length.
///
/// The injection scan looks at the submitted value as well as the sanitized
/// one, so markup the sanitizer removed is still reported. Errors follow the
/// input's field order.
#[must_use]
pub fn sanitize_and_validate(data: &FormData) -> ValidationOutcome {
    let sanitized = sanitize_form_data(data);
    let mut errors = Vec::new();

    for (key, value) in &sanitized {
        let Value::String(text) = value else {
            continue;
        };
        let submitted = data.get(key).and_then(Value::as_str).unwrap_or(text);

        if !is_secure_input(submitted) || !is_secure_input(text) {
            errors.push(format!("Invalid characters detected in {key}"));
        }
        if key == "email" && !text.is_empty() && !is_valid_email(text) {
            errors.push("Invalid email format in email".to_string());
        }
        if key == "telefone" && !text.is_empty() && !is_valid_phone(text) {
            errors.push("Invalid phone format in telefone".to_string());
        }
        if text.chars().count() > MAX_FIELD_LENGTH {
            errors.push(format!(
                "{key} is too long (maximum {MAX_FIELD_LENGTH} characters)"
            ));
        }
    }

    ValidationOutcome {
        is_valid: errors.is_empty(),
        sanitized,
        errors,
    }
}

/// One entry of the local security log. Field names match the stored JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub issue: String,
    /// JSON-encoded detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub url: String,
}

/// Debugging log in the persistent scope, capped at [`MAX_LOG_ENTRIES`].
#[derive(Debug)]
pub struct SecurityLog<S> {
    storage: S,
}

impl<S: BrowserStorage> SecurityLog<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Appends a report, evicting the oldest entries past the cap.
    ///
    /// An unreadable stored log is replaced by a log holding only this report.
    ///
    /// # Errors
    /// Returns [`AttributionError::Storage`] when the log cannot be read or
    /// written, [`AttributionError::Encode`] when it cannot be serialized.
    pub fn report(
        &mut self,
        page: &PageContext,
        issue: &str,
        context: Option<&Value>,
        now: OffsetDateTime,
    ) -> Result<SecurityReport, AttributionError> {
        let report = SecurityReport {
            timestamp: unix_millis(now),
            issue: issue.to_string(),
            context: context.map(Value::to_string),
            user_agent: page.user_agent.clone(),
            url: page.url.clone(),
        };
        tracing::warn!(
            issue,
            context = report.context.as_deref().unwrap_or(""),
            url = %report.url,
            "security issue reported"
        );

        let encoded_report = serde_json::to_value(&report).map_err(|err| {
            AttributionError::Encode(format!("failed to encode security report: {err}"))
        })?;

        let stored = self
            .storage
            .get_item(StorageScope::Persistent, SECURITY_LOG_KEY)?
            .unwrap_or_else(|| "[]".to_string());
        let mut log = match serde_json::from_str::<Vec<Value>>(&stored) {
            Ok(log) => log,
            Err(err) => {
                tracing::warn!(error = %err, "replacing unreadable security log");
                Vec::new()
            }
        };

        log.push(encoded_report);
        if log.len() > MAX_LOG_ENTRIES {
            let excess = log.len() - MAX_LOG_ENTRIES;
            log.drain(..excess);
        }

        let encoded = serde_json::to_string(&log).map_err(|err| {
            AttributionError::Encode(format!("failed to encode security log: {err}"))
        })?;
        self.storage
            .set_item(StorageScope::Persistent, SECURITY_LOG_KEY, &encoded)?;
        Ok(report)
    }

    /// Stored reports, oldest first. Entries that do not decode are skipped.
    pub fn entries(&self) -> Vec<SecurityReport> {
        let stored = match self
            .storage
            .get_item(StorageScope::Persistent, SECURITY_LOG_KEY)
        {
            Ok(Some(stored)) => stored,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "security log read failed");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Value>>(&stored) {
            Ok(log) => log
                .into_iter()
                .filter_map(|entry| serde_json::from_value(entry).ok())
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable security log");
                Vec::new()
            }
        }
    }

    /// # Errors
    /// Returns [`AttributionError::Storage`] when the removal fails.
    pub fn clear(&mut self) -> Result<(), AttributionError> {
        self.storage
            .remove_item(StorageScope::Persistent, SECURITY_LOG_KEY)
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionOutcome {
    /// True when the handler ran and succeeded.
    pub accepted: bool,
    pub sanitized: FormData,
    pub errors: Vec<String>,
}

/// Guards a form handler with sanitizing, validation and issue reporting.
#[derive(Debug)]
pub struct SecurityGate<S> {
    log: SecurityLog<S>,
    page: PageContext,
}

impl<S: BrowserStorage> SecurityGate<S> {
    pub fn new(storage: S, page: PageContext) -> Self {
        Self {
            log: SecurityLog::new(storage),
            page,
        }
    }

    /// Runs `handler` on the sanitized data only when validation passes.
    ///
    /// A handler error is reported to the security log and surfaces as the
    /// single [`GENERIC_SUBMISSION_ERROR`]. Logging failures never block the
    /// submission result.
    pub fn submit<F, E>(
        &mut self,
        data: &FormData,
        now: OffsetDateTime,
        handler: F,
    ) -> SubmissionOutcome
    where
        F: FnOnce(&FormData) -> Result<(), E>,
        E: Display,
    {
        let validation = sanitize_and_validate(data);
        if !validation.is_valid {
            self.record(
                "Form validation failed",
                &json!({ "errors": validation.errors }),
                now,
            );
            return SubmissionOutcome {
                accepted: false,
                sanitized: validation.sanitized,
                errors: validation.errors,
            };
        }

        match handler(&validation.sanitized) {
            Ok(()) => SubmissionOutcome {
                accepted: true,
                sanitized: validation.sanitized,
                errors: Vec::new(),
            },
            Err(err) => {
                self.record(
                    "Form submission error",
                    &json!({ "error": err.to_string() }),
                    now,
                );
                SubmissionOutcome {
                    accepted: false,
                    sanitized: validation.sanitized,
                    errors: vec![GENERIC_SUBMISSION_ERROR.to_string()],
                }
            }
        }
    }

    pub fn log(&self) -> &SecurityLog<S> {
        &self.log
    }

    pub fn into_inner(self) -> S {
        self.log.into_inner()
    }

    fn record(&mut self, issue: &str, context: &Value, now: OffsetDateTime) {
        if let Err(err) = self.log.report(&self.page, issue, Some(context), now) {
            tracing::warn!(error = %err, issue, "failed to persist security report");
        }
    }
}

/// One-shot form of [`SecurityGate::submit`] over borrowed storage.
pub fn submit_form<S, F, E>(
    storage: &mut S,
    page: &PageContext,
    data: &FormData,
    now: OffsetDateTime,
    handler: F,
) -> SubmissionOutcome
where
    S: BrowserStorage + ?Sized,
    F: FnOnce(&FormData) -> Result<(), E>,
    E: Display,
{
    SecurityGate::new(storage, page.clone()).submit(data, now, handler)
}

/// The contact form as the lead endpoint accepts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRequest {
    pub nome: String,
    pub telefone: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantidade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detalhes: Option<String>,
}

impl ContactRequest {
    /// # Errors
    /// Returns [`AttributionError::Validation`] when `nome`, `telefone` or
    /// `email` is missing or blank.
    pub fn from_form(data: &FormData) -> Result<Self, AttributionError> {
        let missing: Vec<&str> = REQUIRED_CONTACT_FIELDS
            .into_iter()
            .filter(|field| field_text(data, field).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AttributionError::Validation(format!(
                "{} MUST be provided",
                missing.join(", ")
            )));
        }

        Ok(Self {
            nome: field_text(data, "nome").unwrap_or_default(),
            telefone: field_text(data, "telefone").unwrap_or_default(),
            email: field_text(data, "email").unwrap_or_default(),
            produto: field_text(data, "produto"),
            quantidade: field_text(data, "quantidade"),
            detalhes: field_text(data, "detalhes"),
        })
    }
}

fn field_text(data: &FormData, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
