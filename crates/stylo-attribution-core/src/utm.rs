use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::storage::{BrowserStorage, StorageScope};
use crate::{format_rfc3339, parse_rfc3339, AttributionError, PageContext};

pub const SESSION_KEY: &str = "stylo_utm_session";
/// Session key written by the first analytics release; read as a fallback.
pub const LEGACY_SESSION_KEY: &str = "stylo_utm_params";
pub const PERSISTENT_KEY: &str = "stylo_utm_persistent";
pub const ATTRIBUTION_WINDOW_DAYS: i64 = 30;

/// Query keys captured from the landing URL, in capture order.
pub const CAMPAIGN_KEYS: [&str; 8] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "gclid",
    "fbclid",
];

const PAID_MEDIUMS: [&str; 3] = ["cpc", "ppc", "paid"];
const DIRECT_ATTRIBUTION: &str = "direct/none/direct";

/// Campaign and click-id parameters of one visit plus its landing context.
///
/// Captured whole at page load and never partially overwritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtmParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gclid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fbclid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl UtmParameters {
    /// Present keys with their values, in field declaration order.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("utm_source", &self.utm_source),
            ("utm_medium", &self.utm_medium),
            ("utm_campaign", &self.utm_campaign),
            ("utm_term", &self.utm_term),
            ("utm_content", &self.utm_content),
            ("utm_id", &self.utm_id),
            ("gclid", &self.gclid),
            ("fbclid", &self.fbclid),
            ("referrer", &self.referrer),
            ("landing_page", &self.landing_page),
            ("timestamp", &self.timestamp),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|value| (key, value)))
        .collect()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries()
            .into_iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// True when any UTM or click-id key is present.
    #[must_use]
    pub fn has_campaign_data(&self) -> bool {
        CAMPAIGN_KEYS.iter().any(|key| self.get(key).is_some())
    }

    #[must_use]
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        self.entries()
            .into_iter()
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect()
    }

    fn set_campaign_value(&mut self, key: &str, value: String) {
        let slot = match key {
            "utm_source" => &mut self.utm_source,
            "utm_medium" => &mut self.utm_medium,
            "utm_campaign" => &mut self.utm_campaign,
            "utm_term" => &mut self.utm_term,
            "utm_content" => &mut self.utm_content,
            "utm_id" => &mut self.utm_id,
            "gclid" => &mut self.gclid,
            "fbclid" => &mut self.fbclid,
            _ => return,
        };
        *slot = Some(value);
    }
}

/// Persisted attribution record; `expires` is capture time plus the window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionRecord {
    pub params: UtmParameters,
    pub expires: String,
}

/// Captures campaign parameters from the page URL.
///
/// Only the first occurrence of each query key counts, and empty values are
/// skipped. `referrer`, `landing_page` and `timestamp` are always attached.
#[must_use]
pub fn capture(page: &PageContext, now: OffsetDateTime) -> UtmParameters {
    let mut params = UtmParameters::default();

    match Url::parse(&page.url) {
        Ok(url) => {
            for key in CAMPAIGN_KEYS {
                let first = url
                    .query_pairs()
                    .find(|(name, _)| name == key)
                    .map(|(_, value)| value.into_owned());
                if let Some(value) = first.filter(|value| !value.is_empty()) {
                    params.set_campaign_value(key, value);
                }
            }
        }
        Err(err) => {
            tracing::debug!(
                url = %page.url,
                error = %err,
                "page url is not absolute; no query captured"
            );
        }
    }

    params.referrer = Some(page.referrer.clone());
    params.landing_page = Some(page.url.clone());
    params.timestamp = format_rfc3339(now).ok();
    params
}

/// Persists a captured set as the session copy and the attribution record.
///
/// A set without UTM or click-id keys leaves earlier attribution untouched and
/// returns `Ok(false)`.
///
/// # Errors
/// Returns [`AttributionError::Storage`] when a write fails.
pub fn store<S: BrowserStorage + ?Sized>(
    storage: &mut S,
    params: &UtmParameters,
    now: OffsetDateTime,
) -> Result<bool, AttributionError> {
    if !params.has_campaign_data() {
        return Ok(false);
    }

    let encoded = encode(params)?;
    storage.set_item(StorageScope::Session, SESSION_KEY, &encoded)?;

    let expires_at = now
        .checked_add(Duration::days(ATTRIBUTION_WINDOW_DAYS))
        .ok_or_else(|| {
            AttributionError::Validation("attribution expiry is out of range".to_string())
        })?;
    let record = AttributionRecord {
        params: params.clone(),
        expires: format_rfc3339(expires_at)?,
    };
    storage.set_item(StorageScope::Persistent, PERSISTENT_KEY, &encode(&record)?)?;

    tracing::debug!(expires = %record.expires, "stored campaign attribution");
    Ok(true)
}

/// Startup combination of [`capture`] and [`store`].
///
/// # Errors
/// Returns [`AttributionError::Storage`] when persisting fails.
pub fn capture_and_store<S: BrowserStorage + ?Sized>(
    storage: &mut S,
    page: &PageContext,
    now: OffsetDateTime,
) -> Result<UtmParameters, AttributionError> {
    let params = capture(page, now);
    store(storage, &params, now)?;
    Ok(params)
}

/// Reads the current attribution.
///
/// The session copy is trusted as is. Otherwise a live attribution record is
/// copied into the session and returned, and an expired one is deleted.
/// Unreadable data is logged and treated as absent.
pub fn get<S: BrowserStorage + ?Sized>(storage: &mut S, now: OffsetDateTime) -> UtmParameters {
    for key in [SESSION_KEY, LEGACY_SESSION_KEY] {
        if let Some(raw) = read(storage, StorageScope::Session, key) {
            match serde_json::from_str::<UtmParameters>(&raw) {
                Ok(params) => return params,
                Err(err) => {
                    tracing::warn!(key, error = %err, "ignoring unreadable session attribution");
                }
            }
        }
    }

    let Some(raw) = read(storage, StorageScope::Persistent, PERSISTENT_KEY) else {
        return UtmParameters::default();
    };
    let record = match serde_json::from_str::<AttributionRecord>(&raw) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(
                key = PERSISTENT_KEY,
                error = %err,
                "ignoring unreadable attribution record"
            );
            return UtmParameters::default();
        }
    };

    let live = parse_rfc3339(&record.expires).is_ok_and(|expires| now < expires);
    if !live {
        if let Err(err) = storage.remove_item(StorageScope::Persistent, PERSISTENT_KEY) {
            tracing::warn!(error = %err, "failed to remove expired attribution record");
        }
        return UtmParameters::default();
    }

    match encode(&record.params) {
        Ok(encoded) => {
            if let Err(err) = storage.set_item(StorageScope::Session, SESSION_KEY, &encoded) {
                tracing::warn!(error = %err, "failed to restore session attribution");
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode session attribution"),
    }
    record.params
}

/// Removes both session copies and the attribution record.
///
/// # Errors
/// Returns [`AttributionError::Storage`] when a removal fails.
pub fn clear<S: BrowserStorage + ?Sized>(storage: &mut S) -> Result<(), AttributionError> {
    storage.remove_item(StorageScope::Session, SESSION_KEY)?;
    storage.remove_item(StorageScope::Session, LEGACY_SESSION_KEY)?;
    storage.remove_item(StorageScope::Persistent, PERSISTENT_KEY)
}

/// Merges attribution into event parameters. Attribution keys win.
#[must_use]
pub fn attach_to_event(
    mut params: serde_json::Map<String, Value>,
    utm: &UtmParameters,
) -> serde_json::Map<String, Value> {
    for (key, value) in utm.entries() {
        params.insert(key.to_string(), Value::String(value.to_string()));
    }
    params
}

/// `source/medium/campaign` summary of where the visit came from.
#[must_use]
pub fn attribution_string(utm: &UtmParameters) -> String {
    if let Some(source) = present(utm.utm_source.as_deref()) {
        return format!(
            "{source}/{}/{}",
            present(utm.utm_medium.as_deref()).unwrap_or("unknown"),
            present(utm.utm_campaign.as_deref()).unwrap_or("unknown"),
        );
    }
    if present(utm.gclid.as_deref()).is_some() {
        return "google/cpc/google_ads".to_string();
    }
    if present(utm.fbclid.as_deref()).is_some() {
        return "facebook/cpc/facebook_ads".to_string();
    }
    if let Some(referrer) = present(utm.referrer.as_deref()) {
        return Url::parse(referrer)
            .ok()
            .and_then(|url| url.host_str().map(|host| format!("{host}/referral/organic")))
            .unwrap_or_else(|| DIRECT_ATTRIBUTION.to_string());
    }
    DIRECT_ATTRIBUTION.to_string()
}

#[must_use]
pub fn is_from_paid_traffic(utm: &UtmParameters) -> bool {
    let medium = present(utm.utm_medium.as_deref());
    present(utm.gclid.as_deref()).is_some()
        || present(utm.fbclid.as_deref()).is_some()
        || medium.is_some_and(|medium| PAID_MEDIUMS.contains(&medium))
        || (present(utm.utm_source.as_deref()) == Some("google") && medium == Some("cpc"))
}

/// Attribution bound to one storage, reading fresh state on every call.
#[derive(Debug)]
pub struct UtmStore<S> {
    storage: S,
}

impl<S: BrowserStorage> UtmStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// # Errors
    /// Returns [`AttributionError::Storage`] when persisting fails.
    pub fn capture_and_store(
        &mut self,
        page: &PageContext,
        now: OffsetDateTime,
    ) -> Result<UtmParameters, AttributionError> {
        capture_and_store(&mut self.storage, page, now)
    }

    pub fn get(&mut self, now: OffsetDateTime) -> UtmParameters {
        get(&mut self.storage, now)
    }

    /// # Errors
    /// Returns [`AttributionError::Storage`] when a removal fails.
    pub fn clear(&mut self) -> Result<(), AttributionError> {
        clear(&mut self.storage)
    }

    pub fn get_attribution_string(&mut self, now: OffsetDateTime) -> String {
        attribution_string(&self.get(now))
    }

    pub fn is_paid_traffic(&mut self, now: OffsetDateTime) -> bool {
        is_from_paid_traffic(&self.get(now))
    }

    pub fn attach_utm_to_event(
        &mut self,
        params: serde_json::Map<String, Value>,
        now: OffsetDateTime,
    ) -> serde_json::Map<String, Value> {
        attach_to_event(params, &self.get(now))
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

fn read<S: BrowserStorage + ?Sized>(storage: &S, scope: StorageScope, key: &str) -> Option<String> {
    match storage.get_item(scope, key) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(scope = scope.as_str(), key, error = %err, "attribution read failed");
            None
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, AttributionError> {
    serde_json::to_string(value).map_err(|err| {
        AttributionError::Encode(format!("failed to encode attribution: {err}"))
    })
}
