//! Consent-gated tag loading and event dispatch.
//!
//! The dispatcher owns its storage and tag backend for the lifetime of a page
//! load. Every tracking call is a no-op until [`AnalyticsDispatcher::initialize`]
//! has loaded all configured tags under granted consent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::consent::{self, ConsentState, ConsentStore};
use crate::storage::BrowserStorage;
use crate::utm::{self, UtmParameters};
use crate::{AttributionError, FormData, PageContext};

pub const DEFAULT_LEAD_VALUE: f64 = 100.0;
pub const DEFAULT_CURRENCY: &str = "BRL";

pub const GA4_ID_ENV: &str = "STYLO_GA4_ID";
pub const FB_PIXEL_ID_ENV: &str = "STYLO_FB_PIXEL_ID";
pub const GOOGLE_ADS_ID_ENV: &str = "STYLO_GOOGLE_ADS_ID";

const LEAD_EVENT: &str = "generate_lead";
const CONTACT_EVENTS: [&str; 3] = ["contact_whatsapp", "contact_phone", "contact_email"];
const PIXEL_CUSTOM_EVENT: &str = "CustomEvent";

/// Tag identifiers. Each one is independent; an absent ID disables only its
/// integration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TagConfig {
    pub ga4_measurement_id: Option<String>,
    pub facebook_pixel_id: Option<String>,
    pub google_ads_conversion_id: Option<String>,
}

impl TagConfig {
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when an ID is malformed.
    pub fn from_env() -> Result<Self, AttributionError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from a variable lookup; blank values count as absent.
    ///
    /// # Errors
    /// Returns [`AttributionError::Configuration`] when an ID is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AttributionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            ga4_measurement_id: lookup(GA4_ID_ENV),
            facebook_pixel_id: lookup(FB_PIXEL_ID_ENV),
            google_ads_conversion_id: lookup(GOOGLE_ADS_ID_ENV),
        }
        .normalized();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AttributionError::Configuration`] when the document does not
    /// parse or an ID is malformed.
    pub fn from_json(raw: &str) -> Result<Self, AttributionError> {
        let config = serde_json::from_str::<Self>(raw)
            .map_err(|err| {
                AttributionError::Configuration(format!("tag config is not valid JSON: {err}"))
            })?
            .normalized();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AttributionError::Configuration`] when an ID contains
    /// whitespace or control characters.
    pub fn validate(&self) -> Result<(), AttributionError> {
        for (name, value) in [
            ("ga4_measurement_id", &self.ga4_measurement_id),
            ("facebook_pixel_id", &self.facebook_pixel_id),
            ("google_ads_conversion_id", &self.google_ads_conversion_id),
        ] {
            if let Some(value) = value {
                if value
                    .chars()
                    .any(|ch| ch.is_whitespace() || ch.is_control())
                {
                    return Err(AttributionError::Configuration(format!(
                        "{name} MUST NOT contain whitespace or control characters"
                    )));
                }
            }
        }
        Ok(())
    }

    /// ID the Google tag script is loaded with: GA4, else Google Ads.
    #[must_use]
    pub fn google_tag_id(&self) -> Option<&str> {
        self.ga4_measurement_id
            .as_deref()
            .or(self.google_ads_conversion_id.as_deref())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.google_tag_id().is_none() && self.facebook_pixel_id.is_none()
    }

    fn normalized(self) -> Self {
        fn present(value: Option<String>) -> Option<String> {
            value
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        }

        Self {
            ga4_measurement_id: present(self.ga4_measurement_id),
            facebook_pixel_id: present(self.facebook_pixel_id),
            google_ads_conversion_id: present(self.google_ads_conversion_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    /// `gtag.js`, shared by GA4 and Google Ads.
    GoogleTag,
    FacebookPixel,
}

impl TagKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleTag => "google_tag",
            Self::FacebookPixel => "facebook_pixel",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "google_tag" => Some(Self::GoogleTag),
            "facebook_pixel" => Some(Self::FacebookPixel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagCommand {
    Config,
    Event,
    Consent,
    Init,
    Track,
    TrackCustom,
}

impl TagCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Event => "event",
            Self::Consent => "consent",
            Self::Init => "init",
            Self::Track => "track",
            Self::TrackCustom => "track_custom",
        }
    }
}

/// One call into a tag global, e.g. `gtag('event', name, params)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagEvent {
    pub tag: TagKind,
    pub command: TagCommand,
    pub name: String,
    pub params: Map<String, Value>,
}

impl TagEvent {
    #[must_use]
    pub fn new(
        tag: TagKind,
        command: TagCommand,
        name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            tag,
            command,
            name: name.into(),
            params,
        }
    }
}

/// The third-party tag globals.
pub trait TagBackend {
    /// True once the tag's global hook exists.
    fn is_loaded(&self, tag: TagKind) -> bool;

    /// Injects the tag script and waits for it to settle.
    ///
    /// # Errors
    /// Returns [`AttributionError::TagLoad`] when the script fails to load.
    fn load_tag(&mut self, tag: TagKind, id: &str) -> Result<(), AttributionError>;

    fn emit(&mut self, event: TagEvent);
}

impl<T: TagBackend + ?Sized> TagBackend for &mut T {
    fn is_loaded(&self, tag: TagKind) -> bool {
        (**self).is_loaded(tag)
    }

    fn load_tag(&mut self, tag: TagKind, id: &str) -> Result<(), AttributionError> {
        (**self).load_tag(tag, id)
    }

    fn emit(&mut self, event: TagEvent) {
        (**self).emit(event);
    }
}

/// Backend that records loads and events instead of touching a network.
#[derive(Debug, Clone, Default)]
pub struct RecordingTagBackend {
    loaded: BTreeSet<TagKind>,
    failing: BTreeSet<TagKind>,
    load_calls: Vec<(TagKind, String)>,
    events: Vec<TagEvent>,
}

impl RecordingTagBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every load of `tag` fail.
    #[must_use]
    pub fn failing_on(mut self, tag: TagKind) -> Self {
        self.failing.insert(tag);
        self
    }

    /// Marks a tag as already present on the page.
    pub fn mark_loaded(&mut self, tag: TagKind) {
        self.loaded.insert(tag);
    }

    #[must_use]
    pub fn loaded_tags(&self) -> Vec<TagKind> {
        self.loaded.iter().copied().collect()
    }

    #[must_use]
    pub fn load_calls(&self) -> &[(TagKind, String)] {
        &self.load_calls
    }

    #[must_use]
    pub fn events(&self) -> &[TagEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<TagEvent> {
        std::mem::take(&mut self.events)
    }
}

impl TagBackend for RecordingTagBackend {
    fn is_loaded(&self, tag: TagKind) -> bool {
        self.loaded.contains(&tag)
    }

    fn load_tag(&mut self, tag: TagKind, id: &str) -> Result<(), AttributionError> {
        self.load_calls.push((tag, id.to_string()));
        if self.failing.contains(&tag) {
            return Err(AttributionError::TagLoad(format!(
                "{} script for {id} failed to load",
                tag.as_str()
            )));
        }
        self.loaded.insert(tag);
        Ok(())
    }

    fn emit(&mut self, event: TagEvent) {
        self.events.push(event);
    }
}

/// A conversion as the page reports it, before vendor mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversionEvent {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ConversionEvent {
    #[must_use]
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Parameters sent with the Google event: currency, value, then the rest.
    #[must_use]
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(currency) = &self.currency {
            params.insert("currency".to_string(), Value::String(currency.clone()));
        }
        if let Some(value) = self.value {
            params.insert("value".to_string(), Value::from(value));
        }
        for (key, value) in &self.params {
            params.insert(key.clone(), value.clone());
        }
        params
    }

    fn content_name(&self) -> String {
        ["form_name", "contact_method"]
            .iter()
            .find_map(|key| {
                self.params
                    .get(*key)
                    .and_then(Value::as_str)
                    .filter(|value| !value.is_empty())
            })
            .unwrap_or("conversion")
            .to_string()
    }
}

/// Pixel vocabulary for an internal event name.
#[must_use]
pub fn pixel_event_name(event_name: &str) -> &'static str {
    if event_name == LEAD_EVENT {
        "Lead"
    } else if CONTACT_EVENTS.contains(&event_name) {
        "Contact"
    } else {
        PIXEL_CUSTOM_EVENT
    }
}

#[derive(Debug)]
pub struct AnalyticsDispatcher<S, B> {
    storage: S,
    backend: B,
    config: TagConfig,
    page: PageContext,
    enabled: bool,
    utm_context: UtmParameters,
}

impl<S: BrowserStorage, B: TagBackend> AnalyticsDispatcher<S, B> {
    /// Restores the attribution context; loads nothing yet.
    pub fn new(
        mut storage: S,
        backend: B,
        config: TagConfig,
        page: PageContext,
        now: OffsetDateTime,
    ) -> Self {
        let utm_context = utm::get(&mut storage, now);
        Self {
            storage,
            backend,
            config,
            page,
            enabled: false,
            utm_context,
        }
    }

    pub fn consent(&self) -> ConsentState {
        consent::read(&self.storage)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn utm_context(&self) -> &UtmParameters {
        &self.utm_context
    }

    pub fn config(&self) -> &TagConfig {
        &self.config
    }

    pub fn page(&self) -> &PageContext {
        &self.page
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_parts(self) -> (S, B) {
        (self.storage, self.backend)
    }

    /// Loads every configured tag when consent is granted, then fires one
    /// page view.
    ///
    /// All loads are attempted even after a failure; `enabled` is set only
    /// when every one succeeded. Unset or denied consent is a quiet no-op.
    ///
    /// # Errors
    /// Returns [`AttributionError::TagLoad`] naming every tag that failed.
    pub fn initialize(&mut self) -> Result<(), AttributionError> {
        if !self.consent().is_granted() {
            return Ok(());
        }
        if self.config.is_empty() {
            tracing::warn!("no tag IDs configured, analytics stays disabled");
            return Ok(());
        }

        let mut failures = Vec::new();
        let google_id = self.config.google_tag_id().map(str::to_string);
        if let Some(id) = google_id {
            if let Err(err) = self.ensure_loaded(TagKind::GoogleTag, &id) {
                failures.push(format!("{}: {err}", TagKind::GoogleTag.as_str()));
            }
        }
        if let Some(id) = self.config.facebook_pixel_id.clone() {
            if let Err(err) = self.ensure_loaded(TagKind::FacebookPixel, &id) {
                failures.push(format!("{}: {err}", TagKind::FacebookPixel.as_str()));
            }
        }

        if !failures.is_empty() {
            self.enabled = false;
            return Err(AttributionError::TagLoad(failures.join("; ")));
        }

        self.enabled = true;
        self.track_page_view(None, None);
        Ok(())
    }

    /// Persists the decision and moves the dispatcher to match it.
    ///
    /// A failed initialization after granting is logged, not returned.
    ///
    /// # Errors
    /// Returns [`AttributionError::Storage`] when the decision cannot be saved.
    pub fn set_consent(
        &mut self,
        granted: bool,
        now: OffsetDateTime,
    ) -> Result<ConsentState, AttributionError> {
        let state = ConsentStore::new(&mut self.storage).set(granted)?;
        self.utm_context = utm::get(&mut self.storage, now);

        if granted && !self.enabled {
            if let Err(err) = self.initialize() {
                tracing::warn!(error = %err, "analytics initialization failed after consent");
            }
        } else if !granted && self.enabled {
            self.disable();
        }
        Ok(state)
    }

    /// Forgets the decision; tracking stops until consent is given again.
    ///
    /// # Errors
    /// Returns [`AttributionError::Storage`] when the removal fails.
    pub fn reset_consent(&mut self) -> Result<(), AttributionError> {
        ConsentStore::new(&mut self.storage).reset()?;
        if self.enabled {
            self.disable();
        }
        Ok(())
    }

    /// Stops emission. Loaded scripts stay on the page.
    pub fn disable(&mut self) -> usize {
        self.enabled = false;
        if !self.backend.is_loaded(TagKind::GoogleTag) {
            return 0;
        }

        let params = json_object(json!({
            "analytics_storage": "denied",
            "ad_storage": "denied",
        }));
        self.send(TagEvent::new(
            TagKind::GoogleTag,
            TagCommand::Consent,
            "update",
            params,
        ));
        1
    }

    /// Title and location default to the page's own.
    pub fn track_page_view(&mut self, title: Option<&str>, location: Option<&str>) -> usize {
        if !self.enabled {
            return 0;
        }

        let title = title
            .filter(|value| !value.is_empty())
            .unwrap_or(self.page.title.as_str())
            .to_string();
        let location = location
            .filter(|value| !value.is_empty())
            .unwrap_or(self.page.url.as_str())
            .to_string();

        let mut params = Map::new();
        params.insert("page_title".to_string(), Value::String(title));
        params.insert("page_location".to_string(), Value::String(location));

        let mut emitted =
            self.emit_tracked(TagKind::GoogleTag, TagCommand::Event, "page_view", params);
        emitted += self.emit_tracked(
            TagKind::FacebookPixel,
            TagCommand::Track,
            "PageView",
            Map::new(),
        );
        emitted
    }

    pub fn track_event(&mut self, name: &str, params: Map<String, Value>) -> usize {
        if !self.enabled {
            return 0;
        }
        self.emit_tracked(TagKind::GoogleTag, TagCommand::Event, name, params)
    }

    /// Sends the Google event, the Google Ads conversion for leads, and the
    /// mapped Pixel event.
    pub fn track_conversion(&mut self, event: &ConversionEvent) -> usize {
        if !self.enabled {
            return 0;
        }

        let mut emitted = self.emit_tracked(
            TagKind::GoogleTag,
            TagCommand::Event,
            &event.event_name,
            event.to_params(),
        );

        if event.event_name == LEAD_EVENT {
            if let Some(ads_id) = self.config.google_ads_conversion_id.clone() {
                let mut params = Map::new();
                params.insert("send_to".to_string(), Value::String(ads_id));
                params.insert(
                    "value".to_string(),
                    Value::from(event.value.unwrap_or(DEFAULT_LEAD_VALUE)),
                );
                params.insert("currency".to_string(), Value::String(currency_of(event)));
                emitted +=
                    self.emit_tracked(TagKind::GoogleTag, TagCommand::Event, "conversion", params);
            }
        }

        let pixel_name = pixel_event_name(&event.event_name);
        let command = if pixel_name == PIXEL_CUSTOM_EVENT {
            TagCommand::TrackCustom
        } else {
            TagCommand::Track
        };
        let mut params = Map::new();
        params.insert("value".to_string(), Value::from(event.value.unwrap_or(0.0)));
        params.insert("currency".to_string(), Value::String(currency_of(event)));
        params.insert("content_name".to_string(), Value::String(event.content_name()));
        emitted += self.emit_tracked(TagKind::FacebookPixel, command, pixel_name, params);

        emitted
    }

    /// Lead conversion; `form_data` fields are sent alongside `form_name`.
    pub fn track_form_submission(
        &mut self,
        form_name: &str,
        form_data: Option<&FormData>,
    ) -> usize {
        let mut event = ConversionEvent::new(LEAD_EVENT)
            .with_currency(DEFAULT_CURRENCY)
            .with_value(DEFAULT_LEAD_VALUE)
            .with_param("form_name", form_name);
        if let Some(form_data) = form_data {
            for (key, value) in form_data {
                event.params.insert(key.clone(), value.clone());
            }
        }
        self.track_conversion(&event)
    }

    pub fn track_cta_click(&mut self, cta_name: &str, cta_location: &str) -> usize {
        let mut params = Map::new();
        params.insert("cta_name".to_string(), Value::String(cta_name.to_string()));
        params.insert("cta_location".to_string(), Value::String(cta_location.to_string()));
        self.track_event("cta_click", params)
    }

    pub fn track_whatsapp_click(&mut self, source: &str) -> usize {
        self.track_contact("whatsapp", source)
    }

    pub fn track_phone_click(&mut self, source: &str) -> usize {
        self.track_contact("phone", source)
    }

    pub fn track_email_click(&mut self, source: &str) -> usize {
        self.track_contact("email", source)
    }

    fn track_contact(&mut self, method: &str, source: &str) -> usize {
        let event = ConversionEvent::new(format!("contact_{method}"))
            .with_param("contact_method", method)
            .with_param("contact_source", source);
        self.track_conversion(&event)
    }

    fn ensure_loaded(&mut self, tag: TagKind, id: &str) -> Result<(), AttributionError> {
        if self.backend.is_loaded(tag) {
            return Ok(());
        }
        self.backend.load_tag(tag, id)?;
        tracing::debug!(tag = tag.as_str(), id, "tag loaded");

        match tag {
            TagKind::GoogleTag => {
                if let Some(ga4_id) = self.config.ga4_measurement_id.clone() {
                    let params = json_object(json!({
                        "anonymize_ip": true,
                        "allow_google_signals": false,
                        "allow_ad_personalization_signals": false,
                    }));
                    self.send(TagEvent::new(tag, TagCommand::Config, ga4_id, params));
                }
                if let Some(ads_id) = self.config.google_ads_conversion_id.clone() {
                    self.send(TagEvent::new(tag, TagCommand::Config, ads_id, Map::new()));
                }
            }
            TagKind::FacebookPixel => {
                self.send(TagEvent::new(tag, TagCommand::Init, id, Map::new()));
            }
        }
        Ok(())
    }

    fn emit_tracked(
        &mut self,
        tag: TagKind,
        command: TagCommand,
        name: &str,
        params: Map<String, Value>,
    ) -> usize {
        if !self.backend.is_loaded(tag) {
            return 0;
        }
        let params = utm::attach_to_event(params, &self.utm_context);
        self.send(TagEvent::new(tag, command, name, params));
        1
    }

    fn send(&mut self, event: TagEvent) {
        tracing::debug!(
            tag = event.tag.as_str(),
            command = event.command.as_str(),
            name = %event.name,
            "emitting tag event"
        );
        self.backend.emit(event);
    }
}

/// Result of [`startup`].
#[derive(Debug)]
pub struct PageLoad<S, B> {
    /// Parameters captured from this load's URL, stored or not.
    pub captured: UtmParameters,
    pub dispatcher: AnalyticsDispatcher<S, B>,
    /// Set when consent was granted but a tag failed to load.
    pub initialize_error: Option<AttributionError>,
}

/// Page-load entry point: captures attribution, then builds and initializes
/// the dispatcher. Failures are logged and never stop the page.
pub fn startup<S: BrowserStorage, B: TagBackend>(
    mut storage: S,
    backend: B,
    config: TagConfig,
    page: PageContext,
    now: OffsetDateTime,
) -> PageLoad<S, B> {
    let captured = utm::capture(&page, now);
    if let Err(err) = utm::store(&mut storage, &captured, now) {
        tracing::warn!(error = %err, "failed to persist campaign attribution");
    }

    let mut dispatcher = AnalyticsDispatcher::new(storage, backend, config, page, now);
    let initialize_error = dispatcher.initialize().err();
    if let Some(err) = &initialize_error {
        tracing::warn!(error = %err, "analytics disabled for this page load");
    }

    PageLoad {
        captured,
        dispatcher,
        initialize_error,
    }
}

fn currency_of(event: &ConversionEvent) -> String {
    event
        .currency
        .clone()
        .filter(|currency| !currency.is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string())
}

fn json_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::{parse_rfc3339_utc, PageContext};

    type Dispatcher = AnalyticsDispatcher<MemoryStorage, RecordingTagBackend>;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
        match result {
            Ok(value) => panic!("expected Err(..), got Ok({value:?})"),
            Err(err) => err,
        }
    }

    fn now() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-10-17T12:00:00Z"))
    }

    fn page() -> PageContext {
        PageContext::new("https://stylo.example/?utm_source=google&utm_medium=cpc")
            .with_title("Stylo Uniformes")
    }

    fn ga_only() -> TagConfig {
        TagConfig {
            ga4_measurement_id: Some("G-TEST123".to_string()),
            ..TagConfig::default()
        }
    }

    fn full_config() -> TagConfig {
        TagConfig {
            ga4_measurement_id: Some("G-TEST123".to_string()),
            facebook_pixel_id: Some("1234567890".to_string()),
            google_ads_conversion_id: Some("AW-555".to_string()),
        }
    }

    fn storage_with_consent(granted: Option<bool>) -> MemoryStorage {
        let mut storage = MemoryStorage::new();
        if let Some(granted) = granted {
            must_ok(ConsentStore::new(&mut storage).set(granted));
        }
        storage
    }

    fn load(granted: Option<bool>, config: TagConfig, backend: RecordingTagBackend) -> Dispatcher {
        let loaded = startup(storage_with_consent(granted), backend, config, page(), now());
        loaded.dispatcher
    }

    fn track_everything(dispatcher: &mut Dispatcher) -> usize {
        dispatcher.track_page_view(None, None)
            + dispatcher.track_event("scroll", Map::new())
            + dispatcher.track_conversion(&ConversionEvent::new("generate_lead"))
            + dispatcher.track_form_submission("contato", None)
            + dispatcher.track_cta_click("orcamento", "hero")
            + dispatcher.track_whatsapp_click("floating_button")
            + dispatcher.track_phone_click("footer")
            + dispatcher.track_email_click("footer")
    }

    #[test]
    fn unset_or_denied_consent_emits_nothing() {
        for granted in [None, Some(false)] {
            let mut dispatcher = load(granted, full_config(), RecordingTagBackend::new());

            assert!(!dispatcher.is_enabled());
            assert_eq!(track_everything(&mut dispatcher), 0);
            assert!(dispatcher.backend().events().is_empty());
            assert!(dispatcher.backend().load_calls().is_empty());
        }
    }

    #[test]
    fn granted_consent_loads_configures_and_fires_page_view() {
        let dispatcher = load(Some(true), ga_only(), RecordingTagBackend::new());

        assert!(dispatcher.is_enabled());
        assert_eq!(
            dispatcher.backend().load_calls(),
            &[(TagKind::GoogleTag, "G-TEST123".to_string())]
        );

        let events = dispatcher.backend().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].command, TagCommand::Config);
        assert_eq!(events[0].name, "G-TEST123");
        assert_eq!(events[0].params.get("anonymize_ip"), Some(&json!(true)));
        assert_eq!(events[0].params.get("allow_google_signals"), Some(&json!(false)));

        assert_eq!(events[1].command, TagCommand::Event);
        assert_eq!(events[1].name, "page_view");
        assert_eq!(
            Value::Object(events[1].params.clone()),
            json!({
                "page_title": "Stylo Uniformes",
                "page_location": "https://stylo.example/?utm_source=google&utm_medium=cpc",
                "utm_source": "google",
                "utm_medium": "cpc",
                "referrer": "",
                "landing_page": "https://stylo.example/?utm_source=google&utm_medium=cpc",
                "timestamp": "2026-10-17T12:00:00Z"
            })
        );
    }

    #[test]
    fn whatsapp_click_emits_one_contact_event_with_attribution() {
        let mut dispatcher = load(Some(true), ga_only(), RecordingTagBackend::new());
        dispatcher.backend_mut().take_events();

        assert_eq!(dispatcher.track_whatsapp_click("floating_button"), 1);

        let events = dispatcher.backend().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "contact_whatsapp");
        assert_eq!(events[0].params.get("contact_method"), Some(&json!("whatsapp")));
        assert_eq!(events[0].params.get("contact_source"), Some(&json!("floating_button")));
        assert_eq!(events[0].params.get("utm_source"), Some(&json!("google")));
    }

    #[test]
    fn lead_fans_out_to_ads_and_pixel() {
        let mut dispatcher = load(Some(true), full_config(), RecordingTagBackend::new());
        dispatcher.backend_mut().take_events();

        assert_eq!(dispatcher.track_form_submission("contato", None), 3);

        let events = dispatcher.backend().events();
        assert_eq!(events[0].name, "generate_lead");
        assert_eq!(events[0].params.get("value"), Some(&json!(100.0)));
        assert_eq!(events[0].params.get("form_name"), Some(&json!("contato")));

        assert_eq!(events[1].name, "conversion");
        assert_eq!(events[1].params.get("send_to"), Some(&json!("AW-555")));
        assert_eq!(events[1].params.get("value"), Some(&json!(100.0)));
        assert_eq!(events[1].params.get("currency"), Some(&json!("BRL")));

        assert_eq!(events[2].tag, TagKind::FacebookPixel);
        assert_eq!(events[2].command, TagCommand::Track);
        assert_eq!(events[2].name, "Lead");
        assert_eq!(events[2].params.get("content_name"), Some(&json!("contato")));
    }

    #[test]
    fn pixel_mapping_defaults() {
        let mut dispatcher = load(Some(true), full_config(), RecordingTagBackend::new());
        dispatcher.backend_mut().take_events();

        assert_eq!(dispatcher.track_conversion(&ConversionEvent::new("quote_download")), 2);
        let pixel = &dispatcher.backend().events()[1];
        assert_eq!(pixel.command, TagCommand::TrackCustom);
        assert_eq!(pixel.name, "CustomEvent");
        assert_eq!(pixel.params.get("value"), Some(&json!(0.0)));
        assert_eq!(pixel.params.get("currency"), Some(&json!("BRL")));
        assert_eq!(pixel.params.get("content_name"), Some(&json!("conversion")));

        assert_eq!(pixel_event_name("contact_phone"), "Contact");
        assert_eq!(pixel_event_name("generate_lead"), "Lead");
    }

    #[test]
    fn failed_pixel_load_keeps_dispatcher_disabled() {
        let backend = RecordingTagBackend::new().failing_on(TagKind::FacebookPixel);
        let loaded = startup(
            storage_with_consent(Some(true)),
            backend,
            full_config(),
            page(),
            now(),
        );

        let err = match loaded.initialize_error {
            Some(err) => err,
            None => panic!("expected a tag load error"),
        };
        assert!(matches!(
            err,
            AttributionError::TagLoad(ref detail) if detail.contains("facebook_pixel")
        ));

        let dispatcher = loaded.dispatcher;
        assert!(!dispatcher.is_enabled());
        assert_eq!(dispatcher.backend().load_calls().len(), 2);
        assert!(dispatcher
            .backend()
            .events()
            .iter()
            .all(|event| event.command == TagCommand::Config));
    }

    #[test]
    fn loading_is_idempotent() {
        let mut backend = RecordingTagBackend::new();
        backend.mark_loaded(TagKind::GoogleTag);
        let mut dispatcher = load(Some(true), ga_only(), backend);

        assert!(dispatcher.is_enabled());
        assert!(dispatcher.backend().load_calls().is_empty());

        must_ok(dispatcher.initialize());
        assert!(dispatcher.backend().load_calls().is_empty());
    }

    #[test]
    fn second_initialize_does_not_reload() {
        let mut dispatcher = load(Some(true), full_config(), RecordingTagBackend::new());
        assert_eq!(dispatcher.backend().load_calls().len(), 2);

        must_ok(dispatcher.initialize());
        assert_eq!(dispatcher.backend().load_calls().len(), 2);
    }

    #[test]
    fn revoking_consent_emits_update_and_stops_tracking() {
        let mut dispatcher = load(Some(true), ga_only(), RecordingTagBackend::new());
        dispatcher.backend_mut().take_events();

        assert_eq!(must_ok(dispatcher.set_consent(false, now())), ConsentState::Denied);
        assert!(!dispatcher.is_enabled());

        let events = dispatcher.backend_mut().take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, TagCommand::Consent);
        assert_eq!(events[0].name, "update");
        assert_eq!(events[0].params.get("analytics_storage"), Some(&json!("denied")));
        assert_eq!(events[0].params.get("ad_storage"), Some(&json!("denied")));

        assert_eq!(track_everything(&mut dispatcher), 0);
        assert_eq!(
            dispatcher.backend().loaded_tags(),
            vec![TagKind::GoogleTag]
        );
    }

    #[test]
    fn granting_consent_later_initializes() {
        let mut dispatcher = load(None, ga_only(), RecordingTagBackend::new());
        assert!(!dispatcher.is_enabled());

        assert_eq!(must_ok(dispatcher.set_consent(true, now())), ConsentState::Granted);
        assert!(dispatcher.is_enabled());
        assert_eq!(dispatcher.consent(), ConsentState::Granted);
        assert!(dispatcher
            .backend()
            .events()
            .iter()
            .any(|event| event.name == "page_view"));
    }

    #[test]
    fn reset_consent_disables() {
        let mut dispatcher = load(Some(true), ga_only(), RecordingTagBackend::new());
        must_ok(dispatcher.reset_consent());

        assert_eq!(dispatcher.consent(), ConsentState::Unset);
        assert!(!dispatcher.is_enabled());
    }

    #[test]
    fn no_configured_tags_stays_disabled() {
        let mut dispatcher = load(Some(true), TagConfig::default(), RecordingTagBackend::new());
        assert!(!dispatcher.is_enabled());
        assert_eq!(dispatcher.track_cta_click("a", "b"), 0);
    }

    #[test]
    fn attribution_overrides_caller_fields() {
        let mut dispatcher = load(Some(true), ga_only(), RecordingTagBackend::new());
        dispatcher.backend_mut().take_events();

        let mut params = Map::new();
        params.insert("utm_source".to_string(), json!("caller"));
        assert_eq!(dispatcher.track_event("custom", params), 1);
        assert_eq!(
            dispatcher.backend().events()[0].params.get("utm_source"),
            Some(&json!("google"))
        );
    }

    #[test]
    fn ads_only_config_loads_google_tag_with_ads_id() {
        let config = TagConfig {
            google_ads_conversion_id: Some("AW-555".to_string()),
            ..TagConfig::default()
        };
        let dispatcher = load(Some(true), config, RecordingTagBackend::new());

        assert_eq!(
            dispatcher.backend().load_calls(),
            &[(TagKind::GoogleTag, "AW-555".to_string())]
        );
        assert_eq!(dispatcher.backend().events()[0].name, "AW-555");
    }

    #[test]
    fn tag_config_from_lookup_treats_blank_as_absent() {
        let config = must_ok(TagConfig::from_lookup(|name| match name {
            GA4_ID_ENV => Some(" G-ABC ".to_string()),
            FB_PIXEL_ID_ENV => Some("   ".to_string()),
            _ => None,
        }));

        assert_eq!(config.ga4_measurement_id.as_deref(), Some("G-ABC"));
        assert_eq!(config.facebook_pixel_id, None);
        assert_eq!(config.google_ads_conversion_id, None);
    }

    #[test]
    fn tag_config_rejects_inner_whitespace() {
        let err = must_err(TagConfig::from_json(r#"{"facebook_pixel_id":"12 34"}"#));
        assert!(matches!(err, AttributionError::Configuration(_)));

        let err = must_err(TagConfig::from_json(r#"{"ga4":"x"}"#));
        assert!(matches!(err, AttributionError::Configuration(_)));

        let config = must_ok(TagConfig::from_json(r#"{"google_ads_conversion_id":"AW-1"}"#));
        assert_eq!(config.google_tag_id(), Some("AW-1"));
        assert!(!config.is_empty());
    }
}
