use serde::{Deserialize, Serialize};

use crate::storage::{BrowserStorage, StorageScope};
use crate::AttributionError;

pub const CONSENT_KEY: &str = "stylo_analytics_consent";

/// Tracking consent. `Unset` has no stored value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    #[default]
    Unset,
    Granted,
    Denied,
}

impl ConsentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unset" => Some(Self::Unset),
            "granted" => Some(Self::Granted),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_granted(granted: bool) -> Self {
        if granted {
            Self::Granted
        } else {
            Self::Denied
        }
    }

    #[must_use]
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }

    fn stored_value(self) -> Option<&'static str> {
        match self {
            Self::Unset => None,
            Self::Granted => Some("true"),
            Self::Denied => Some("false"),
        }
    }
}

/// Reads the decision. Read failures and unknown values count as `Unset`.
pub fn read<S: BrowserStorage + ?Sized>(storage: &S) -> ConsentState {
    let raw = match storage.get_item(StorageScope::Persistent, CONSENT_KEY) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(error = %err, "consent read failed");
            return ConsentState::Unset;
        }
    };

    match raw.as_deref() {
        None => ConsentState::Unset,
        Some("true") => ConsentState::Granted,
        Some("false") => ConsentState::Denied,
        Some(other) => {
            tracing::warn!(value = other, "ignoring unrecognised consent value");
            ConsentState::Unset
        }
    }
}

/// Consent decision kept in the persistent scope with no expiry.
#[derive(Debug)]
pub struct ConsentStore<S> {
    storage: S,
}

impl<S: BrowserStorage> ConsentStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn get(&self) -> ConsentState {
        read(&self.storage)
    }

    /// # Errors
    /// Returns [`AttributionError::Storage`] when the write fails.
    pub fn set(&mut self, granted: bool) -> Result<ConsentState, AttributionError> {
        let state = ConsentState::from_granted(granted);
        if let Some(value) = state.stored_value() {
            self.storage
                .set_item(StorageScope::Persistent, CONSENT_KEY, value)?;
        }
        Ok(state)
    }

    /// Forgets the decision so the prompt shows again.
    ///
    /// # Errors
    /// Returns [`AttributionError::Storage`] when the removal fails.
    pub fn reset(&mut self) -> Result<(), AttributionError> {
        self.storage
            .remove_item(StorageScope::Persistent, CONSENT_KEY)
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}
