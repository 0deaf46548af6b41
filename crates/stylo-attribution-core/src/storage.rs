use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::AttributionError;

/// The two browser storage scopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StorageScope {
    /// Lives as long as the tab (`sessionStorage`).
    Session,
    /// Survives across visits from the same origin (`localStorage`).
    Persistent,
}

impl StorageScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Persistent => "persistent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session" => Some(Self::Session),
            "persistent" => Some(Self::Persistent),
            _ => None,
        }
    }
}

/// String key/value storage with a session and a persistent scope.
///
/// Each component owns its own keys; nothing else reads or writes them.
pub trait BrowserStorage {
    /// # Errors
    /// Returns [`AttributionError::Storage`] when the backing store cannot be read.
    fn get_item(&self, scope: StorageScope, key: &str) -> Result<Option<String>, AttributionError>;

    /// # Errors
    /// Returns [`AttributionError::Storage`] when the backing store cannot be written.
    fn set_item(
        &mut self,
        scope: StorageScope,
        key: &str,
        value: &str,
    ) -> Result<(), AttributionError>;

    /// Removing an absent key is not an error.
    ///
    /// # Errors
    /// Returns [`AttributionError::Storage`] when the backing store cannot be written.
    fn remove_item(&mut self, scope: StorageScope, key: &str) -> Result<(), AttributionError>;
}

impl<T: BrowserStorage + ?Sized> BrowserStorage for &mut T {
    fn get_item(&self, scope: StorageScope, key: &str) -> Result<Option<String>, AttributionError> {
        (**self).get_item(scope, key)
    }

    fn set_item(
        &mut self,
        scope: StorageScope,
        key: &str,
        value: &str,
    ) -> Result<(), AttributionError> {
        (**self).set_item(scope, key, value)
    }

    fn remove_item(&mut self, scope: StorageScope, key: &str) -> Result<(), AttributionError> {
        (**self).remove_item(scope, key)
    }
}

/// In-process storage, one map per scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStorage {
    session: BTreeMap<String, String>,
    persistent: BTreeMap<String, String>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the session scope, as closing the tab and opening a new one would.
    pub fn end_session(&mut self) {
        self.session.clear();
    }

    #[must_use]
    pub fn len(&self, scope: StorageScope) -> usize {
        self.scope(scope).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.persistent.is_empty()
    }

    fn scope(&self, scope: StorageScope) -> &BTreeMap<String, String> {
        match scope {
            StorageScope::Session => &self.session,
            StorageScope::Persistent => &self.persistent,
        }
    }

    fn scope_mut(&mut self, scope: StorageScope) -> &mut BTreeMap<String, String> {
        match scope {
            StorageScope::Session => &mut self.session,
            StorageScope::Persistent => &mut self.persistent,
        }
    }
}

impl BrowserStorage for MemoryStorage {
    fn get_item(&self, scope: StorageScope, key: &str) -> Result<Option<String>, AttributionError> {
        Ok(self.scope(scope).get(key).cloned())
    }

    fn set_item(
        &mut self,
        scope: StorageScope,
        key: &str,
        value: &str,
    ) -> Result<(), AttributionError> {
        self.scope_mut(scope)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, scope: StorageScope, key: &str) -> Result<(), AttributionError> {
        let _ = self.scope_mut(scope).remove(key);
        Ok(())
    }
}
