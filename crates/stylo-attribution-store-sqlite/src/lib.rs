#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use stylo_attribution_core::{
    format_rfc3339, now_utc, AttributionError, BrowserStorage, StorageScope,
};

const STORAGE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_STORAGE_V1: &str = r"
CREATE TABLE IF NOT EXISTS session_storage (
  session_id TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (session_id, key)
);

CREATE TABLE IF NOT EXISTS persistent_storage (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Browser storage backed by SQLite.
///
/// The session scope is keyed by `session_id`, one id per browser tab; the
/// persistent scope is shared by every session in the database.
pub struct SqliteBrowserStorage {
    conn: Connection,
    session_id: String,
}

impl SqliteBrowserStorage {
    pub fn open(path: &Path, session_id: &str) -> Result<Self> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(anyhow!("session id MUST be a non-empty string"));
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), session_id, "opened browser storage");
        Ok(Self {
            conn,
            session_id: session_id.to_string(),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STORAGE_V1)
            .context("failed to apply storage schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORAGE_MIGRATION_VERSION, now],
            )
            .context("failed to register storage schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drops this session's keys, as closing the tab would.
    pub fn end_session(&mut self) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM session_storage WHERE session_id = ?1",
                params![self.session_id],
            )
            .context("failed to clear session storage")
    }

    pub fn migration_versions(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")
            .context("failed to prepare migration query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("failed to query migrations")?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.context("failed to decode migration row")?);
        }
        Ok(versions)
    }
}

impl BrowserStorage for SqliteBrowserStorage {
    fn get_item(&self, scope: StorageScope, key: &str) -> Result<Option<String>, AttributionError> {
        let result = match scope {
            StorageScope::Session => self
                .conn
                .query_row(
                    "SELECT value FROM session_storage WHERE session_id = ?1 AND key = ?2",
                    params![self.session_id, key],
                    |row| row.get::<_, String>(0),
                )
                .optional(),
            StorageScope::Persistent => self
                .conn
                .query_row(
                    "SELECT value FROM persistent_storage WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional(),
        };
        result.map_err(|err| storage_error("read", scope, key, &err))
    }

    fn set_item(
        &mut self,
        scope: StorageScope,
        key: &str,
        value: &str,
    ) -> Result<(), AttributionError> {
        let now = format_rfc3339(now_utc())?;
        let result = match scope {
            StorageScope::Session => self.conn.execute(
                "INSERT INTO session_storage(session_id, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id, key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![self.session_id, key, value, now],
            ),
            StorageScope::Persistent => self.conn.execute(
                "INSERT INTO persistent_storage(key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            ),
        };
        result
            .map(|_| ())
            .map_err(|err| storage_error("write", scope, key, &err))
    }

    fn remove_item(&mut self, scope: StorageScope, key: &str) -> Result<(), AttributionError> {
        let result = match scope {
            StorageScope::Session => self.conn.execute(
                "DELETE FROM session_storage WHERE session_id = ?1 AND key = ?2",
                params![self.session_id, key],
            ),
            StorageScope::Persistent => self
                .conn
                .execute("DELETE FROM persistent_storage WHERE key = ?1", params![key]),
        };
        result
            .map(|_| ())
            .map_err(|err| storage_error("remove", scope, key, &err))
    }
}

fn storage_error(
    action: &str,
    scope: StorageScope,
    key: &str,
    err: &rusqlite::Error,
) -> AttributionError {
    AttributionError::Storage(format!(
        "failed to {action} {} key {key}: {err}",
        scope.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use stylo_attribution_core::{parse_rfc3339_utc, utm, PageContext};
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_ok<T>(result: std::result::Result<T, AttributionError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("stylo-store-test-{}.sqlite3", Ulid::new()))
    }

    fn open(path: &Path, session_id: &str) -> SqliteBrowserStorage {
        let store = must(SqliteBrowserStorage::open(path, session_id));
        must(store.migrate());
        store
    }

    #[test]
    fn session_scope_is_isolated_per_session_id() {
        let path = temp_db();
        let mut tab_a = open(&path, "tab-a");
        let tab_b = open(&path, "tab-b");

        must_ok(tab_a.set_item(StorageScope::Session, "k", "a"));

        assert_eq!(
            must_ok(tab_a.get_item(StorageScope::Session, "k")).as_deref(),
            Some("a")
        );
        assert_eq!(must_ok(tab_b.get_item(StorageScope::Session, "k")), None);

        drop(tab_a);
        drop(tab_b);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn persistent_scope_is_shared() {
        let path = temp_db();
        let mut tab_a = open(&path, "tab-a");
        let mut tab_b = open(&path, "tab-b");

        must_ok(tab_a.set_item(StorageScope::Persistent, "consent", "true"));
        assert_eq!(
            must_ok(tab_b.get_item(StorageScope::Persistent, "consent")).as_deref(),
            Some("true")
        );

        must_ok(tab_b.set_item(StorageScope::Persistent, "consent", "false"));
        assert_eq!(
            must_ok(tab_a.get_item(StorageScope::Persistent, "consent")).as_deref(),
            Some("false")
        );

        drop(tab_a);
        drop(tab_b);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = open(Path::new(":memory:"), "default");
        must_ok(store.set_item(StorageScope::Session, "k", "v"));

        must_ok(store.remove_item(StorageScope::Session, "k"));
        must_ok(store.remove_item(StorageScope::Session, "k"));
        must_ok(store.remove_item(StorageScope::Persistent, "never-set"));

        assert_eq!(must_ok(store.get_item(StorageScope::Session, "k")), None);
    }

    #[test]
    fn migrations_are_rerunnable() {
        let store = open(Path::new(":memory:"), "default");
        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.migration_versions()), vec![STORAGE_MIGRATION_VERSION]);
    }

    #[test]
    fn blank_session_id_is_rejected() {
        assert!(SqliteBrowserStorage::open(Path::new(":memory:"), "  ").is_err());
    }

    #[test]
    fn end_session_only_drops_own_keys() {
        let mut store = open(Path::new(":memory:"), "tab");
        must_ok(store.set_item(StorageScope::Session, "a", "1"));
        must_ok(store.set_item(StorageScope::Persistent, "b", "2"));

        assert_eq!(must(store.end_session()), 1);
        assert_eq!(must_ok(store.get_item(StorageScope::Session, "a")), None);
        assert_eq!(
            must_ok(store.get_item(StorageScope::Persistent, "b")).as_deref(),
            Some("2")
        );
    }

    #[test]
    fn attribution_survives_into_a_new_tab() {
        let path = temp_db();
        let now = match parse_rfc3339_utc("2026-10-17T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };

        let mut first_tab = open(&path, "first");
        let captured = must_ok(utm::capture_and_store(
            &mut first_tab,
            &PageContext::new("https://stylo.example/?utm_source=google&utm_medium=cpc"),
            now,
        ));

        let mut second_tab = open(&path, "second");
        assert_eq!(must_ok(second_tab.get_item(StorageScope::Session, utm::SESSION_KEY)), None);
        assert_eq!(utm::get(&mut second_tab, now), captured);
        assert!(must_ok(second_tab.get_item(StorageScope::Session, utm::SESSION_KEY)).is_some());

        drop(first_tab);
        drop(second_tab);
        let _ = std::fs::remove_file(&path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_last_write_wins_per_scope(
            writes in prop::collection::vec(("[a-z]{1,4}", ".{0,24}", any::<bool>()), 1..24)
        ) {
            let mut store = open(Path::new(":memory:"), "prop");
            let mut expected: BTreeMap<(bool, String), String> = BTreeMap::new();

            for (key, value, persistent) in writes {
                let scope = if persistent {
                    StorageScope::Persistent
                } else {
                    StorageScope::Session
                };
                prop_assert!(store.set_item(scope, &key, &value).is_ok());
                expected.insert((persistent, key), value);
            }

            for ((persistent, key), value) in expected {
                let scope = if persistent {
                    StorageScope::Persistent
                } else {
                    StorageScope::Session
                };
                let stored = store.get_item(scope, &key);
                prop_assert_eq!(stored, Ok(Some(value)));
            }
        }
    }
}
