/// SQLite schema for the synchronization engine.
///
/// Three durable tables back the engine:
///
/// ```text
///   entities                          changelog
///   ┌──────────────────────────┐      ┌──────────────────────────┐
///   │ namespace   ┐            │      │ version (PK, global)     │
///   │ type        ├ PK         │      │ namespace ── indexed     │
///   │ entity_id   ┘            │      │ client_id                │
///   │ data        (JSON text)  │      │ entity_type, entity_id   │
///   │ updated_at  (ms)         │      │ op  ('upsert'|'delete')  │
///   │ updated_by               │      │ data (NULL for delete)   │
///   └──────────────────────────┘      └──────────────────────────┘
///
///   meta: key → integer   ('version' = last assigned global version,
///                          'schema_version')
/// ```
///
/// All DDL uses `IF NOT EXISTS`, so opening an existing database is
/// idempotent. Migrations beyond the current layout are not supported: a
/// mismatching `schema_version` is an error.
use crate::error::{SyncError, SyncResult};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

/// Current schema version. Increment on breaking layout changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Meta key holding the last assigned global version.
pub(crate) const VERSION_KEY: &str = "version";

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Current state, one row per (namespace, type, id).
const CREATE_ENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    namespace  TEXT    NOT NULL,
    type       TEXT    NOT NULL,
    entity_id  TEXT    NOT NULL,
    data       TEXT    NOT NULL,
    updated_at INTEGER NOT NULL,
    updated_by TEXT    NOT NULL,
    PRIMARY KEY (namespace, type, entity_id)
)
"#;

/// Append-only log. `version` is the global sequence value, so the primary
/// key alone enforces uniqueness across namespaces.
const CREATE_CHANGELOG: &str = r#"
CREATE TABLE IF NOT EXISTS changelog (
    version     INTEGER PRIMARY KEY,
    namespace   TEXT    NOT NULL,
    client_id   TEXT    NOT NULL,
    entity_type TEXT    NOT NULL,
    entity_id   TEXT    NOT NULL,
    op          TEXT    NOT NULL CHECK (op IN ('upsert', 'delete')),
    data        TEXT
)
"#;

/// Supports `WHERE namespace = ? AND version > ? ORDER BY version`.
const CREATE_CHANGELOG_NAMESPACE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS changelog_namespace_version
ON changelog(namespace, version)
"#;

const CREATE_META: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
)
"#;

/// Open (or create) a database file and bring its schema up.
pub fn open(path: impl AsRef<Path>) -> SyncResult<Connection> {
    let mut conn = Connection::open(path)?;
    // WAL lets readers see a consistent snapshot while a batch commits.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    initialize(&mut conn)?;
    Ok(conn)
}

/// Create a private in-memory database, used by tests and benchmarks.
pub fn open_in_memory() -> SyncResult<Connection> {
    let mut conn = Connection::open_in_memory()?;
    initialize(&mut conn)?;
    Ok(conn)
}

/// Create tables, seed the version counter and check the schema version.
pub fn initialize(conn: &mut Connection) -> SyncResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;

    let tx = conn.transaction()?;
    tx.execute_batch(CREATE_META)?;
    tx.execute_batch(CREATE_ENTITIES)?;
    tx.execute_batch(CREATE_CHANGELOG)?;
    tx.execute_batch(CREATE_CHANGELOG_NAMESPACE_INDEX)?;
    tx.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, 0)",
        [VERSION_KEY],
    )?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION_KEY, SCHEMA_VERSION],
            )?;
        }
        Some(found) if found != SCHEMA_VERSION => {
            return Err(SyncError::StorageError(format!(
                "Incompatible schema version: {} (expected {})",
                found, SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_creates_all_tables() {
        let conn = open_in_memory().unwrap();
        let names = table_names(&conn);
        assert!(names.contains(&"entities".to_string()));
        assert!(names.contains(&"changelog".to_string()));
        assert!(names.contains(&"meta".to_string()));
    }

    #[test]
    fn test_version_counter_seeded_at_zero() {
        let conn = open_in_memory().unwrap();
        let version: i64 = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, 0);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.db");

        {
            let conn = open(&path).unwrap();
            conn.execute("UPDATE meta SET value = 41 WHERE key = 'version'", [])
                .unwrap();
        }

        let conn = open(&path).unwrap();
        let version: i64 = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, 41);
    }

    #[test]
    fn test_rejects_foreign_schema_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.db");

        {
            let conn = open(&path).unwrap();
            conn.execute(
                "UPDATE meta SET value = 99 WHERE key = 'schema_version'",
                [],
            )
            .unwrap();
        }

        let result = open(&path);
        assert!(matches!(result, Err(SyncError::StorageError(_))));
    }
}
