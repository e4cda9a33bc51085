/// Durable storage for the synchronization engine.
///
/// This module owns the only two durable shared structures of the engine:
///
/// 1. **Entity Table** - current state, one row per (namespace, type, id)
/// 2. **Changelog Table** - append-only record of every accepted operation
///
/// Both live in one SQLite database together with the version counter (see
/// [`crate::sequencer`]). Reads go through [`SyncStore`] directly; writes are
/// only possible inside [`SyncStore::write`], which hands a [`WriteBatch`] to
/// the caller and commits or rolls back everything it did as a unit.
///
/// The connection is guarded by a mutex and every call is synchronous. Async
/// callers run these methods on the blocking pool (see [`crate::core`]).
use crate::error::{SyncError, SyncResult};
use crate::schema;
use crate::sequencer;
use crate::types::{ChangelogEntry, Entity, EntityKey, Op};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQLite-backed entity and changelog store.
#[derive(Debug)]
pub struct SyncStore {
    conn: Mutex<Connection>,
}

impl SyncStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let conn = schema::open(path)?;
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = schema::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap a connection whose schema is already initialized.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub(crate) fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::StorageError("store mutex poisoned".to_string()))
    }

    /// Run `f` against the store on the blocking thread pool.
    ///
    /// SQLite calls block; async callers go through here so that a slow
    /// commit never stalls the runtime's worker threads.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> SyncResult<T>
    where
        F: FnOnce(&SyncStore) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SyncError::StorageError(format!("blocking task failed: {}", e)))?
    }

    /// Latest assigned global version.
    pub fn current_version(&self) -> SyncResult<i64> {
        let conn = self.lock()?;
        sequencer::current_version(&conn)
    }

    /// All changelog entries of `namespace` with `version > since`, ascending.
    ///
    /// The returned cursor is the highest version among the entries, or the
    /// current global version when there are none, so an idle client still
    /// learns where to resume from.
    pub fn changes_since(
        &self,
        namespace: &str,
        since: i64,
    ) -> SyncResult<(Vec<ChangelogEntry>, i64)> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare_cached(
            "SELECT namespace, version, client_id, entity_type, entity_id, op, data
             FROM changelog
             WHERE namespace = ?1 AND version > ?2
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![namespace, since], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut changes = Vec::new();
        for row in rows {
            let (namespace, version, client_id, entity_type, entity_id, op, data) = row?;
            let op = op.parse::<Op>().map_err(SyncError::StorageError)?;
            let data = data
                .map(|text| serde_json::from_str::<JsonValue>(&text))
                .transpose()?;
            changes.push(ChangelogEntry {
                namespace,
                version,
                client_id,
                entity_type,
                entity_id,
                op,
                data,
            });
        }

        let version = match changes.last() {
            Some(last) => last.version,
            None => sequencer::current_version(&conn)?,
        };

        Ok((changes, version))
    }

    /// Current state of one entity.
    pub fn get_entity(&self, key: &EntityKey) -> SyncResult<Option<Entity>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT data, updated_at, updated_by FROM entities
                 WHERE namespace = ?1 AND type = ?2 AND entity_id = ?3",
                params![key.namespace, key.entity_type, key.id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(data, updated_at, updated_by)| -> SyncResult<Entity> {
            Ok(Entity {
                namespace: key.namespace.clone(),
                entity_type: key.entity_type.clone(),
                id: key.id.clone(),
                data: serde_json::from_str(&data)?,
                updated_at,
                updated_by,
            })
        })
        .transpose()
    }

    /// All entities of one type in a namespace, ordered by id.
    pub fn list_entities(&self, namespace: &str, entity_type: &str) -> SyncResult<Vec<Entity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT entity_id, data, updated_at, updated_by FROM entities
             WHERE namespace = ?1 AND type = ?2
             ORDER BY entity_id ASC",
        )?;
        let rows = stmt.query_map(params![namespace, entity_type], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entities = Vec::new();
        for row in rows {
            let (id, data, updated_at, updated_by) = row?;
            entities.push(Entity {
                namespace: namespace.to_string(),
                entity_type: entity_type.to_string(),
                id,
                data: serde_json::from_str(&data)?,
                updated_at,
                updated_by,
            });
        }
        Ok(entities)
    }

    /// Storage statistics.
    pub fn stats(&self) -> SyncResult<StoreStats> {
        let conn = self.lock()?;
        let entity_count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
        let changelog_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM changelog", [], |r| r.get(0))?;
        let namespace_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT namespace) FROM changelog",
            [],
            |r| r.get(0),
        )?;
        Ok(StoreStats {
            current_version: sequencer::current_version(&conn)?,
            entity_count: entity_count as usize,
            changelog_count: changelog_count as usize,
            namespace_count: namespace_count as usize,
        })
    }

    /// Run `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back (by dropping the
    /// transaction) when it returns `Err`. Nothing `f` wrote is visible to
    /// other readers before the commit.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteBatch<'_>) -> SyncResult<T>) -> SyncResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut batch = WriteBatch { tx };
        let value = f(&mut batch)?;
        batch.tx.commit()?;
        Ok(value)
    }
}

/// Counts reported by [`SyncStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub current_version: i64,
    pub entity_count: usize,
    pub changelog_count: usize,
    pub namespace_count: usize,
}

/// Write access to the entity table, changelog and sequencer, scoped to one
/// open transaction.
pub struct WriteBatch<'conn> {
    tx: Transaction<'conn>,
}

impl WriteBatch<'_> {
    /// Update an existing row only if its `updated_at <= base_updated_at`.
    ///
    /// The new `updated_at` is `max(now_ms, previous + 1)` so the timestamp
    /// strictly advances on every accepted write even if the wall clock
    /// stalls or steps back. Returns whether a row was updated.
    pub fn conditional_update(
        &mut self,
        key: &EntityKey,
        data: &str,
        now_ms: i64,
        updated_by: &str,
        base_updated_at: i64,
    ) -> SyncResult<bool> {
        let changed = self.tx.execute(
            "UPDATE entities
             SET data = ?1, updated_at = MAX(?2, updated_at + 1), updated_by = ?3
             WHERE namespace = ?4 AND type = ?5 AND entity_id = ?6 AND updated_at <= ?7",
            params![
                data,
                now_ms,
                updated_by,
                key.namespace,
                key.entity_type,
                key.id,
                base_updated_at
            ],
        )?;
        Ok(changed > 0)
    }

    /// `updated_at` of the row at `key`, if it exists.
    pub fn updated_at(&self, key: &EntityKey) -> SyncResult<Option<i64>> {
        let updated_at = self
            .tx
            .query_row(
                "SELECT updated_at FROM entities
                 WHERE namespace = ?1 AND type = ?2 AND entity_id = ?3",
                params![key.namespace, key.entity_type, key.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(updated_at)
    }

    /// Insert a row that does not exist yet.
    pub fn insert(
        &mut self,
        key: &EntityKey,
        data: &str,
        now_ms: i64,
        updated_by: &str,
    ) -> SyncResult<()> {
        self.tx.execute(
            "INSERT INTO entities (namespace, type, entity_id, data, updated_at, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![key.namespace, key.entity_type, key.id, data, now_ms, updated_by],
        )?;
        Ok(())
    }

    /// Physically remove the row at `key`.
    ///
    /// With `max_updated_at` set, the row is only removed if its
    /// `updated_at` does not exceed it. Returns whether a row was removed.
    pub fn delete(&mut self, key: &EntityKey, max_updated_at: Option<i64>) -> SyncResult<bool> {
        let removed = match max_updated_at {
            None => self.tx.execute(
                "DELETE FROM entities WHERE namespace = ?1 AND type = ?2 AND entity_id = ?3",
                params![key.namespace, key.entity_type, key.id],
            )?,
            Some(base) => self.tx.execute(
                "DELETE FROM entities
                 WHERE namespace = ?1 AND type = ?2 AND entity_id = ?3 AND updated_at <= ?4",
                params![key.namespace, key.entity_type, key.id, base],
            )?,
        };
        Ok(removed > 0)
    }

    /// Assign the next global version and append one changelog entry for it.
    pub fn append_change(
        &mut self,
        key: &EntityKey,
        client_id: &str,
        op: Op,
        data: Option<&str>,
    ) -> SyncResult<i64> {
        let version = sequencer::next_version(&self.tx)?;
        self.tx.execute(
            "INSERT INTO changelog (version, namespace, client_id, entity_type, entity_id, op, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version,
                key.namespace,
                client_id,
                key.entity_type,
                key.id,
                op.as_str(),
                data
            ],
        )?;
        Ok(version)
    }

    /// Global version as seen inside this transaction.
    pub fn current_version(&self) -> SyncResult<i64> {
        sequencer::current_version(&self.tx)
    }
}
