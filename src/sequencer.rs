/// Global version sequencer.
///
/// One counter for the whole process, independent of namespace, stored in
/// the `meta` table next to the data it orders. Because `next_version` only
/// accepts a [`Transaction`], a version can never be assigned outside the
/// transaction that writes the entity and changelog rows it belongs to: on
/// rollback the increment disappears together with them.
use crate::error::SyncResult;
use crate::schema::VERSION_KEY;
use rusqlite::{Connection, Transaction};

/// Latest assigned global version (0 for an empty database).
pub fn current_version(conn: &Connection) -> SyncResult<i64> {
    let version = conn.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        [VERSION_KEY],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Reserve the next global version inside `tx`.
///
/// The returned value is strictly greater than every value handed out
/// before and becomes durable when `tx` commits.
pub fn next_version(tx: &Transaction<'_>) -> SyncResult<i64> {
    let version = tx.query_row(
        "UPDATE meta SET value = value + 1 WHERE key = ?1 RETURNING value",
        [VERSION_KEY],
        |row| row.get(0),
    )?;
    Ok(version)
}
