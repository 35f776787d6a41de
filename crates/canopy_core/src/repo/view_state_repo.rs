//! Ephemeral keyed view-snapshot storage.
//!
//! Transient UI state (selection, scroll anchors, dialog drafts) parked by
//! the embedder between interactions. Cleared with the rest of the
//! ephemeral schema at every open.

use crate::repo::working_copy_repo::{WorkingCopyRepoError, WorkingCopyRepoResult};
use rusqlite::{params, Connection, OptionalExtension};

/// Upserts one view snapshot under `view_key`.
pub fn put_view(
    conn: &Connection,
    view_key: &str,
    payload: &serde_json::Value,
    now: i64,
) -> WorkingCopyRepoResult<()> {
    let payload_json = serde_json::to_string(payload)
        .map_err(|err| WorkingCopyRepoError::InvalidData(format!("view encode: {err}")))?;
    conn.execute(
        "INSERT INTO eph.views (view_key, payload, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (view_key) DO UPDATE SET payload = ?2, updated_at = ?3;",
        params![view_key, payload_json, now],
    )?;
    Ok(())
}

/// Loads one view snapshot.
pub fn get_view(
    conn: &Connection,
    view_key: &str,
) -> WorkingCopyRepoResult<Option<serde_json::Value>> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM eph.views WHERE view_key = ?1;",
            [view_key],
            |row| row.get(0),
        )
        .optional()?;

    payload
        .map(|text| {
            serde_json::from_str(&text)
                .map_err(|err| WorkingCopyRepoError::InvalidData(format!("view decode: {err}")))
        })
        .transpose()
}

/// Loads and removes one view snapshot in a single step.
pub fn take_view(
    conn: &Connection,
    view_key: &str,
) -> WorkingCopyRepoResult<Option<serde_json::Value>> {
    let value = get_view(conn, view_key)?;
    if value.is_some() {
        conn.execute("DELETE FROM eph.views WHERE view_key = ?1;", [view_key])?;
    }
    Ok(value)
}
