//! Ephemeral working-copy repository.
//!
//! # Responsibility
//! - Persist working copies in the attached ephemeral schema.
//! - Keep lookup paths on the `working_copy_of` / `parent_node_id` /
//!   `updated_at` indexes.
//!
//! # Invariants
//! - Rows never survive a process restart (the schema is rebuilt at open).
//! - At most one unresolved working copy targets a given source node.

use crate::db::DbError;
use crate::model::ids::{NodeId, WorkingCopyId};
use crate::model::working_copy::WorkingCopy;
use rusqlite::{params, Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

const WORKING_COPY_SELECT_SQL: &str = "SELECT
    working_copy_id,
    working_copy_of,
    parent_node_id,
    node_type,
    name,
    description,
    copied_at,
    updated_at,
    is_draft,
    base_version,
    payload
FROM eph.working_copies";

/// Result type used by working-copy repository operations.
pub type WorkingCopyRepoResult<T> = Result<T, WorkingCopyRepoError>;

/// Errors from working-copy repository operations.
#[derive(Debug)]
pub enum WorkingCopyRepoError {
    Db(DbError),
    /// No working copy stored under the given id.
    NotFound(WorkingCopyId),
    /// Persisted row cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for WorkingCopyRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "working copy not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid working copy data: {message}"),
        }
    }
}

impl Error for WorkingCopyRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for WorkingCopyRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for WorkingCopyRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Inserts one working copy row.
pub fn insert_working_copy(
    conn: &Connection,
    copy: &WorkingCopy,
) -> WorkingCopyRepoResult<()> {
    let payload_json = encode_payload(copy)?;
    conn.execute(
        "INSERT INTO eph.working_copies (
            working_copy_id,
            working_copy_of,
            parent_node_id,
            node_type,
            name,
            description,
            copied_at,
            updated_at,
            is_draft,
            base_version,
            payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
        params![
            copy.working_copy_id.as_str(),
            copy.working_copy_of.as_ref().map(NodeId::as_str),
            copy.parent_node_id.as_str(),
            copy.node_type,
            copy.name,
            copy.description,
            copy.copied_at,
            copy.updated_at,
            i64::from(copy.is_draft),
            copy.base_version,
            payload_json,
        ],
    )?;
    Ok(())
}

/// Overwrites one working copy row.
pub fn update_working_copy(
    conn: &Connection,
    copy: &WorkingCopy,
) -> WorkingCopyRepoResult<()> {
    let payload_json = encode_payload(copy)?;
    let changed = conn.execute(
        "UPDATE eph.working_copies SET
            working_copy_of = ?2,
            parent_node_id = ?3,
            node_type = ?4,
            name = ?5,
            description = ?6,
            copied_at = ?7,
            updated_at = ?8,
            is_draft = ?9,
            base_version = ?10,
            payload = ?11
         WHERE working_copy_id = ?1;",
        params![
            copy.working_copy_id.as_str(),
            copy.working_copy_of.as_ref().map(NodeId::as_str),
            copy.parent_node_id.as_str(),
            copy.node_type,
            copy.name,
            copy.description,
            copy.copied_at,
            copy.updated_at,
            i64::from(copy.is_draft),
            copy.base_version,
            payload_json,
        ],
    )?;
    if changed == 0 {
        return Err(WorkingCopyRepoError::NotFound(copy.working_copy_id.clone()));
    }
    Ok(())
}

/// Loads one working copy by id.
pub fn get_working_copy(
    conn: &Connection,
    working_copy_id: &WorkingCopyId,
) -> WorkingCopyRepoResult<Option<WorkingCopy>> {
    let mut stmt = conn.prepare(&format!(
        "{WORKING_COPY_SELECT_SQL} WHERE working_copy_id = ?1;"
    ))?;
    let mut rows = stmt.query([working_copy_id.as_str()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_working_copy_row(row)?));
    }
    Ok(None)
}

/// Finds the unresolved working copy targeting one source node, if any.
pub fn find_by_source_node(
    conn: &Connection,
    node_id: &NodeId,
) -> WorkingCopyRepoResult<Option<WorkingCopy>> {
    let mut stmt = conn.prepare(&format!(
        "{WORKING_COPY_SELECT_SQL} WHERE working_copy_of = ?1
         ORDER BY updated_at DESC LIMIT 1;"
    ))?;
    let mut rows = stmt.query([node_id.as_str()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_working_copy_row(row)?));
    }
    Ok(None)
}

/// Lists working copies parked under one parent node.
pub fn list_by_parent(
    conn: &Connection,
    parent_node_id: &NodeId,
) -> WorkingCopyRepoResult<Vec<WorkingCopy>> {
    let mut stmt = conn.prepare(&format!(
        "{WORKING_COPY_SELECT_SQL} WHERE parent_node_id = ?1
         ORDER BY updated_at ASC, working_copy_id ASC;"
    ))?;
    let mut rows = stmt.query([parent_node_id.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_working_copy_row(row)?);
    }
    Ok(items)
}

/// Deletes one working copy. Returns whether a row was removed; deleting a
/// missing copy is not an error (discard is idempotent).
pub fn delete_working_copy(
    conn: &Connection,
    working_copy_id: &WorkingCopyId,
) -> WorkingCopyRepoResult<bool> {
    let changed = conn.execute(
        "DELETE FROM eph.working_copies WHERE working_copy_id = ?1;",
        [working_copy_id.as_str()],
    )?;
    Ok(changed > 0)
}

/// Purges every working copy targeting one source node. Used by the entity
/// lifecycle when the node is hard-deleted.
pub fn purge_by_source_node(
    conn: &Connection,
    node_id: &NodeId,
) -> WorkingCopyRepoResult<usize> {
    let changed = conn.execute(
        "DELETE FROM eph.working_copies WHERE working_copy_of = ?1;",
        [node_id.as_str()],
    )?;
    Ok(changed)
}

fn encode_payload(copy: &WorkingCopy) -> WorkingCopyRepoResult<Option<String>> {
    copy.payload
        .as_ref()
        .map(|payload| {
            serde_json::to_string(payload).map_err(|err| {
                WorkingCopyRepoError::InvalidData(format!("payload encode: {err}"))
            })
        })
        .transpose()
}

fn parse_working_copy_row(row: &Row<'_>) -> WorkingCopyRepoResult<WorkingCopy> {
    let is_draft = match row.get::<_, i64>("is_draft")? {
        0 => false,
        1 => true,
        other => {
            return Err(WorkingCopyRepoError::InvalidData(format!(
                "invalid is_draft value `{other}` in working_copies.is_draft"
            )));
        }
    };

    let payload = row
        .get::<_, Option<String>>("payload")?
        .map(|text| {
            serde_json::from_str(&text).map_err(|err| {
                WorkingCopyRepoError::InvalidData(format!("payload decode: {err}"))
            })
        })
        .transpose()?;

    Ok(WorkingCopy {
        working_copy_id: WorkingCopyId::new(row.get::<_, String>("working_copy_id")?),
        working_copy_of: row
            .get::<_, Option<String>>("working_copy_of")?
            .map(NodeId::new),
        parent_node_id: NodeId::new(row.get::<_, String>("parent_node_id")?),
        node_type: row.get("node_type")?,
        name: row.get("name")?,
        description: row.get("description")?,
        copied_at: row.get("copied_at")?,
        updated_at: row.get("updated_at")?,
        is_draft,
        base_version: row.get("base_version")?,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        delete_working_copy, find_by_source_node, get_working_copy, insert_working_copy,
        list_by_parent, update_working_copy,
    };
    use crate::db::open_store_in_memory;
    use crate::model::ids::NodeId;
    use crate::model::node::NODE_TYPE_FOLDER;
    use crate::model::working_copy::WorkingCopy;

    #[test]
    fn insert_get_update_delete_round_trip() {
        let conn = open_store_in_memory().unwrap();
        let mut copy = WorkingCopy::draft(NodeId::new("r:root"), NODE_TYPE_FOLDER, "Draft", 5);
        copy.payload = Some(serde_json::json!({ "color": "green" }));

        insert_working_copy(&conn, &copy).unwrap();
        let loaded = get_working_copy(&conn, &copy.working_copy_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, copy);

        copy.name = "Renamed".to_string();
        copy.updated_at = 6;
        update_working_copy(&conn, &copy).unwrap();
        let reloaded = get_working_copy(&conn, &copy.working_copy_id)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.name, "Renamed");

        assert!(delete_working_copy(&conn, &copy.working_copy_id).unwrap());
        // Idempotent: second delete is a no-op, not an error.
        assert!(!delete_working_copy(&conn, &copy.working_copy_id).unwrap());
    }

    #[test]
    fn source_node_index_finds_unresolved_copies() {
        let conn = open_store_in_memory().unwrap();
        let source = NodeId::new("node-1");
        let mut copy = WorkingCopy::draft(NodeId::new("r:root"), NODE_TYPE_FOLDER, "Copy", 5);
        copy.working_copy_of = Some(source.clone());
        copy.is_draft = false;
        copy.base_version = Some(1);
        insert_working_copy(&conn, &copy).unwrap();

        let found = find_by_source_node(&conn, &source).unwrap().unwrap();
        assert_eq!(found.working_copy_id, copy.working_copy_id);
        assert!(find_by_source_node(&conn, &NodeId::new("other"))
            .unwrap()
            .is_none());

        let parked = list_by_parent(&conn, &NodeId::new("r:root")).unwrap();
        assert_eq!(parked.len(), 1);
    }
}
