//! Plugin entity row storage.
//!
//! # Responsibility
//! - CRUD over the three physical entity tables (peer/group/relational),
//!   partitioned by registered logical table name.
//! - CRUD over entity working copies in the ephemeral schema.
//!
//! # Invariants
//! - Relational writes keep `reference_count` equal to the node-list
//!   length.
//! - All functions take a plain connection so callers can compose them
//!   inside one transaction.

use crate::db::DbError;
use crate::model::entity::{GroupEntityRow, PeerEntityRow, RelationalEntityRow};
use crate::model::ids::{EntityId, NodeId, WorkingCopyId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result type used by entity repository operations.
pub type EntityRepoResult<T> = Result<T, EntityRepoError>;

/// Errors from entity repository operations.
#[derive(Debug)]
pub enum EntityRepoError {
    Db(DbError),
    /// A relational row breaks the count/list invariant.
    InconsistentReferenceCount {
        table_name: String,
        entity_id: EntityId,
    },
    /// Persisted row cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for EntityRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InconsistentReferenceCount {
                table_name,
                entity_id,
            } => write!(
                f,
                "relational row `{table_name}/{entity_id}` reference count diverges from node list"
            ),
            Self::InvalidData(message) => write!(f, "invalid entity data: {message}"),
        }
    }
}

impl Error for EntityRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InconsistentReferenceCount { .. } => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for EntityRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for EntityRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

// ---- peer rows -----------------------------------------------------------

/// Upserts one peer row.
pub fn put_peer(
    conn: &Connection,
    table_name: &str,
    row: &PeerEntityRow,
) -> EntityRepoResult<()> {
    conn.execute(
        "INSERT INTO peer_entities (table_name, node_id, payload, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (table_name, node_id)
         DO UPDATE SET payload = ?3, updated_at = ?5;",
        params![
            table_name,
            row.node_id.as_str(),
            encode_json(&row.payload)?,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

/// Loads one peer row keyed by node id.
pub fn get_peer(
    conn: &Connection,
    table_name: &str,
    node_id: &NodeId,
) -> EntityRepoResult<Option<PeerEntityRow>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, payload, created_at, updated_at
         FROM peer_entities WHERE table_name = ?1 AND node_id = ?2;",
    )?;
    let mut rows = stmt.query(params![table_name, node_id.as_str()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_peer_row(row)?));
    }
    Ok(None)
}

/// Deletes one peer row; missing rows are a no-op.
pub fn delete_peer(
    conn: &Connection,
    table_name: &str,
    node_id: &NodeId,
) -> EntityRepoResult<bool> {
    let changed = conn.execute(
        "DELETE FROM peer_entities WHERE table_name = ?1 AND node_id = ?2;",
        params![table_name, node_id.as_str()],
    )?;
    Ok(changed > 0)
}

// ---- group rows ----------------------------------------------------------

/// Inserts one group row.
pub fn insert_group(
    conn: &Connection,
    table_name: &str,
    row: &GroupEntityRow,
) -> EntityRepoResult<()> {
    conn.execute(
        "INSERT INTO group_entities (
            table_name, entity_id, node_id, payload, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
            table_name,
            row.entity_id.as_str(),
            row.node_id.as_str(),
            encode_json(&row.payload)?,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

/// Lists group rows joined to one node via the node index.
pub fn list_group_by_node(
    conn: &Connection,
    table_name: &str,
    node_id: &NodeId,
) -> EntityRepoResult<Vec<GroupEntityRow>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, node_id, payload, created_at, updated_at
         FROM group_entities
         WHERE table_name = ?1 AND node_id = ?2
         ORDER BY entity_id ASC;",
    )?;
    let mut rows = stmt.query(params![table_name, node_id.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_group_row(row)?);
    }
    Ok(items)
}

/// Deletes all group rows joined to one node.
pub fn delete_group_by_node(
    conn: &Connection,
    table_name: &str,
    node_id: &NodeId,
) -> EntityRepoResult<usize> {
    let changed = conn.execute(
        "DELETE FROM group_entities WHERE table_name = ?1 AND node_id = ?2;",
        params![table_name, node_id.as_str()],
    )?;
    Ok(changed)
}

// ---- relational rows -----------------------------------------------------

/// Upserts one relational row, enforcing the count/list invariant.
pub fn put_relational(
    conn: &Connection,
    table_name: &str,
    row: &RelationalEntityRow,
) -> EntityRepoResult<()> {
    if !row.is_consistent() {
        return Err(EntityRepoError::InconsistentReferenceCount {
            table_name: table_name.to_string(),
            entity_id: row.entity_id.clone(),
        });
    }

    let node_ids: Vec<&str> = row.node_ids.iter().map(NodeId::as_str).collect();
    conn.execute(
        "INSERT INTO relational_entities (
            table_name, entity_id, reference_count, node_ids, payload, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (table_name, entity_id)
         DO UPDATE SET reference_count = ?3, node_ids = ?4, payload = ?5, updated_at = ?7;",
        params![
            table_name,
            row.entity_id.as_str(),
            row.reference_count,
            encode_json(&serde_json::json!(node_ids))?,
            encode_json(&row.payload)?,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

/// Loads one relational row.
pub fn get_relational(
    conn: &Connection,
    table_name: &str,
    entity_id: &EntityId,
) -> EntityRepoResult<Option<RelationalEntityRow>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, reference_count, node_ids, payload, created_at, updated_at
         FROM relational_entities WHERE table_name = ?1 AND entity_id = ?2;",
    )?;
    let mut rows = stmt.query(params![table_name, entity_id.as_str()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_relational_row(row)?));
    }
    Ok(None)
}

/// Lists every relational row of one logical table.
pub fn list_relational(
    conn: &Connection,
    table_name: &str,
) -> EntityRepoResult<Vec<RelationalEntityRow>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, reference_count, node_ids, payload, created_at, updated_at
         FROM relational_entities WHERE table_name = ?1 ORDER BY entity_id ASC;",
    )?;
    let mut rows = stmt.query([table_name])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_relational_row(row)?);
    }
    Ok(items)
}

/// Lists relational rows whose node list contains one node.
pub fn list_relational_by_node(
    conn: &Connection,
    table_name: &str,
    node_id: &NodeId,
) -> EntityRepoResult<Vec<RelationalEntityRow>> {
    let rows = list_relational(conn, table_name)?;
    Ok(rows
        .into_iter()
        .filter(|row| row.node_ids.contains(node_id))
        .collect())
}

/// Deletes one relational row.
pub fn delete_relational(
    conn: &Connection,
    table_name: &str,
    entity_id: &EntityId,
) -> EntityRepoResult<bool> {
    let changed = conn.execute(
        "DELETE FROM relational_entities WHERE table_name = ?1 AND entity_id = ?2;",
        params![table_name, entity_id.as_str()],
    )?;
    Ok(changed > 0)
}

// ---- entity working copies ----------------------------------------------

/// One buffered entity edit inside a working-copy session.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWorkingCopyRow {
    pub working_copy_id: WorkingCopyId,
    pub node_id: NodeId,
    pub payload: serde_json::Value,
    pub copied_at: i64,
    pub updated_at: i64,
}

/// Inserts one entity working-copy row.
pub fn insert_entity_working_copy(
    conn: &Connection,
    table_name: &str,
    row: &EntityWorkingCopyRow,
) -> EntityRepoResult<()> {
    conn.execute(
        "INSERT INTO eph.entity_working_copies (
            table_name, working_copy_id, node_id, payload, copied_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
            table_name,
            row.working_copy_id.as_str(),
            row.node_id.as_str(),
            encode_json(&row.payload)?,
            row.copied_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

/// Loads one entity working-copy row.
pub fn get_entity_working_copy(
    conn: &Connection,
    table_name: &str,
    working_copy_id: &WorkingCopyId,
) -> EntityRepoResult<Option<EntityWorkingCopyRow>> {
    let row: Option<(String, String, String, i64, i64)> = conn
        .query_row(
            "SELECT working_copy_id, node_id, payload, copied_at, updated_at
             FROM eph.entity_working_copies
             WHERE table_name = ?1 AND working_copy_id = ?2;",
            params![table_name, working_copy_id.as_str()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()?;

    let Some((id, node_id, payload, copied_at, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(EntityWorkingCopyRow {
        working_copy_id: WorkingCopyId::new(id),
        node_id: NodeId::new(node_id),
        payload: decode_json(&payload)?,
        copied_at,
        updated_at,
    }))
}

/// Lists buffered rows for one node inside one buffering table. Used to
/// rebuild a session at commit/discard time.
pub fn list_entity_working_copies_by_node(
    conn: &Connection,
    table_name: &str,
    node_id: &NodeId,
) -> EntityRepoResult<Vec<EntityWorkingCopyRow>> {
    let mut stmt = conn.prepare(
        "SELECT working_copy_id, node_id, payload, copied_at, updated_at
         FROM eph.entity_working_copies
         WHERE table_name = ?1 AND node_id = ?2
         ORDER BY copied_at ASC, working_copy_id ASC;",
    )?;
    let mut rows = stmt.query(params![table_name, node_id.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(EntityWorkingCopyRow {
            working_copy_id: WorkingCopyId::new(row.get::<_, String>(0)?),
            node_id: NodeId::new(row.get::<_, String>(1)?),
            payload: decode_json(&row.get::<_, String>(2)?)?,
            copied_at: row.get(3)?,
            updated_at: row.get(4)?,
        });
    }
    Ok(items)
}

/// Deletes one entity working-copy row; missing rows are a no-op.
pub fn delete_entity_working_copy(
    conn: &Connection,
    table_name: &str,
    working_copy_id: &WorkingCopyId,
) -> EntityRepoResult<bool> {
    let changed = conn.execute(
        "DELETE FROM eph.entity_working_copies
         WHERE table_name = ?1 AND working_copy_id = ?2;",
        params![table_name, working_copy_id.as_str()],
    )?;
    Ok(changed > 0)
}

/// Purges entity working copies bound to one node across all tables.
pub fn purge_entity_working_copies_by_node(
    conn: &Connection,
    node_id: &NodeId,
) -> EntityRepoResult<usize> {
    let changed = conn.execute(
        "DELETE FROM eph.entity_working_copies WHERE node_id = ?1;",
        [node_id.as_str()],
    )?;
    Ok(changed)
}

// ---- row parsing ---------------------------------------------------------

fn parse_peer_row(row: &Row<'_>) -> EntityRepoResult<PeerEntityRow> {
    Ok(PeerEntityRow {
        node_id: NodeId::new(row.get::<_, String>(0)?),
        payload: decode_json(&row.get::<_, String>(1)?)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn parse_group_row(row: &Row<'_>) -> EntityRepoResult<GroupEntityRow> {
    Ok(GroupEntityRow {
        entity_id: EntityId::new(row.get::<_, String>(0)?),
        node_id: NodeId::new(row.get::<_, String>(1)?),
        payload: decode_json(&row.get::<_, String>(2)?)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn parse_relational_row(row: &Row<'_>) -> EntityRepoResult<RelationalEntityRow> {
    let node_ids_json: String = row.get(2)?;
    let node_id_texts: Vec<String> = serde_json::from_str(&node_ids_json)
        .map_err(|err| EntityRepoError::InvalidData(format!("node list decode: {err}")))?;

    Ok(RelationalEntityRow {
        entity_id: EntityId::new(row.get::<_, String>(0)?),
        reference_count: row.get(1)?,
        node_ids: node_id_texts.into_iter().map(NodeId::new).collect(),
        payload: decode_json(&row.get::<_, String>(3)?)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn encode_json(value: &serde_json::Value) -> EntityRepoResult<String> {
    serde_json::to_string(value)
        .map_err(|err| EntityRepoError::InvalidData(format!("payload encode: {err}")))
}

fn decode_json(text: &str) -> EntityRepoResult<serde_json::Value> {
    serde_json::from_str(text)
        .map_err(|err| EntityRepoError::InvalidData(format!("payload decode: {err}")))
}
