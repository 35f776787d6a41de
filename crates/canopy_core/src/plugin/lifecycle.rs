//! Entity lifecycle manager: cascades entity state alongside node state.
//!
//! # Responsibility
//! - Create peer stubs on node create, cascade deletes on node delete,
//!   deep-copy or re-reference entities on node duplicate.
//! - Open, commit and discard working-copy sessions for entities that opt
//!   into buffering.
//!
//! # Invariants
//! - All steps of one call run against the caller's connection, so an
//!   enclosing transaction makes the whole cascade atomic.
//! - Delete order is `{relational, group, peer}`; commit order is
//!   `{peer, group, relational}`.
//! - Relational rows never get duplicated; duplication adds a reference.

use crate::model::entity::{EntityKind, GroupEntityRow, PeerEntityRow};
use crate::model::ids::{EntityId, NodeId, WorkingCopyId};
use crate::plugin::registry::{LifecycleOperation, PluginRegistry};
use crate::repo::entity_repo::{self, EntityRepoResult, EntityWorkingCopyRow};
use crate::repo::working_copy_repo;
use log::debug;
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Inserts a stub row for every registered peer entity lacking one.
///
/// Group and relational entities are not auto-created.
pub fn on_node_create(
    conn: &Connection,
    registry: &PluginRegistry,
    node_id: &NodeId,
    node_type: &str,
    now: i64,
) -> EntityRepoResult<()> {
    for entry in registry.entities_for_operation(node_type, LifecycleOperation::Commit) {
        if entry.metadata.entity_kind != EntityKind::Peer {
            continue;
        }
        let table = &entry.metadata.table_name;
        if entity_repo::get_peer(conn, table, node_id)?.is_some() {
            continue;
        }
        let mut stub = serde_json::Map::new();
        stub.insert(
            entry.metadata.relationship.foreign_key_field.clone(),
            serde_json::Value::String(node_id.as_str().to_string()),
        );
        entity_repo::put_peer(
            conn,
            table,
            &PeerEntityRow {
                node_id: node_id.clone(),
                payload: serde_json::Value::Object(stub),
                created_at: now,
                updated_at: now,
            },
        )?;
    }
    Ok(())
}

/// Cascades entity cleanup for one deleted node in delete order, then
/// purges working copies bound to the node.
pub fn on_node_delete(
    conn: &Connection,
    registry: &PluginRegistry,
    node_id: &NodeId,
    node_type: &str,
    now: i64,
) -> EntityRepoResult<()> {
    for entry in registry.entities_for_operation(node_type, LifecycleOperation::Delete) {
        let table = &entry.metadata.table_name;
        match entry.metadata.entity_kind {
            EntityKind::Relational => {
                let Some(management) = &entry.metadata.reference_management else {
                    continue;
                };
                for mut row in entity_repo::list_relational_by_node(conn, table, node_id)? {
                    row.node_ids.retain(|id| id != node_id);
                    row.reference_count = row.node_ids.len() as i64;
                    row.updated_at = now;
                    if row.reference_count == 0 && management.auto_delete_when_zero {
                        entity_repo::delete_relational(conn, table, &row.entity_id)?;
                    } else {
                        entity_repo::put_relational(conn, table, &row)?;
                    }
                }
            }
            EntityKind::Group => {
                if entry.metadata.relationship.cascade_delete {
                    entity_repo::delete_group_by_node(conn, table, node_id)?;
                }
            }
            EntityKind::Peer => {
                if entry.metadata.relationship.cascade_delete {
                    entity_repo::delete_peer(conn, table, node_id)?;
                }
            }
        }
    }

    working_copy_repo::purge_by_source_node(conn, node_id).map_err(|err| {
        crate::repo::entity_repo::EntityRepoError::InvalidData(err.to_string())
    })?;
    entity_repo::purge_entity_working_copies_by_node(conn, node_id)?;
    Ok(())
}

/// Cascades entity state from `source_id` to the freshly cloned
/// `target_id`.
///
/// Peer and group rows are deep-copied with rewritten keys; relational
/// rows gain the clone as another referencing node.
pub fn on_node_duplicate(
    conn: &Connection,
    registry: &PluginRegistry,
    source_id: &NodeId,
    target_id: &NodeId,
    node_type: &str,
    now: i64,
) -> EntityRepoResult<()> {
    for entry in registry.entities_for_operation(node_type, LifecycleOperation::Commit) {
        let table = &entry.metadata.table_name;
        match entry.metadata.entity_kind {
            EntityKind::Peer => {
                if let Some(row) = entity_repo::get_peer(conn, table, source_id)? {
                    let mut payload = row.payload.clone();
                    rewrite_foreign_key(
                        &mut payload,
                        &entry.metadata.relationship.foreign_key_field,
                        target_id,
                    );
                    entity_repo::put_peer(
                        conn,
                        table,
                        &PeerEntityRow {
                            node_id: target_id.clone(),
                            payload,
                            created_at: now,
                            updated_at: now,
                        },
                    )?;
                }
            }
            EntityKind::Group => {
                for row in entity_repo::list_group_by_node(conn, table, source_id)? {
                    let mut payload = row.payload.clone();
                    rewrite_foreign_key(
                        &mut payload,
                        &entry.metadata.relationship.foreign_key_field,
                        target_id,
                    );
                    entity_repo::insert_group(
                        conn,
                        table,
                        &GroupEntityRow {
                            entity_id: EntityId::generate(),
                            node_id: target_id.clone(),
                            payload,
                            created_at: now,
                            updated_at: now,
                        },
                    )?;
                }
            }
            EntityKind::Relational => {
                for mut row in entity_repo::list_relational_by_node(conn, table, source_id)? {
                    if row.node_ids.contains(target_id) {
                        continue;
                    }
                    row.node_ids.push(target_id.clone());
                    row.reference_count = row.node_ids.len() as i64;
                    row.updated_at = now;
                    entity_repo::put_relational(conn, table, &row)?;
                }
            }
        }
    }
    Ok(())
}

/// One open working-copy session: buffered entity rows keyed by the
/// buffering table name.
#[derive(Debug, Default)]
pub struct EntitySession {
    pub entries: BTreeMap<String, EntityWorkingCopyRow>,
}

impl EntitySession {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Opens a session: buffers current entity payloads for every registration
/// with working copies enabled.
pub fn create_working_copies(
    conn: &Connection,
    registry: &PluginRegistry,
    node_id: &NodeId,
    node_type: &str,
    now: i64,
) -> EntityRepoResult<EntitySession> {
    let mut session = EntitySession::default();
    for entry in registry.entities_for_operation(node_type, LifecycleOperation::Commit) {
        let Some(config) = &entry.metadata.working_copy_config else {
            continue;
        };
        if !config.enabled {
            continue;
        }

        let payload = match entry.metadata.entity_kind {
            EntityKind::Peer => entity_repo::get_peer(conn, &entry.metadata.table_name, node_id)?
                .map(|row| row.payload)
                .unwrap_or_else(|| serde_json::json!({})),
            EntityKind::Group => {
                let rows = entity_repo::list_group_by_node(
                    conn,
                    &entry.metadata.table_name,
                    node_id,
                )?;
                serde_json::json!(rows
                    .into_iter()
                    .map(|row| row.payload)
                    .collect::<Vec<_>>())
            }
            // Relational rows are shared; buffering them per node would
            // fork shared state, so sessions skip them.
            EntityKind::Relational => {
                debug!(
                    "event=entity_session module=plugin status=skip kind=relational table={}",
                    entry.metadata.table_name
                );
                continue;
            }
        };

        let row = EntityWorkingCopyRow {
            working_copy_id: WorkingCopyId::generate(),
            node_id: node_id.clone(),
            payload,
            copied_at: now,
            updated_at: now,
        };
        entity_repo::insert_entity_working_copy(conn, &config.table_name, &row)?;
        session.entries.insert(config.table_name.clone(), row);
    }
    Ok(session)
}

/// Rebuilds the open session for one node from the ephemeral store.
///
/// Returns an empty session when nothing is buffered, so callers can use
/// it unconditionally before commit or discard.
pub fn load_session(
    conn: &Connection,
    registry: &PluginRegistry,
    node_id: &NodeId,
    node_type: &str,
) -> EntityRepoResult<EntitySession> {
    let mut session = EntitySession::default();
    for entry in registry.entities_for_operation(node_type, LifecycleOperation::Commit) {
        let Some(config) = &entry.metadata.working_copy_config else {
            continue;
        };
        if !config.enabled {
            continue;
        }
        let mut rows =
            entity_repo::list_entity_working_copies_by_node(conn, &config.table_name, node_id)?;
        if let Some(row) = rows.pop() {
            session.entries.insert(config.table_name.clone(), row);
        }
    }
    Ok(session)
}

/// Commits a session in commit order: buffered payloads are written back
/// to the entity tables and the buffers removed.
pub fn commit_working_copies(
    conn: &Connection,
    registry: &PluginRegistry,
    node_type: &str,
    session: &EntitySession,
    now: i64,
) -> EntityRepoResult<()> {
    for entry in registry.entities_for_operation(node_type, LifecycleOperation::Commit) {
        let Some(config) = &entry.metadata.working_copy_config else {
            continue;
        };
        let Some(buffered) = session.entries.get(&config.table_name) else {
            continue;
        };

        match entry.metadata.entity_kind {
            EntityKind::Peer => {
                entity_repo::put_peer(
                    conn,
                    &entry.metadata.table_name,
                    &PeerEntityRow {
                        node_id: buffered.node_id.clone(),
                        payload: buffered.payload.clone(),
                        created_at: buffered.copied_at,
                        updated_at: now,
                    },
                )?;
            }
            EntityKind::Group => {
                // Replace-set semantics: the buffered array is the new row
                // set for this node.
                entity_repo::delete_group_by_node(
                    conn,
                    &entry.metadata.table_name,
                    &buffered.node_id,
                )?;
                let payloads = buffered
                    .payload
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                for payload in payloads {
                    entity_repo::insert_group(
                        conn,
                        &entry.metadata.table_name,
                        &GroupEntityRow {
                            entity_id: EntityId::generate(),
                            node_id: buffered.node_id.clone(),
                            payload,
                            created_at: now,
                            updated_at: now,
                        },
                    )?;
                }
            }
            EntityKind::Relational => {}
        }

        entity_repo::delete_entity_working_copy(
            conn,
            &config.table_name,
            &buffered.working_copy_id,
        )?;
    }
    Ok(())
}

/// Discards a session: buffers are removed without write-back.
pub fn discard_working_copies(
    conn: &Connection,
    session: &EntitySession,
) -> EntityRepoResult<()> {
    for (table_name, row) in &session.entries {
        entity_repo::delete_entity_working_copy(conn, table_name, &row.working_copy_id)?;
    }
    Ok(())
}

fn rewrite_foreign_key(payload: &mut serde_json::Value, field: &str, target: &NodeId) {
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            field.to_string(),
            serde_json::Value::String(target.as_str().to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{on_node_create, on_node_delete, on_node_duplicate};
    use crate::db::open_store_in_memory;
    use crate::model::entity::{
        EntityCardinality, EntityKind, EntityMetadata, EntityRelationship, ReferenceManagement,
        RelationalEntityRow,
    };
    use crate::model::ids::{EntityId, NodeId};
    use crate::plugin::registry::PluginRegistry;
    use crate::repo::entity_repo;

    fn registry_with_all_kinds() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register_entity(
                "map",
                "style",
                EntityMetadata {
                    entity_kind: EntityKind::Peer,
                    table_name: "map_styles".to_string(),
                    relationship: EntityRelationship {
                        cardinality: EntityCardinality::OneToOne,
                        foreign_key_field: "node_id".to_string(),
                        cascade_delete: true,
                    },
                    working_copy_config: None,
                    reference_management: None,
                },
            )
            .unwrap();
        registry
            .register_entity(
                "map",
                "layers",
                EntityMetadata {
                    entity_kind: EntityKind::Group,
                    table_name: "map_layers".to_string(),
                    relationship: EntityRelationship {
                        cardinality: EntityCardinality::OneToMany,
                        foreign_key_field: "node_id".to_string(),
                        cascade_delete: true,
                    },
                    working_copy_config: None,
                    reference_management: None,
                },
            )
            .unwrap();
        registry
            .register_entity(
                "map",
                "tilesets",
                EntityMetadata {
                    entity_kind: EntityKind::Relational,
                    table_name: "map_tilesets".to_string(),
                    relationship: EntityRelationship {
                        cardinality: EntityCardinality::ManyToMany,
                        foreign_key_field: "node_ids".to_string(),
                        cascade_delete: true,
                    },
                    working_copy_config: None,
                    reference_management: Some(ReferenceManagement {
                        count_field: "reference_count".to_string(),
                        node_list_field: "node_ids".to_string(),
                        auto_delete_when_zero: true,
                    }),
                },
            )
            .unwrap();
        registry
    }

    #[test]
    fn create_inserts_peer_stub_once() {
        let conn = open_store_in_memory().unwrap();
        let registry = registry_with_all_kinds();
        let node = NodeId::new("n1");

        on_node_create(&conn, &registry, &node, "map", 10).unwrap();
        let stub = entity_repo::get_peer(&conn, "map_styles", &node)
            .unwrap()
            .unwrap();
        assert_eq!(stub.payload["node_id"], "n1");

        // Re-running must not overwrite an existing row.
        let mut edited = stub.clone();
        edited.payload = serde_json::json!({ "node_id": "n1", "color": "red" });
        entity_repo::put_peer(&conn, "map_styles", &edited).unwrap();
        on_node_create(&conn, &registry, &node, "map", 11).unwrap();
        let kept = entity_repo::get_peer(&conn, "map_styles", &node)
            .unwrap()
            .unwrap();
        assert_eq!(kept.payload["color"], "red");

        // Group and relational entities are not auto-created.
        assert!(entity_repo::list_group_by_node(&conn, "map_layers", &node)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_decrements_references_and_auto_deletes_at_zero() {
        let conn = open_store_in_memory().unwrap();
        let registry = registry_with_all_kinds();
        let keep = NodeId::new("keep");
        let gone = NodeId::new("gone");

        let shared = RelationalEntityRow {
            entity_id: EntityId::generate(),
            reference_count: 2,
            node_ids: vec![keep.clone(), gone.clone()],
            payload: serde_json::json!({}),
            created_at: 1,
            updated_at: 1,
        };
        entity_repo::put_relational(&conn, "map_tilesets", &shared).unwrap();

        on_node_delete(&conn, &registry, &gone, "map", 10).unwrap();
        let after = entity_repo::get_relational(&conn, "map_tilesets", &shared.entity_id)
            .unwrap()
            .unwrap();
        assert_eq!(after.reference_count, 1);
        assert_eq!(after.node_ids, vec![keep.clone()]);

        on_node_delete(&conn, &registry, &keep, "map", 11).unwrap();
        assert!(
            entity_repo::get_relational(&conn, "map_tilesets", &shared.entity_id)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn duplicate_copies_peer_and_references_relational() {
        let conn = open_store_in_memory().unwrap();
        let registry = registry_with_all_kinds();
        let source = NodeId::new("src");
        let clone = NodeId::new("dst");

        on_node_create(&conn, &registry, &source, "map", 1).unwrap();
        let shared = RelationalEntityRow {
            entity_id: EntityId::generate(),
            reference_count: 1,
            node_ids: vec![source.clone()],
            payload: serde_json::json!({ "tiles": "osm" }),
            created_at: 1,
            updated_at: 1,
        };
        entity_repo::put_relational(&conn, "map_tilesets", &shared).unwrap();

        on_node_duplicate(&conn, &registry, &source, &clone, "map", 5).unwrap();

        let copied = entity_repo::get_peer(&conn, "map_styles", &clone)
            .unwrap()
            .unwrap();
        assert_eq!(copied.payload["node_id"], "dst");

        let referenced = entity_repo::get_relational(&conn, "map_tilesets", &shared.entity_id)
            .unwrap()
            .unwrap();
        assert_eq!(referenced.reference_count, 2);
        assert!(referenced.node_ids.contains(&clone));
        // The shared row itself was not duplicated.
        assert_eq!(
            entity_repo::list_relational(&conn, "map_tilesets").unwrap().len(),
            1
        );
    }
}
