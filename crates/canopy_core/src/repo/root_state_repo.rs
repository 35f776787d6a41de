//! Persisted root view-state repository.
//!
//! # Responsibility
//! - Store per-tree expanded/collapsed maps tied to a root or trash root.
//!
//! # Invariants
//! - One row per `(tree_id, root_node_type)`.
//! - The expanded map is stored as a JSON object keyed by node id.

use crate::model::ids::{parse_tree_id, NodeId, TreeId};
use crate::model::node::{NodeType, TreeRootState};
use crate::repo::node_repo::{NodeRepoError, NodeRepoResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

/// Loads the persisted state for one tree root, if any.
pub fn get_root_state(
    conn: &Connection,
    tree_id: TreeId,
    root_node_type: &str,
) -> NodeRepoResult<Option<TreeRootState>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT tree_id, expanded FROM root_states
             WHERE tree_id = ?1 AND root_node_type = ?2;",
            params![tree_id.as_str(), root_node_type],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((tree_id_text, expanded_json)) = row else {
        return Ok(None);
    };

    let tree_id = parse_tree_id(&tree_id_text)
        .map_err(|err| NodeRepoError::InvalidData(format!("{err} in root_states.tree_id")))?;
    let raw: BTreeMap<String, bool> = serde_json::from_str(&expanded_json).map_err(|err| {
        NodeRepoError::InvalidData(format!("invalid expanded map json: {err}"))
    })?;

    Ok(Some(TreeRootState {
        tree_id,
        root_node_type: NodeType::from(root_node_type),
        expanded: raw.into_iter().map(|(k, v)| (NodeId::new(k), v)).collect(),
    }))
}

/// Upserts the persisted state for one tree root.
pub fn put_root_state(
    conn: &Connection,
    state: &TreeRootState,
    now: i64,
) -> NodeRepoResult<()> {
    let raw: BTreeMap<&str, bool> = state
        .expanded
        .iter()
        .map(|(id, expanded)| (id.as_str(), *expanded))
        .collect();
    let expanded_json = serde_json::to_string(&raw)
        .map_err(|err| NodeRepoError::InvalidData(format!("expanded map encode: {err}")))?;

    conn.execute(
        "INSERT INTO root_states (tree_id, root_node_type, expanded, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (tree_id, root_node_type)
         DO UPDATE SET expanded = ?3, updated_at = ?4;",
        params![
            state.tree_id.as_str(),
            state.root_node_type,
            expanded_json,
            now,
        ],
    )?;
    Ok(())
}

/// Flips one node's expansion flag inside a root's persisted state.
pub fn set_node_expanded(
    conn: &Connection,
    tree_id: TreeId,
    root_node_type: &str,
    node_id: &NodeId,
    expanded: bool,
    now: i64,
) -> NodeRepoResult<TreeRootState> {
    let mut state = get_root_state(conn, tree_id, root_node_type)?
        .unwrap_or_else(|| TreeRootState::empty(tree_id, root_node_type));
    if expanded {
        state.expanded.insert(node_id.clone(), true);
    } else {
        state.expanded.remove(node_id);
    }
    put_root_state(conn, &state, now)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::{get_root_state, set_node_expanded};
    use crate::db::open_store_in_memory;
    use crate::model::ids::{NodeId, TreeId};
    use crate::model::node::NODE_TYPE_ROOT;

    #[test]
    fn expansion_flags_round_trip() {
        let conn = open_store_in_memory().unwrap();
        let node = NodeId::new("some-folder");

        assert!(get_root_state(&conn, TreeId::Resources, NODE_TYPE_ROOT)
            .unwrap()
            .is_none());

        let state =
            set_node_expanded(&conn, TreeId::Resources, NODE_TYPE_ROOT, &node, true, 10).unwrap();
        assert_eq!(state.expanded.get(&node), Some(&true));

        let reloaded = get_root_state(&conn, TreeId::Resources, NODE_TYPE_ROOT)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.expanded.get(&node), Some(&true));

        let cleared =
            set_node_expanded(&conn, TreeId::Resources, NODE_TYPE_ROOT, &node, false, 11).unwrap();
        assert!(cleared.expanded.is_empty());
    }
}
