//! Durable forest repository: trees, nodes and their secondary indexes.
//!
//! # Responsibility
//! - Provide persistence APIs for the tree/node forest.
//! - Keep SQL details and ordering behavior inside the repository boundary.
//! - Return one change record per atomic node mutation so callers can
//!   publish them after commit.
//!
//! # Invariants
//! - Every mutation validates the node before touching SQL.
//! - Child listing is deterministic: `name ASC, node_id ASC` unless the
//!   caller sorts otherwise.
//! - Seeding is idempotent: it only runs when `trees` is empty.

use crate::db::DbError;
use crate::model::event::ChangeRecord;
use crate::model::ids::{parse_tree_id, NodeId, TreeId};
use crate::model::node::{
    NodeValidationError, Tree, TreeNode, MAX_TREE_DEPTH, NODE_TYPE_ROOT, NODE_TYPE_SUPER_ROOT,
    NODE_TYPE_TRASH,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

const NODE_SELECT_SQL: &str = "SELECT
    node_id,
    parent_node_id,
    node_type,
    name,
    description,
    created_at,
    updated_at,
    version,
    original_parent_node_id,
    original_name,
    removed_at,
    is_removed
FROM nodes";

/// Result type used by forest repository operations.
pub type NodeRepoResult<T> = Result<T, NodeRepoError>;

/// Errors from forest repository operations.
#[derive(Debug)]
pub enum NodeRepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Target node does not exist.
    NodeNotFound(NodeId),
    /// Node record fails structural validation.
    Validation(NodeValidationError),
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for NodeRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NodeNotFound(id) => write!(f, "node not found: {id}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid forest data: {message}"),
        }
    }
}

impl Error for NodeRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::NodeNotFound(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for NodeRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for NodeRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<NodeValidationError> for NodeRepoError {
    fn from(value: NodeValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Repository contract for forest reads and single-row writes.
pub trait NodeRepository {
    /// Loads one node by id.
    fn get_node(&self, node_id: &NodeId) -> NodeRepoResult<Option<TreeNode>>;
    /// Loads one node, failing with `NodeNotFound` on miss.
    fn get_node_required(&self, node_id: &NodeId) -> NodeRepoResult<TreeNode>;
    /// Lists children under one parent, optionally including trashed rows.
    fn list_children(
        &self,
        parent_node_id: &NodeId,
        include_trashed: bool,
    ) -> NodeRepoResult<Vec<TreeNode>>;
    /// Collects live sibling names under one parent, optionally excluding
    /// one node (the node being updated).
    fn sibling_names(
        &self,
        parent_node_id: &NodeId,
        exclude: Option<&NodeId>,
    ) -> NodeRepoResult<HashSet<String>>;
    /// Loads one tree record.
    fn get_tree(&self, tree_id: TreeId) -> NodeRepoResult<Option<Tree>>;
    /// Lists all trees in seed order.
    fn list_trees(&self) -> NodeRepoResult<Vec<Tree>>;
    /// Inserts one node and returns its change record.
    fn insert_node(&self, node: &TreeNode) -> NodeRepoResult<ChangeRecord>;
    /// Overwrites one node and returns its change record.
    fn update_node(&self, node: &TreeNode) -> NodeRepoResult<ChangeRecord>;
    /// Hard-deletes one node and returns its change record.
    fn delete_node(&self, node_id: &NodeId) -> NodeRepoResult<ChangeRecord>;
}

/// SQLite-backed forest repository.
pub struct SqliteNodeRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteNodeRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl NodeRepository for SqliteNodeRepository<'_> {
    fn get_node(&self, node_id: &NodeId) -> NodeRepoResult<Option<TreeNode>> {
        get_node(self.conn, node_id)
    }

    fn get_node_required(&self, node_id: &NodeId) -> NodeRepoResult<TreeNode> {
        get_node_required(self.conn, node_id)
    }

    fn list_children(
        &self,
        parent_node_id: &NodeId,
        include_trashed: bool,
    ) -> NodeRepoResult<Vec<TreeNode>> {
        list_children(self.conn, parent_node_id, include_trashed)
    }

    fn sibling_names(
        &self,
        parent_node_id: &NodeId,
        exclude: Option<&NodeId>,
    ) -> NodeRepoResult<HashSet<String>> {
        sibling_names(self.conn, parent_node_id, exclude)
    }

    fn get_tree(&self, tree_id: TreeId) -> NodeRepoResult<Option<Tree>> {
        get_tree(self.conn, tree_id)
    }

    fn list_trees(&self) -> NodeRepoResult<Vec<Tree>> {
        list_trees(self.conn)
    }

    fn insert_node(&self, node: &TreeNode) -> NodeRepoResult<ChangeRecord> {
        insert_node(self.conn, node)
    }

    fn update_node(&self, node: &TreeNode) -> NodeRepoResult<ChangeRecord> {
        update_node(self.conn, node)
    }

    fn delete_node(&self, node_id: &NodeId) -> NodeRepoResult<ChangeRecord> {
        delete_node(self.conn, node_id)
    }
}

/// Loads one node by id.
pub fn get_node(conn: &Connection, node_id: &NodeId) -> NodeRepoResult<Option<TreeNode>> {
    let mut stmt = conn.prepare(&format!("{NODE_SELECT_SQL} WHERE node_id = ?1;"))?;
    let mut rows = stmt.query([node_id.as_str()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_node_row(row)?));
    }
    Ok(None)
}

/// Loads one node, failing with [`NodeRepoError::NodeNotFound`] on miss.
pub fn get_node_required(conn: &Connection, node_id: &NodeId) -> NodeRepoResult<TreeNode> {
    get_node(conn, node_id)?.ok_or_else(|| NodeRepoError::NodeNotFound(node_id.clone()))
}

/// Lists children under one parent via the parent index.
pub fn list_children(
    conn: &Connection,
    parent_node_id: &NodeId,
    include_trashed: bool,
) -> NodeRepoResult<Vec<TreeNode>> {
    let sql = if include_trashed {
        format!(
            "{NODE_SELECT_SQL}
             WHERE parent_node_id = ?1 AND node_id != ?1
             ORDER BY name ASC, node_id ASC;"
        )
    } else {
        format!(
            "{NODE_SELECT_SQL}
             WHERE parent_node_id = ?1 AND node_id != ?1 AND is_removed = 0
             ORDER BY name ASC, node_id ASC;"
        )
    };

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([parent_node_id.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_node_row(row)?);
    }
    Ok(items)
}

/// Collects live sibling names under one parent.
pub fn sibling_names(
    conn: &Connection,
    parent_node_id: &NodeId,
    exclude: Option<&NodeId>,
) -> NodeRepoResult<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM nodes
         WHERE parent_node_id = ?1
           AND node_id != ?1
           AND is_removed = 0
           AND (?2 IS NULL OR node_id != ?2);",
    )?;
    let mut rows = stmt.query(params![
        parent_node_id.as_str(),
        exclude.map(|id| id.as_str()),
    ])?;

    let mut names = HashSet::new();
    while let Some(row) = rows.next()? {
        names.insert(row.get::<_, String>(0)?);
    }
    Ok(names)
}

/// Lists trashed nodes whose pre-trash parent was `original_parent`.
pub fn list_by_original_parent(
    conn: &Connection,
    original_parent: &NodeId,
) -> NodeRepoResult<Vec<TreeNode>> {
    let mut stmt = conn.prepare(&format!(
        "{NODE_SELECT_SQL}
         WHERE original_parent_node_id = ?1
         ORDER BY removed_at ASC, node_id ASC;"
    ))?;
    let mut rows = stmt.query([original_parent.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_node_row(row)?);
    }
    Ok(items)
}

/// Lists trashed nodes removed inside `[since, until)` via the removed-at
/// index.
pub fn list_removed_between(
    conn: &Connection,
    since: i64,
    until: i64,
) -> NodeRepoResult<Vec<TreeNode>> {
    let mut stmt = conn.prepare(&format!(
        "{NODE_SELECT_SQL}
         WHERE removed_at IS NOT NULL AND removed_at >= ?1 AND removed_at < ?2
         ORDER BY removed_at ASC, node_id ASC;"
    ))?;
    let mut rows = stmt.query(params![since, until])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_node_row(row)?);
    }
    Ok(items)
}

/// Lists children ordered by `updated_at` via the composite index.
pub fn list_children_by_updated(
    conn: &Connection,
    parent_node_id: &NodeId,
    descending: bool,
) -> NodeRepoResult<Vec<TreeNode>> {
    let direction = if descending { "DESC" } else { "ASC" };
    let mut stmt = conn.prepare(&format!(
        "{NODE_SELECT_SQL}
         WHERE parent_node_id = ?1 AND node_id != ?1 AND is_removed = 0
         ORDER BY updated_at {direction}, node_id ASC;"
    ))?;
    let mut rows = stmt.query([parent_node_id.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_node_row(row)?);
    }
    Ok(items)
}

/// Inserts one node row.
pub fn insert_node(conn: &Connection, node: &TreeNode) -> NodeRepoResult<ChangeRecord> {
    node.validate()?;
    let now = crate::model::now_ms();

    conn.execute(
        "INSERT INTO nodes (
            node_id,
            parent_node_id,
            node_type,
            name,
            description,
            created_at,
            updated_at,
            version,
            original_parent_node_id,
            original_name,
            removed_at,
            is_removed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
        params![
            node.id.as_str(),
            node.parent_node_id.as_str(),
            node.node_type,
            node.name,
            node.description,
            node.created_at,
            node.updated_at,
            node.version,
            node.original_parent_node_id.as_ref().map(NodeId::as_str),
            node.original_name,
            node.removed_at,
            i64::from(node.is_removed),
        ],
    )?;

    Ok(ChangeRecord::created(node.clone(), now))
}

/// Inserts many node rows, returning their change records in input order.
pub fn bulk_insert_nodes(
    conn: &Connection,
    nodes: &[TreeNode],
) -> NodeRepoResult<Vec<ChangeRecord>> {
    let mut records = Vec::with_capacity(nodes.len());
    for node in nodes {
        records.push(insert_node(conn, node)?);
    }
    Ok(records)
}

/// Overwrites one node row with the provided state.
pub fn update_node(conn: &Connection, node: &TreeNode) -> NodeRepoResult<ChangeRecord> {
    node.validate()?;
    let previous = get_node_required(conn, &node.id)?;
    let now = crate::model::now_ms();

    conn.execute(
        "UPDATE nodes SET
            parent_node_id = ?2,
            node_type = ?3,
            name = ?4,
            description = ?5,
            created_at = ?6,
            updated_at = ?7,
            version = ?8,
            original_parent_node_id = ?9,
            original_name = ?10,
            removed_at = ?11,
            is_removed = ?12
         WHERE node_id = ?1;",
        params![
            node.id.as_str(),
            node.parent_node_id.as_str(),
            node.node_type,
            node.name,
            node.description,
            node.created_at,
            node.updated_at,
            node.version,
            node.original_parent_node_id.as_ref().map(NodeId::as_str),
            node.original_name,
            node.removed_at,
            i64::from(node.is_removed),
        ],
    )?;

    Ok(ChangeRecord::updated(previous, node.clone(), now))
}

/// Hard-deletes one node row.
pub fn delete_node(conn: &Connection, node_id: &NodeId) -> NodeRepoResult<ChangeRecord> {
    let previous = get_node_required(conn, node_id)?;
    let now = crate::model::now_ms();
    conn.execute("DELETE FROM nodes WHERE node_id = ?1;", [node_id.as_str()])?;
    Ok(ChangeRecord::deleted(previous, now))
}

/// Loads one tree record.
pub fn get_tree(conn: &Connection, tree_id: TreeId) -> NodeRepoResult<Option<Tree>> {
    let tree = conn
        .query_row(
            "SELECT tree_id, name, super_root_node_id, root_node_id, trash_root_node_id
             FROM trees WHERE tree_id = ?1;",
            [tree_id.as_str()],
            parse_tree_row,
        )
        .optional()?;
    tree.transpose()
}

/// Lists all trees in seed order.
pub fn list_trees(conn: &Connection) -> NodeRepoResult<Vec<Tree>> {
    let mut stmt = conn.prepare(
        "SELECT tree_id, name, super_root_node_id, root_node_id, trash_root_node_id
         FROM trees ORDER BY tree_id ASC;",
    )?;
    let mut rows = stmt.query([])?;
    let mut trees = Vec::new();
    while let Some(row) = rows.next()? {
        trees.push(parse_tree_row(row)??);
    }
    Ok(trees)
}

/// Resolves the tree containing `node_id` by walking to its super-root.
pub fn containing_tree(conn: &Connection, node_id: &NodeId) -> NodeRepoResult<Option<Tree>> {
    let mut visited = HashSet::new();
    let mut cursor = get_node(conn, node_id)?;

    while let Some(node) = cursor {
        if !visited.insert(node.id.clone()) || visited.len() > MAX_TREE_DEPTH {
            return Ok(None);
        }
        if node.is_super_root() {
            for tree in list_trees(conn)? {
                if tree.super_root_node_id == node.id {
                    return Ok(Some(tree));
                }
            }
            return Ok(None);
        }
        cursor = get_node(conn, &node.parent_node_id)?;
    }

    Ok(None)
}

/// Seeds the two default trees with super-root, root and trash-root nodes.
///
/// Runs only when `trees` is empty, so re-opening an existing store is a
/// no-op.
pub fn seed_forest(conn: &Connection, now: i64) -> NodeRepoResult<Vec<ChangeRecord>> {
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM trees;", [], |row| row.get(0))?;
    if existing > 0 {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for tree_id in TreeId::all() {
        let tree = Tree::seed(tree_id);
        conn.execute(
            "INSERT INTO trees (
                tree_id, name, super_root_node_id, root_node_id, trash_root_node_id
            ) VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                tree.id.as_str(),
                tree.name,
                tree.super_root_node_id.as_str(),
                tree.root_node_id.as_str(),
                tree.trash_root_node_id.as_str(),
            ],
        )?;

        // Super-root is its own parent so root and trash root share a
        // parent entry.
        let super_root = TreeNode::new(
            tree.super_root_node_id.clone(),
            tree.super_root_node_id.clone(),
            NODE_TYPE_SUPER_ROOT,
            format!("{} Super Root", tree.name),
            now,
        );
        let root = TreeNode::new(
            tree.root_node_id.clone(),
            tree.super_root_node_id.clone(),
            NODE_TYPE_ROOT,
            tree.name.clone(),
            now,
        );
        let trash_root = TreeNode::new(
            tree.trash_root_node_id.clone(),
            tree.super_root_node_id.clone(),
            NODE_TYPE_TRASH,
            "Trash".to_string(),
            now,
        );

        for node in [super_root, root, trash_root] {
            records.push(insert_node(conn, &node)?);
        }
    }

    Ok(records)
}

fn parse_tree_row(row: &Row<'_>) -> rusqlite::Result<NodeRepoResult<Tree>> {
    let tree_id_text: String = row.get(0)?;
    let name: String = row.get(1)?;
    let super_root: String = row.get(2)?;
    let root: String = row.get(3)?;
    let trash_root: String = row.get(4)?;

    Ok(match parse_tree_id(&tree_id_text) {
        Ok(tree_id) => Ok(Tree {
            id: tree_id,
            name,
            super_root_node_id: NodeId::new(super_root),
            root_node_id: NodeId::new(root),
            trash_root_node_id: NodeId::new(trash_root),
        }),
        Err(err) => Err(NodeRepoError::InvalidData(format!(
            "{err} in trees.tree_id"
        ))),
    })
}

fn parse_node_row(row: &Row<'_>) -> NodeRepoResult<TreeNode> {
    let is_removed = match row.get::<_, i64>("is_removed")? {
        0 => false,
        1 => true,
        other => {
            return Err(NodeRepoError::InvalidData(format!(
                "invalid is_removed value `{other}` in nodes.is_removed"
            )));
        }
    };

    let node = TreeNode {
        id: NodeId::new(row.get::<_, String>("node_id")?),
        parent_node_id: NodeId::new(row.get::<_, String>("parent_node_id")?),
        node_type: row.get("node_type")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        version: row.get("version")?,
        original_parent_node_id: row
            .get::<_, Option<String>>("original_parent_node_id")?
            .map(NodeId::new),
        original_name: row.get("original_name")?,
        removed_at: row.get("removed_at")?,
        is_removed,
    };

    node.validate()
        .map_err(|err| NodeRepoError::InvalidData(err.to_string()))?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::{
        bulk_insert_nodes, containing_tree, get_node, insert_node, list_by_original_parent,
        list_children, list_children_by_updated, list_removed_between, seed_forest, sibling_names,
    };
    use crate::db::open_store_in_memory;
    use crate::model::ids::{NodeId, TreeId};
    use crate::model::node::{TreeNode, NODE_TYPE_FOLDER};

    fn setup() -> rusqlite::Connection {
        let conn = open_store_in_memory().unwrap();
        seed_forest(&conn, 1_000).unwrap();
        conn
    }

    #[test]
    fn seeding_is_idempotent() {
        let conn = setup();
        let second_pass = seed_forest(&conn, 2_000).unwrap();
        assert!(second_pass.is_empty());

        let node_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM nodes;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(node_count, 6);
    }

    #[test]
    fn roots_share_the_super_root_parent() {
        let conn = setup();
        let children = list_children(&conn, &TreeId::Resources.super_root_node_id(), true).unwrap();
        let ids: Vec<_> = children.iter().map(|node| node.id.as_str()).collect();
        assert!(ids.contains(&"r:root"));
        assert!(ids.contains(&"r:trash"));
    }

    #[test]
    fn containing_tree_walks_to_super_root() {
        let conn = setup();
        let node = TreeNode::new(
            NodeId::generate(),
            TreeId::Projects.root_node_id(),
            NODE_TYPE_FOLDER,
            "Alpha",
            1_500,
        );
        insert_node(&conn, &node).unwrap();

        let tree = containing_tree(&conn, &node.id).unwrap().unwrap();
        assert_eq!(tree.id, TreeId::Projects);
    }

    #[test]
    fn secondary_indexes_answer_trash_and_recency_scans() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        let trash = TreeId::Resources.trash_root_node_id();

        let mut early = TreeNode::new(NodeId::generate(), root.clone(), NODE_TYPE_FOLDER, "early", 1);
        let mut late = TreeNode::new(NodeId::generate(), root.clone(), NODE_TYPE_FOLDER, "late", 1);
        early.updated_at = 100;
        late.updated_at = 200;
        bulk_insert_nodes(&conn, &[early.clone(), late.clone()]).unwrap();

        let by_recency = list_children_by_updated(&conn, &root, true).unwrap();
        assert_eq!(by_recency[0].id, late.id);
        assert_eq!(by_recency[1].id, early.id);

        early.mark_trashed(trash, 500);
        super::update_node(&conn, &early).unwrap();

        let from_root = list_by_original_parent(&conn, &root).unwrap();
        assert_eq!(from_root.len(), 1);
        assert_eq!(from_root[0].id, early.id);

        assert_eq!(list_removed_between(&conn, 400, 600).unwrap().len(), 1);
        assert!(list_removed_between(&conn, 600, 700).unwrap().is_empty());
    }

    #[test]
    fn sibling_names_skip_trashed_and_excluded_rows() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();

        let mut live = TreeNode::new(NodeId::generate(), root.clone(), NODE_TYPE_FOLDER, "A", 1);
        let mut gone = TreeNode::new(NodeId::generate(), root.clone(), NODE_TYPE_FOLDER, "B", 1);
        insert_node(&conn, &live).unwrap();
        gone.mark_trashed(TreeId::Resources.trash_root_node_id(), 2);
        insert_node(&conn, &gone).unwrap();

        let names = sibling_names(&conn, &root, None).unwrap();
        assert!(names.contains("A"));
        assert!(!names.contains("B"));

        live.name = "A2".to_string();
        let excluding = sibling_names(&conn, &root, Some(&live.id)).unwrap();
        assert!(excluding.is_empty());

        assert!(get_node(&conn, &gone.id).unwrap().unwrap().is_trashed());
    }
}
