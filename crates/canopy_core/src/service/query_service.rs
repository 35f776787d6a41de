//! Read-path service: lookups, traversals, search and copy/export
//! materialisation.
//!
//! # Responsibility
//! - Serve every non-mutating query over the forest.
//! - Keep traversal bounds (depth, node caps) enforced above the
//!   repository layer.
//!
//! # Invariants
//! - Descendant traversal is breadth-first with a visited set and never
//!   recurses past the depth bound.
//! - Ancestor walks terminate within `max_tree_depth` hops even on
//!   corrupted (cyclic) data.
//! - Copy/export never materialise more than `max_copy_nodes` rows.

use crate::config::CoreConfig;
use crate::model::command::ErrorCode;
use crate::model::ids::NodeId;
use crate::model::node::{NodeType, TreeNode};
use crate::repo::node_repo::{NodeRepoError, NodeRepository};
use regex::RegexBuilder;
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};

const DEFAULT_SEARCH_RESULTS: usize = 100;
const MAX_ID_LENGTH: usize = 255;

/// Result type for query service operations.
pub type QueryServiceResult<T> = Result<T, QueryServiceError>;

/// Errors from query service operations.
#[derive(Debug)]
pub enum QueryServiceError {
    /// Caller passed an empty or oversized id.
    InvalidId(String),
    /// Input or materialised set exceeds a configured cap.
    LimitExceeded {
        what: &'static str,
        actual: usize,
        max: usize,
    },
    /// No input ids were provided.
    EmptyInput,
    /// Search pattern could not be compiled.
    InvalidPattern(String),
    /// Persistence failure.
    Repo(NodeRepoError),
}

impl Display for QueryServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId(id) => write!(f, "invalid node id: `{id}`"),
            Self::LimitExceeded { what, actual, max } => {
                write!(f, "{what} count {actual} exceeds limit {max}")
            }
            Self::EmptyInput => write!(f, "at least one node id is required"),
            Self::InvalidPattern(message) => write!(f, "invalid search pattern: {message}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for QueryServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NodeRepoError> for QueryServiceError {
    fn from(value: NodeRepoError) -> Self {
        Self::Repo(value)
    }
}

impl QueryServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidId(_)
            | Self::LimitExceeded { .. }
            | Self::EmptyInput
            | Self::InvalidPattern(_) => ErrorCode::InvalidOperation,
            Self::Repo(NodeRepoError::NodeNotFound(_)) => ErrorCode::NodeNotFound,
            Self::Repo(_) => ErrorCode::DatabaseError,
        }
    }
}

/// Sort key for child listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildSortBy {
    #[default]
    Name,
    CreatedAt,
    UpdatedAt,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Options for `list_children`.
#[derive(Debug, Clone, Default)]
pub struct ChildListOptions {
    pub sort_by: ChildSortBy,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Options for `list_descendants`.
#[derive(Debug, Clone, Default)]
pub struct DescendantOptions {
    /// Depth bound; direct children are depth 1. `None` means the tree
    /// depth cap.
    pub max_depth: Option<usize>,
    pub include_types: Vec<NodeType>,
    pub exclude_types: Vec<NodeType>,
}

/// Name-match mode for `search_nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Exact,
    Prefix,
    Suffix,
    Partial,
}

/// Search request over one subtree.
#[derive(Debug, Clone)]
pub struct NodeSearchQuery {
    pub root_node_id: NodeId,
    pub query: String,
    pub mode: SearchMode,
    pub case_sensitive: bool,
    pub search_in_description: bool,
    pub max_results: Option<usize>,
}

impl NodeSearchQuery {
    pub fn partial(root_node_id: NodeId, query: impl Into<String>) -> Self {
        Self {
            root_node_id,
            query: query.into(),
            mode: SearchMode::Partial,
            case_sensitive: false,
            search_in_description: false,
            max_results: None,
        }
    }
}

/// Materialised clipboard payload from `copy_nodes`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodesCopyResult {
    /// Always `"nodes-copy"`; identifies the clipboard payload shape.
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub nodes: Vec<TreeNode>,
    pub root_node_ids: Vec<NodeId>,
    pub node_count: usize,
}

/// Export metadata carried next to the node rows.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExportMetadata {
    pub exported_at: i64,
    pub root_node_ids: Vec<NodeId>,
    pub total_nodes: usize,
}

/// Self-describing export payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExportPayload {
    pub nodes: Vec<TreeNode>,
    pub metadata: ExportMetadata,
}

/// Query service facade over a forest repository.
pub struct QueryService<R: NodeRepository> {
    repo: R,
    max_copy_nodes: usize,
    max_tree_depth: usize,
}

impl<R: NodeRepository> QueryService<R> {
    pub fn new(repo: R, config: &CoreConfig) -> Self {
        Self {
            repo,
            max_copy_nodes: config.max_copy_nodes,
            max_tree_depth: config.max_tree_depth,
        }
    }

    /// Loads one node; a miss is `Ok(None)`, not an error.
    pub fn get_node(&self, node_id: &NodeId) -> QueryServiceResult<Option<TreeNode>> {
        validate_id(node_id)?;
        Ok(self.repo.get_node(node_id)?)
    }

    /// Lists live children with optional sort and pagination.
    ///
    /// Name ordering is case-insensitive.
    pub fn list_children(
        &self,
        parent_node_id: &NodeId,
        options: &ChildListOptions,
    ) -> QueryServiceResult<Vec<TreeNode>> {
        validate_id(parent_node_id)?;
        let mut children = self.repo.list_children(parent_node_id, false)?;

        children.sort_by(|a, b| {
            let ordering = match options.sort_by {
                ChildSortBy::Name => a
                    .name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
                    .then_with(|| a.id.cmp(&b.id)),
                ChildSortBy::CreatedAt => a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)),
                ChildSortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)),
            };
            match options.order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        let paged = children
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(paged)
    }

    /// Breadth-first descendant traversal with a depth bound.
    ///
    /// Direct children sit at depth 1; `max_depth = 0` yields nothing. The
    /// type filter applies after collection, so traversal descends through
    /// non-matching parents.
    pub fn list_descendants(
        &self,
        root_node_id: &NodeId,
        options: &DescendantOptions,
    ) -> QueryServiceResult<Vec<TreeNode>> {
        validate_id(root_node_id)?;
        let max_depth = options.max_depth.unwrap_or(self.max_tree_depth);

        let mut collected = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        visited.insert(root_node_id.clone());
        let mut frontier: VecDeque<(NodeId, usize)> = VecDeque::new();
        frontier.push_back((root_node_id.clone(), 0));

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for child in self.repo.list_children(&current, false)? {
                if !visited.insert(child.id.clone()) {
                    continue;
                }
                frontier.push_back((child.id.clone(), depth + 1));
                collected.push(child);
            }
        }

        let filtered = collected
            .into_iter()
            .filter(|node| {
                if !options.include_types.is_empty()
                    && !options.include_types.contains(&node.node_type)
                {
                    return false;
                }
                !options.exclude_types.contains(&node.node_type)
            })
            .collect();
        Ok(filtered)
    }

    /// Walks ancestors from the node's parent up to its super-root.
    ///
    /// The walk stops at an absent or self-referential parent and is
    /// additionally bounded by the tree depth cap, so cyclic stored data
    /// terminates with the prefix traversed.
    pub fn list_ancestors(&self, node_id: &NodeId) -> QueryServiceResult<Vec<TreeNode>> {
        validate_id(node_id)?;
        let node = self.repo.get_node_required(node_id)?;

        let mut ancestors = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        visited.insert(node.id.clone());
        let mut cursor = node;

        while ancestors.len() < self.max_tree_depth {
            if cursor.is_super_root() {
                break;
            }
            let Some(parent) = self.repo.get_node(&cursor.parent_node_id)? else {
                break;
            };
            if !visited.insert(parent.id.clone()) {
                break;
            }
            ancestors.push(parent.clone());
            cursor = parent;
        }

        Ok(ancestors)
    }

    /// Searches node names (optionally descriptions) within one subtree.
    pub fn search_nodes(&self, query: &NodeSearchQuery) -> QueryServiceResult<Vec<TreeNode>> {
        let candidates =
            self.list_descendants(&query.root_node_id, &DescendantOptions::default())?;
        let max_results = query.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS);

        let mut hits = Vec::new();
        match query.mode {
            SearchMode::Partial => {
                let needle = if query.case_sensitive {
                    query.query.clone()
                } else {
                    query.query.to_lowercase()
                };
                for node in candidates {
                    if hits.len() >= max_results {
                        break;
                    }
                    if partial_match(&node, &needle, query.case_sensitive, query.search_in_description)
                    {
                        hits.push(node);
                    }
                }
            }
            SearchMode::Exact | SearchMode::Prefix | SearchMode::Suffix => {
                let escaped = regex::escape(&query.query);
                let pattern = match query.mode {
                    SearchMode::Exact => format!("^{escaped}$"),
                    SearchMode::Prefix => format!("^{escaped}"),
                    SearchMode::Suffix => format!("{escaped}$"),
                    SearchMode::Partial => unreachable!(),
                };
                let matcher = RegexBuilder::new(&pattern)
                    .case_insensitive(!query.case_sensitive)
                    .build()
                    .map_err(|err| QueryServiceError::InvalidPattern(err.to_string()))?;

                for node in candidates {
                    if hits.len() >= max_results {
                        break;
                    }
                    let name_hit = matcher.is_match(&node.name);
                    let description_hit = query.search_in_description
                        && node
                            .description
                            .as_deref()
                            .is_some_and(|description| matcher.is_match(description));
                    if name_hit || description_hit {
                        hits.push(node);
                    }
                }
            }
        }

        Ok(hits)
    }

    /// Materialises the union of each input's subtree (self included) as a
    /// clipboard payload.
    pub fn copy_nodes(&self, node_ids: &[NodeId]) -> QueryServiceResult<NodesCopyResult> {
        let nodes = self.materialise_subtrees(node_ids)?;
        Ok(NodesCopyResult {
            kind: "nodes-copy".to_string(),
            timestamp: crate::model::now_ms(),
            node_count: nodes.len(),
            root_node_ids: node_ids.to_vec(),
            nodes,
        })
    }

    /// Materialises the same traversal as a self-describing export
    /// payload.
    pub fn export_nodes(&self, node_ids: &[NodeId]) -> QueryServiceResult<ExportPayload> {
        let nodes = self.materialise_subtrees(node_ids)?;
        Ok(ExportPayload {
            metadata: ExportMetadata {
                exported_at: crate::model::now_ms(),
                root_node_ids: node_ids.to_vec(),
                total_nodes: nodes.len(),
            },
            nodes,
        })
    }

    fn materialise_subtrees(&self, node_ids: &[NodeId]) -> QueryServiceResult<Vec<TreeNode>> {
        if node_ids.is_empty() {
            return Err(QueryServiceError::EmptyInput);
        }
        if node_ids.len() > self.max_copy_nodes {
            return Err(QueryServiceError::LimitExceeded {
                what: "input node",
                actual: node_ids.len(),
                max: self.max_copy_nodes,
            });
        }
        for node_id in node_ids {
            validate_id(node_id)?;
        }

        let mut materialised: HashMap<NodeId, TreeNode> = HashMap::new();
        let mut order: Vec<NodeId> = Vec::new();
        for node_id in node_ids {
            let root = self.repo.get_node_required(node_id)?;
            if materialised.insert(root.id.clone(), root).is_none() {
                order.push(node_id.clone());
            }
            for descendant in self.list_descendants(node_id, &DescendantOptions::default())? {
                if materialised
                    .insert(descendant.id.clone(), descendant.clone())
                    .is_none()
                {
                    order.push(descendant.id);
                }
            }
            if materialised.len() > self.max_copy_nodes {
                return Err(QueryServiceError::LimitExceeded {
                    what: "materialised node",
                    actual: materialised.len(),
                    max: self.max_copy_nodes,
                });
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| materialised.remove(&id))
            .collect())
    }
}

fn partial_match(
    node: &TreeNode,
    needle: &str,
    case_sensitive: bool,
    search_in_description: bool,
) -> bool {
    let name_hit = if case_sensitive {
        node.name.contains(needle)
    } else {
        node.name.to_lowercase().contains(needle)
    };
    if name_hit {
        return true;
    }
    if !search_in_description {
        return false;
    }
    node.description.as_deref().is_some_and(|description| {
        if case_sensitive {
            description.contains(needle)
        } else {
            description.to_lowercase().contains(needle)
        }
    })
}

fn validate_id(node_id: &NodeId) -> QueryServiceResult<()> {
    if node_id.as_str().is_empty() {
        return Err(QueryServiceError::InvalidId(String::new()));
    }
    if node_id.as_str().len() > MAX_ID_LENGTH {
        let prefix: String = node_id.as_str().chars().take(32).collect();
        return Err(QueryServiceError::InvalidId(format!("{prefix}...")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        ChildListOptions, ChildSortBy, DescendantOptions, NodeSearchQuery, QueryService,
        QueryServiceError, SearchMode, SortOrder,
    };
    use crate::config::CoreConfig;
    use crate::db::open_store_in_memory;
    use crate::model::ids::{NodeId, TreeId};
    use crate::model::node::{TreeNode, NODE_TYPE_FOLDER};
    use crate::repo::node_repo::{self, SqliteNodeRepository};

    fn setup() -> rusqlite::Connection {
        let conn = open_store_in_memory().unwrap();
        node_repo::seed_forest(&conn, 1_000).unwrap();
        conn
    }

    fn insert(conn: &rusqlite::Connection, parent: &NodeId, name: &str, at: i64) -> TreeNode {
        let node = TreeNode::new(
            NodeId::generate(),
            parent.clone(),
            NODE_TYPE_FOLDER,
            name,
            at,
        );
        node_repo::insert_node(conn, &node).unwrap();
        node
    }

    #[test]
    fn children_sort_case_insensitively_and_paginate() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        insert(&conn, &root, "banana", 1);
        insert(&conn, &root, "Apple", 2);
        insert(&conn, &root, "cherry", 3);

        let service = QueryService::new(SqliteNodeRepository::new(&conn), &CoreConfig::default());
        let names: Vec<_> = service
            .list_children(&root, &ChildListOptions::default())
            .unwrap()
            .into_iter()
            .map(|node| node.name)
            .collect();
        assert_eq!(names, vec!["Apple", "banana", "cherry"]);

        let paged: Vec<_> = service
            .list_children(
                &root,
                &ChildListOptions {
                    sort_by: ChildSortBy::CreatedAt,
                    order: SortOrder::Descending,
                    limit: Some(2),
                    offset: 1,
                },
            )
            .unwrap()
            .into_iter()
            .map(|node| node.name)
            .collect();
        assert_eq!(paged, vec!["Apple", "banana"]);
    }

    #[test]
    fn descendants_respect_depth_bound() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        let level1 = insert(&conn, &root, "level1", 1);
        let level2 = insert(&conn, &level1.id, "level2", 2);
        insert(&conn, &level2.id, "level3", 3);

        let service = QueryService::new(SqliteNodeRepository::new(&conn), &CoreConfig::default());

        let none = service
            .list_descendants(&root, &DescendantOptions {
                max_depth: Some(0),
                ..DescendantOptions::default()
            })
            .unwrap();
        assert!(none.is_empty());

        let shallow = service
            .list_descendants(&root, &DescendantOptions {
                max_depth: Some(1),
                ..DescendantOptions::default()
            })
            .unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].name, "level1");

        let all = service
            .list_descendants(&root, &DescendantOptions::default())
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn ancestors_reach_root_and_survive_cycles() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        let parent = insert(&conn, &root, "parent", 1);
        let child = insert(&conn, &parent.id, "child", 2);

        let service = QueryService::new(SqliteNodeRepository::new(&conn), &CoreConfig::default());
        let ancestors = service.list_ancestors(&child.id).unwrap();
        let ids: Vec<_> = ancestors.iter().map(|node| node.id.clone()).collect();
        assert!(ids.contains(&parent.id));
        assert!(ids.contains(&root));

        // Corrupt the store into a two-node cycle; the walk must
        // terminate with the prefix traversed.
        conn.execute(
            "UPDATE nodes SET parent_node_id = ?1 WHERE node_id = ?2;",
            [child.id.as_str(), parent.id.as_str()],
        )
        .unwrap();
        let cyclic = service.list_ancestors(&child.id).unwrap();
        assert!(cyclic.len() <= 2);
    }

    #[test]
    fn search_modes_match_expected_names() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        insert(&conn, &root, "Report 2026", 1);
        insert(&conn, &root, "2026 Report", 2);
        insert(&conn, &root, "Summary", 3);

        let service = QueryService::new(SqliteNodeRepository::new(&conn), &CoreConfig::default());

        let prefix = service
            .search_nodes(&NodeSearchQuery {
                root_node_id: root.clone(),
                query: "report".to_string(),
                mode: SearchMode::Prefix,
                case_sensitive: false,
                search_in_description: false,
                max_results: None,
            })
            .unwrap();
        assert_eq!(prefix.len(), 1);
        assert_eq!(prefix[0].name, "Report 2026");

        let partial = service
            .search_nodes(&NodeSearchQuery::partial(root.clone(), "report"))
            .unwrap();
        assert_eq!(partial.len(), 2);

        // Regex metacharacters in the query are literal-escaped.
        insert(&conn, &root, "a.b", 4);
        let exact = service
            .search_nodes(&NodeSearchQuery {
                root_node_id: root.clone(),
                query: "a.b".to_string(),
                mode: SearchMode::Exact,
                case_sensitive: true,
                search_in_description: false,
                max_results: None,
            })
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].name, "a.b");
    }

    #[test]
    fn copy_nodes_enforces_caps() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        let folder = insert(&conn, &root, "folder", 1);
        insert(&conn, &folder.id, "inner", 2);

        let service = QueryService::new(SqliteNodeRepository::new(&conn), &CoreConfig::default());
        let copied = service.copy_nodes(&[folder.id.clone()]).unwrap();
        assert_eq!(copied.kind, "nodes-copy");
        assert_eq!(copied.node_count, 2);
        assert_eq!(copied.root_node_ids, vec![folder.id.clone()]);

        let too_many: Vec<_> = (0..1001).map(|n| NodeId::new(format!("id-{n}"))).collect();
        let err = service.copy_nodes(&too_many).unwrap_err();
        assert!(matches!(err, QueryServiceError::LimitExceeded { .. }));

        assert!(matches!(
            service.copy_nodes(&[]).unwrap_err(),
            QueryServiceError::EmptyInput
        ));
    }

    #[test]
    fn export_metadata_counts_materialised_nodes() {
        let conn = setup();
        let root = TreeId::Resources.root_node_id();
        let folder = insert(&conn, &root, "folder", 1);
        insert(&conn, &folder.id, "a", 2);
        insert(&conn, &folder.id, "b", 3);

        let service = QueryService::new(SqliteNodeRepository::new(&conn), &CoreConfig::default());
        let payload = service.export_nodes(&[folder.id.clone()]).unwrap();
        assert_eq!(payload.metadata.total_nodes, 3);
        assert_eq!(payload.nodes.len(), 3);
    }
}
