//! Tree and node domain model.
//!
//! # Responsibility
//! - Define the canonical persisted shapes for trees, nodes and root view
//!   state.
//! - Provide lifecycle helpers for trash (soft-delete) semantics.
//!
//! # Invariants
//! - `version` starts at 1 and every in-place update increments it by 1.
//! - `is_removed`, `removed_at`, `original_parent_node_id` and
//!   `original_name` are set and cleared together (trash exclusivity).
//! - Super-root nodes are the only nodes whose parent id equals their own id.

use crate::model::ids::{NodeId, TreeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Node type tag. Open set: plugins register their own types.
pub type NodeType = String;

/// Node type of seeded super-root nodes.
pub const NODE_TYPE_SUPER_ROOT: &str = "super-root";
/// Node type of seeded tree roots.
pub const NODE_TYPE_ROOT: &str = "root";
/// Node type of seeded trash roots.
pub const NODE_TYPE_TRASH: &str = "trash";
/// Built-in folder node type.
pub const NODE_TYPE_FOLDER: &str = "folder";

/// Maximum hops any parent walk may take before giving up.
pub const MAX_TREE_DEPTH: usize = 50;

/// One tree of the forest. Created once at initialization, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub name: String,
    pub super_root_node_id: NodeId,
    pub root_node_id: NodeId,
    pub trash_root_node_id: NodeId,
}

impl Tree {
    /// Builds the canonical seed record for one tree id.
    pub fn seed(id: TreeId) -> Self {
        Self {
            id,
            name: id.display_name().to_string(),
            super_root_node_id: id.super_root_node_id(),
            root_node_id: id.root_node_id(),
            trash_root_node_id: id.trash_root_node_id(),
        }
    }
}

/// Canonical persisted node record.
///
/// The four trash fields are populated only while the node sits under a
/// trash root; restoration clears them atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub parent_node_id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
    /// Epoch ms update timestamp.
    pub updated_at: i64,
    /// Monotonic per-node version, starting at 1.
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_parent_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<i64>,
    #[serde(default)]
    pub is_removed: bool,
}

/// Node-level validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeValidationError {
    EmptyId,
    EmptyName,
    EmptyNodeType,
    NonPositiveVersion(i64),
    /// Trash fields are partially set, breaking trash exclusivity.
    InconsistentTrashState(NodeId),
}

impl Display for NodeValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "node id must not be empty"),
            Self::EmptyName => write!(f, "node name must not be empty"),
            Self::EmptyNodeType => write!(f, "node type must not be empty"),
            Self::NonPositiveVersion(version) => {
                write!(f, "node version must be >= 1, got {version}")
            }
            Self::InconsistentTrashState(id) => {
                write!(f, "trash fields must be all set or all clear: {id}")
            }
        }
    }
}

impl Error for NodeValidationError {}

impl TreeNode {
    /// Creates a live node with `version = 1` and empty trash state.
    pub fn new(
        id: NodeId,
        parent_node_id: NodeId,
        node_type: impl Into<NodeType>,
        name: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id,
            parent_node_id,
            node_type: node_type.into(),
            name: name.into(),
            description: None,
            created_at: now,
            updated_at: now,
            version: 1,
            original_parent_node_id: None,
            original_name: None,
            removed_at: None,
            is_removed: false,
        }
    }

    /// Whether this node currently sits in a trash subtree.
    pub fn is_trashed(&self) -> bool {
        self.is_removed
    }

    /// Whether this node is its own parent (seeded super-roots only).
    pub fn is_super_root(&self) -> bool {
        self.parent_node_id == self.id
    }

    /// Validates structural invariants before persistence.
    ///
    /// # Errors
    /// - [`NodeValidationError::InconsistentTrashState`] when the trash
    ///   marker fields disagree with each other.
    pub fn validate(&self) -> Result<(), NodeValidationError> {
        if self.id.as_str().is_empty() {
            return Err(NodeValidationError::EmptyId);
        }
        if self.name.is_empty() {
            return Err(NodeValidationError::EmptyName);
        }
        if self.node_type.is_empty() {
            return Err(NodeValidationError::EmptyNodeType);
        }
        if self.version < 1 {
            return Err(NodeValidationError::NonPositiveVersion(self.version));
        }

        let trash_markers = [
            self.is_removed,
            self.removed_at.is_some(),
            self.original_parent_node_id.is_some(),
        ];
        if trash_markers.iter().any(|set| *set) && !trash_markers.iter().all(|set| *set) {
            return Err(NodeValidationError::InconsistentTrashState(self.id.clone()));
        }

        Ok(())
    }

    /// Marks this node trashed, recording where it came from.
    pub fn mark_trashed(&mut self, trash_root: NodeId, now: i64) {
        self.original_parent_node_id = Some(self.parent_node_id.clone());
        self.original_name = Some(self.name.clone());
        self.parent_node_id = trash_root;
        self.is_removed = true;
        self.removed_at = Some(now);
        self.updated_at = now;
        self.version += 1;
    }

    /// Clears trash state, reattaching under `parent` with `name`.
    pub fn mark_recovered(&mut self, parent: NodeId, name: String, now: i64) {
        self.parent_node_id = parent;
        self.name = name;
        self.original_parent_node_id = None;
        self.original_name = None;
        self.removed_at = None;
        self.is_removed = false;
        self.updated_at = now;
        self.version += 1;
    }
}

/// Persisted expanded/collapsed view state tied to a tree's root or trash
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRootState {
    pub tree_id: TreeId,
    pub root_node_type: NodeType,
    /// Expansion flags keyed by node id.
    pub expanded: BTreeMap<NodeId, bool>,
}

impl TreeRootState {
    pub fn empty(tree_id: TreeId, root_node_type: impl Into<NodeType>) -> Self {
        Self {
            tree_id,
            root_node_type: root_node_type.into(),
            expanded: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeValidationError, TreeNode, NODE_TYPE_FOLDER};
    use crate::model::ids::NodeId;

    fn folder(name: &str) -> TreeNode {
        TreeNode::new(
            NodeId::generate(),
            NodeId::new("parent"),
            NODE_TYPE_FOLDER,
            name,
            1_000,
        )
    }

    #[test]
    fn new_node_starts_at_version_one() {
        let node = folder("Docs");
        assert_eq!(node.version, 1);
        assert!(!node.is_trashed());
        node.validate().unwrap();
    }

    #[test]
    fn trash_round_trip_restores_origin_fields() {
        let mut node = folder("Docs");
        let original_parent = node.parent_node_id.clone();

        node.mark_trashed(NodeId::new("r:trash"), 2_000);
        node.validate().unwrap();
        assert!(node.is_trashed());
        assert_eq!(node.version, 2);
        assert_eq!(node.original_name.as_deref(), Some("Docs"));

        node.mark_recovered(original_parent.clone(), "Docs".to_string(), 3_000);
        node.validate().unwrap();
        assert!(!node.is_trashed());
        assert_eq!(node.parent_node_id, original_parent);
        assert_eq!(node.version, 3);
        assert!(node.removed_at.is_none());
        assert!(node.original_parent_node_id.is_none());
    }

    #[test]
    fn validate_rejects_partial_trash_state() {
        let mut node = folder("Docs");
        node.is_removed = true;

        let err = node.validate().unwrap_err();
        assert!(matches!(
            err,
            NodeValidationError::InconsistentTrashState(_)
        ));
    }

    #[test]
    fn validate_rejects_zero_version() {
        let mut node = folder("Docs");
        node.version = 0;
        assert!(matches!(
            node.validate().unwrap_err(),
            NodeValidationError::NonPositiveVersion(0)
        ));
    }
}
