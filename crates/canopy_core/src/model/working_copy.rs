//! Working-copy model: the two-phase-commit buffer for node edits.
//!
//! # Invariants
//! - `is_draft = true` means no backing node exists yet and
//!   `working_copy_of` is `None`.
//! - Non-draft copies always reference an existing source node and record
//!   the source `version` they were copied from (`base_version`).

use crate::model::ids::{NodeId, WorkingCopyId};
use crate::model::node::{NodeType, TreeNode};
use serde::{Deserialize, Serialize};

/// Ephemeral mutable snapshot of a node, or draft of a node to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingCopy {
    pub working_copy_id: WorkingCopyId,
    /// Source node for non-draft copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_copy_of: Option<NodeId>,
    pub parent_node_id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Epoch ms when the copy was taken (or the draft created).
    pub copied_at: i64,
    pub updated_at: i64,
    pub is_draft: bool,
    /// Source node version at copy time; `None` for drafts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    /// Opaque plugin payload carried through commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl WorkingCopy {
    /// Builds a draft working copy for a node that does not exist yet.
    pub fn draft(
        parent_node_id: NodeId,
        node_type: impl Into<NodeType>,
        name: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            working_copy_id: WorkingCopyId::generate(),
            working_copy_of: None,
            parent_node_id,
            node_type: node_type.into(),
            name: name.into(),
            description: None,
            copied_at: now,
            updated_at: now,
            is_draft: true,
            base_version: None,
            payload: None,
        }
    }

    /// Builds a working copy mirroring an existing node.
    pub fn from_node(node: &TreeNode, now: i64) -> Self {
        Self {
            working_copy_id: WorkingCopyId::generate(),
            working_copy_of: Some(node.id.clone()),
            parent_node_id: node.parent_node_id.clone(),
            node_type: node.node_type.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            copied_at: now,
            updated_at: now,
            is_draft: false,
            base_version: Some(node.version),
            payload: None,
        }
    }
}

/// Field patch applied by `update_working_copy`.
///
/// Unset fields leave the stored value untouched; `updated_at` is always
/// refreshed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingCopyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl WorkingCopyPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.parent_node_id.is_none()
            && self.payload.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkingCopy, WorkingCopyPatch};
    use crate::model::ids::NodeId;
    use crate::model::node::{TreeNode, NODE_TYPE_FOLDER};

    #[test]
    fn draft_has_no_source_linkage() {
        let copy = WorkingCopy::draft(NodeId::new("r:root"), NODE_TYPE_FOLDER, "New", 10);
        assert!(copy.is_draft);
        assert!(copy.working_copy_of.is_none());
        assert!(copy.base_version.is_none());
    }

    #[test]
    fn from_node_records_base_version() {
        let mut node = TreeNode::new(
            NodeId::generate(),
            NodeId::new("r:root"),
            NODE_TYPE_FOLDER,
            "Docs",
            10,
        );
        node.version = 4;

        let copy = WorkingCopy::from_node(&node, 20);
        assert!(!copy.is_draft);
        assert_eq!(copy.working_copy_of.as_ref(), Some(&node.id));
        assert_eq!(copy.base_version, Some(4));
        assert_eq!(copy.copied_at, 20);
    }

    #[test]
    fn default_patch_is_empty() {
        assert!(WorkingCopyPatch::default().is_empty());
        assert!(!WorkingCopyPatch::rename("x").is_empty());
    }
}
