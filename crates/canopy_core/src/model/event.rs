//! Change records and subscriber-facing change events.
//!
//! # Responsibility
//! - Define the per-mutation record emitted by the durable store.
//! - Define the event shape delivered through subscriptions.
//!
//! # Invariants
//! - Records are emitted only after the producing write has committed.
//! - Delivery order equals commit order.

use crate::model::ids::{NodeId, WorkingCopyId};
use crate::model::node::TreeNode;
use serde::{Deserialize, Serialize};

/// Kind of one atomic durable-store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One record per atomic node mutation, accumulated inside a transaction
/// and published after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub node_id: NodeId,
    /// Post-mutation state; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<TreeNode>,
    /// Pre-mutation state; absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<TreeNode>,
    pub timestamp: i64,
}

impl ChangeRecord {
    pub fn created(node: TreeNode, timestamp: i64) -> Self {
        Self {
            kind: ChangeKind::Created,
            node_id: node.id.clone(),
            node: Some(node),
            previous_node: None,
            timestamp,
        }
    }

    pub fn updated(previous: TreeNode, node: TreeNode, timestamp: i64) -> Self {
        Self {
            kind: ChangeKind::Updated,
            node_id: node.id.clone(),
            node: Some(node),
            previous_node: Some(previous),
            timestamp,
        }
    }

    pub fn deleted(previous: TreeNode, timestamp: i64) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            node_id: previous.id.clone(),
            node: None,
            previous_node: Some(previous),
            timestamp,
        }
    }

    /// Parent id after the mutation, when known.
    pub fn parent_id(&self) -> Option<&NodeId> {
        self.node.as_ref().map(|node| &node.parent_node_id)
    }

    /// Parent id before the mutation, when known.
    pub fn previous_parent_id(&self) -> Option<&NodeId> {
        self.previous_node.as_ref().map(|node| &node.parent_node_id)
    }
}

/// Event type delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeEventKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    ChildrenChanged,
}

impl From<ChangeKind> for ChangeEventKind {
    fn from(value: ChangeKind) -> Self {
        match value {
            ChangeKind::Created => Self::NodeCreated,
            ChangeKind::Updated => Self::NodeUpdated,
            ChangeKind::Deleted => Self::NodeDeleted,
        }
    }
}

/// Subscriber-facing change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeEventKind,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<TreeNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<TreeNode>,
    /// Populated on `children-changed` snapshot events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_children: Vec<NodeId>,
    pub timestamp: i64,
}

impl ChangeEvent {
    /// Converts a committed store record into the delivery shape.
    pub fn from_record(record: &ChangeRecord) -> Self {
        Self {
            kind: record.kind.into(),
            node_id: record.node_id.clone(),
            parent_id: record.parent_id().cloned(),
            previous_parent_id: record.previous_parent_id().cloned(),
            node: record.node.clone(),
            previous_node: record.previous_node.clone(),
            affected_children: Vec::new(),
            timestamp: record.timestamp,
        }
    }

    /// Builds a `children-changed` snapshot event for one parent.
    pub fn children_snapshot(parent_id: NodeId, children: Vec<NodeId>, timestamp: i64) -> Self {
        Self {
            kind: ChangeEventKind::ChildrenChanged,
            node_id: parent_id.clone(),
            parent_id: Some(parent_id),
            previous_parent_id: None,
            node: None,
            previous_node: None,
            affected_children: children,
            timestamp,
        }
    }
}

/// Working-copy lifecycle transitions published on the opt-in stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkingCopyEventKind {
    Created,
    Updated,
    Committed,
    Discarded,
}

/// One working-copy lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingCopyEvent {
    pub kind: WorkingCopyEventKind,
    pub working_copy_id: WorkingCopyId,
    /// Source node for non-draft copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::{ChangeEvent, ChangeEventKind, ChangeRecord};
    use crate::model::ids::NodeId;
    use crate::model::node::{TreeNode, NODE_TYPE_FOLDER};

    fn node(name: &str, parent: &str) -> TreeNode {
        TreeNode::new(
            NodeId::generate(),
            NodeId::new(parent),
            NODE_TYPE_FOLDER,
            name,
            5,
        )
    }

    #[test]
    fn update_record_exposes_both_parents() {
        let before = node("Docs", "old-parent");
        let mut after = before.clone();
        after.parent_node_id = NodeId::new("new-parent");
        after.version += 1;

        let record = ChangeRecord::updated(before, after, 9);
        assert_eq!(record.previous_parent_id().unwrap().as_str(), "old-parent");
        assert_eq!(record.parent_id().unwrap().as_str(), "new-parent");

        let event = ChangeEvent::from_record(&record);
        assert_eq!(event.kind, ChangeEventKind::NodeUpdated);
        assert_eq!(event.parent_id.unwrap().as_str(), "new-parent");
    }

    #[test]
    fn delete_record_has_no_post_state() {
        let record = ChangeRecord::deleted(node("Docs", "p"), 9);
        assert!(record.node.is_none());
        assert!(record.parent_id().is_none());
        assert_eq!(record.previous_parent_id().unwrap().as_str(), "p");
    }
}
