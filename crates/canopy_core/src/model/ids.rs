//! Identifier newtypes shared across the forest.
//!
//! # Responsibility
//! - Define stable identifier types for trees, nodes, entities and working
//!   copies.
//! - Keep generation (UUID v4) and well-known seeded ids in one place.
//!
//! # Invariants
//! - A generated id is never reused for another record.
//! - Seeded root ids are deterministic per tree so re-opening a store finds
//!   the same roots.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier for one tree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a fresh random node id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing id string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Stable identifier for one entity row within an entity table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for one working copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingCopyId(String);

impl WorkingCopyId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkingCopyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enumerated tree identifier.
///
/// The forest always holds exactly these two trees; they are seeded on first
/// open and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeId {
    /// Shared resource tree, persisted as `"r"`.
    #[serde(rename = "r")]
    Resources,
    /// Project tree, persisted as `"p"`.
    #[serde(rename = "p")]
    Projects,
}

impl TreeId {
    /// Stable storage string for this tree.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resources => "r",
            Self::Projects => "p",
        }
    }

    /// User-facing default tree name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Resources => "Resources",
            Self::Projects => "Projects",
        }
    }

    /// All trees in seed order.
    pub fn all() -> [TreeId; 2] {
        [Self::Resources, Self::Projects]
    }

    /// Deterministic seeded super-root node id for this tree.
    pub fn super_root_node_id(self) -> NodeId {
        NodeId::new(format!("{}:super-root", self.as_str()))
    }

    /// Deterministic seeded root node id for this tree.
    pub fn root_node_id(self) -> NodeId {
        NodeId::new(format!("{}:root", self.as_str()))
    }

    /// Deterministic seeded trash-root node id for this tree.
    pub fn trash_root_node_id(self) -> NodeId {
        NodeId::new(format!("{}:trash", self.as_str()))
    }
}

impl Display for TreeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parses a persisted tree id string.
pub fn parse_tree_id(value: &str) -> Result<TreeId, TreeIdParseError> {
    match value {
        "r" => Ok(TreeId::Resources),
        "p" => Ok(TreeId::Projects),
        other => Err(TreeIdParseError(other.to_string())),
    }
}

/// Unknown persisted tree id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeIdParseError(pub String);

impl Display for TreeIdParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown tree id `{}`", self.0)
    }
}

impl Error for TreeIdParseError {}

#[cfg(test)]
mod tests {
    use super::{parse_tree_id, NodeId, TreeId};

    #[test]
    fn generated_node_ids_are_unique() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn tree_ids_round_trip_storage_strings() {
        for tree in TreeId::all() {
            assert_eq!(parse_tree_id(tree.as_str()).unwrap(), tree);
        }
    }

    #[test]
    fn seeded_root_ids_are_deterministic() {
        assert_eq!(
            TreeId::Resources.root_node_id(),
            TreeId::Resources.root_node_id()
        );
        assert_eq!(TreeId::Projects.trash_root_node_id().as_str(), "p:trash");
    }

    #[test]
    fn rejects_unknown_tree_id() {
        assert!(parse_tree_id("x").is_err());
    }
}
