//! Entity registration metadata and row shapes.
//!
//! # Responsibility
//! - Describe plugin-owned side data attached to nodes (peer/group/
//!   relational cardinalities).
//! - Validate registration records before they enter the registry.
//!
//! # Invariants
//! - Relational metadata always carries reference management settings.
//! - `reference_count` of a relational row equals the length of its node
//!   list.

use crate::model::ids::{EntityId, NodeId};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Cardinality class of one entity registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// 1:1 with a node, keyed by node id.
    Peer,
    /// 1:N with a node, joined by foreign key.
    Group,
    /// N:M, shared by multiple nodes with reference counting.
    Relational,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Group => "group",
            Self::Relational => "relational",
        }
    }
}

/// Declared relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityCardinality {
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// How entity rows relate to their owning node(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub cardinality: EntityCardinality,
    /// Field inside the entity payload that carries the owning node id.
    pub foreign_key_field: String,
    /// Whether node deletion removes the rows.
    pub cascade_delete: bool,
}

/// Opt-in working-copy buffering for one entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityWorkingCopyConfig {
    pub enabled: bool,
    pub table_name: String,
}

/// Reference counting settings for relational entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceManagement {
    pub count_field: String,
    pub node_list_field: String,
    pub auto_delete_when_zero: bool,
}

/// One entity registration record, keyed by `(node_type, entity_key)` in the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub entity_kind: EntityKind,
    pub table_name: String,
    pub relationship: EntityRelationship,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_copy_config: Option<EntityWorkingCopyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_management: Option<ReferenceManagement>,
}

/// Registration-time metadata errors. These surface as `VALIDATION_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityMetadataError {
    EmptyTableName,
    EmptyForeignKeyField,
    /// Relational registrations must describe their reference bookkeeping.
    MissingReferenceManagement(String),
    /// Only relational registrations may carry reference bookkeeping.
    UnexpectedReferenceManagement(String),
    EmptyWorkingCopyTableName(String),
}

impl Display for EntityMetadataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTableName => write!(f, "entity table name must not be empty"),
            Self::EmptyForeignKeyField => {
                write!(f, "entity foreign key field must not be empty")
            }
            Self::MissingReferenceManagement(table) => {
                write!(f, "relational entity `{table}` requires reference management")
            }
            Self::UnexpectedReferenceManagement(table) => {
                write!(
                    f,
                    "non-relational entity `{table}` must not declare reference management"
                )
            }
            Self::EmptyWorkingCopyTableName(table) => {
                write!(f, "working copy table name for `{table}` must not be empty")
            }
        }
    }
}

impl Error for EntityMetadataError {}

impl EntityMetadata {
    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), EntityMetadataError> {
        if self.table_name.trim().is_empty() {
            return Err(EntityMetadataError::EmptyTableName);
        }
        if self.relationship.foreign_key_field.trim().is_empty() {
            return Err(EntityMetadataError::EmptyForeignKeyField);
        }

        match self.entity_kind {
            EntityKind::Relational => {
                if self.reference_management.is_none() {
                    return Err(EntityMetadataError::MissingReferenceManagement(
                        self.table_name.clone(),
                    ));
                }
            }
            EntityKind::Peer | EntityKind::Group => {
                if self.reference_management.is_some() {
                    return Err(EntityMetadataError::UnexpectedReferenceManagement(
                        self.table_name.clone(),
                    ));
                }
            }
        }

        if let Some(config) = &self.working_copy_config {
            if config.enabled && config.table_name.trim().is_empty() {
                return Err(EntityMetadataError::EmptyWorkingCopyTableName(
                    self.table_name.clone(),
                ));
            }
        }

        Ok(())
    }
}

/// One peer entity row: 1:1 side data keyed by node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntityRow {
    pub node_id: NodeId,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One group entity row: many rows per node, joined by foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntityRow {
    pub entity_id: EntityId,
    pub node_id: NodeId,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One relational entity row: shared by multiple nodes, reference counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalEntityRow {
    pub entity_id: EntityId,
    pub reference_count: i64,
    pub node_ids: Vec<NodeId>,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RelationalEntityRow {
    /// Checks the reference-integrity invariant for this row.
    pub fn is_consistent(&self) -> bool {
        self.reference_count == self.node_ids.len() as i64
    }
}
