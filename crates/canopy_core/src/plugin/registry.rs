//! Plugin registry: entity metadata and lifecycle hooks per node type.
//!
//! # Responsibility
//! - Keep `(node_type, entity_key)` registrations with declaration-time
//!   validation.
//! - Provide the operation-specific entity ordering the lifecycle manager
//!   relies on.
//! - Run registered hooks for one node type, honoring `stop_on_error`.
//!
//! # Invariants
//! - Duplicate registration of an entity key for the same node type is
//!   rejected.
//! - Delete order is `relational, group, peer`; commit order is the exact
//!   reverse.

use crate::model::entity::{EntityKind, EntityMetadata, EntityMetadataError};
use crate::plugin::hooks::{HookContext, HookError, HookFailureLog, HookStage, NodeTypeHooks};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Lifecycle operation used to order entity iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOperation {
    /// Cascade order `{relational, group, peer}`.
    Delete,
    /// Cascade order `{peer, group, relational}`.
    Commit,
}

/// One registered entity: key plus validated metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEntity {
    pub entity_key: String,
    pub metadata: EntityMetadata,
}

/// Registration errors. These surface as `VALIDATION_ERROR`.
#[derive(Debug)]
pub enum RegistryError {
    InvalidMetadata(EntityMetadataError),
    DuplicateEntityKey {
        node_type: String,
        entity_key: String,
    },
    EmptyNodeType,
    EmptyEntityKey,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMetadata(err) => write!(f, "invalid entity metadata: {err}"),
            Self::DuplicateEntityKey {
                node_type,
                entity_key,
            } => write!(
                f,
                "entity key already registered: `{entity_key}` for node type `{node_type}`"
            ),
            Self::EmptyNodeType => write!(f, "node type must not be empty"),
            Self::EmptyEntityKey => write!(f, "entity key must not be empty"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidMetadata(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EntityMetadataError> for RegistryError {
    fn from(value: EntityMetadataError) -> Self {
        Self::InvalidMetadata(value)
    }
}

/// In-process registry of entity metadata and node-type hooks.
#[derive(Default)]
pub struct PluginRegistry {
    entities: BTreeMap<String, BTreeMap<String, EntityMetadata>>,
    hooks: BTreeMap<String, Vec<Box<dyn NodeTypeHooks>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one entity after declaration validation.
    pub fn register_entity(
        &mut self,
        node_type: impl Into<String>,
        entity_key: impl Into<String>,
        metadata: EntityMetadata,
    ) -> Result<(), RegistryError> {
        let node_type = node_type.into();
        let entity_key = entity_key.into();
        if node_type.trim().is_empty() {
            return Err(RegistryError::EmptyNodeType);
        }
        if entity_key.trim().is_empty() {
            return Err(RegistryError::EmptyEntityKey);
        }
        metadata.validate()?;

        let entries = self.entities.entry(node_type.clone()).or_default();
        if entries.contains_key(&entity_key) {
            return Err(RegistryError::DuplicateEntityKey {
                node_type,
                entity_key,
            });
        }
        entries.insert(entity_key, metadata);
        Ok(())
    }

    /// Registers a hook set for one node type. Multiple sets run in
    /// registration order.
    pub fn register_hooks(&mut self, node_type: impl Into<String>, hooks: Box<dyn NodeTypeHooks>) {
        self.hooks.entry(node_type.into()).or_default().push(hooks);
    }

    /// Entities registered for one node type, keyed order.
    pub fn entities_for(&self, node_type: &str) -> Vec<RegisteredEntity> {
        self.entities
            .get(node_type)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(entity_key, metadata)| RegisteredEntity {
                        entity_key: entity_key.clone(),
                        metadata: metadata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entities for one node type sorted for a lifecycle operation.
    pub fn entities_for_operation(
        &self,
        node_type: &str,
        operation: LifecycleOperation,
    ) -> Vec<RegisteredEntity> {
        let mut entries = self.entities_for(node_type);
        entries.sort_by_key(|entry| {
            let rank = match (operation, entry.metadata.entity_kind) {
                (LifecycleOperation::Delete, EntityKind::Relational) => 0,
                (LifecycleOperation::Delete, EntityKind::Group) => 1,
                (LifecycleOperation::Delete, EntityKind::Peer) => 2,
                (LifecycleOperation::Commit, EntityKind::Peer) => 0,
                (LifecycleOperation::Commit, EntityKind::Group) => 1,
                (LifecycleOperation::Commit, EntityKind::Relational) => 2,
            };
            (rank, entry.entity_key.clone())
        });
        entries
    }

    /// All registered entity keys as `(node_type, entity_key)` pairs.
    pub fn registered_entity_keys(&self) -> Vec<(String, String)> {
        self.entities
            .iter()
            .flat_map(|(node_type, entries)| {
                entries
                    .keys()
                    .map(move |entity_key| (node_type.clone(), entity_key.clone()))
            })
            .collect()
    }

    /// Node types with at least one entity or hook registration.
    pub fn registered_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entities
            .keys()
            .chain(self.hooks.keys())
            .cloned()
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Runs one hook stage for every hook set registered on `node_type`.
    ///
    /// A failure from a `stop_on_error` set aborts immediately; other
    /// failures are recorded in `log` and the remaining hooks still run.
    pub fn run_hooks(
        &self,
        log: &HookFailureLog,
        stage: HookStage,
        ctx: &HookContext<'_>,
    ) -> Result<(), HookError> {
        let Some(sets) = self.hooks.get(ctx.node_type) else {
            return Ok(());
        };

        for hooks in sets {
            if let Err(err) = hooks.run_stage(stage, ctx) {
                if hooks.stop_on_error() {
                    return Err(err);
                }
                log.record(stage, ctx, &err);
            }
        }
        Ok(())
    }
}
