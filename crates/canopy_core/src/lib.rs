//! Core domain logic for Canopy, an embeddable hierarchical tree database.
//! This crate is the single source of truth for forest invariants.

/// Tunable limits and database identity.
pub mod config;
/// Database open/migration APIs.
pub mod db;
/// Structured logging initialization and status APIs.
pub mod logging;
/// Canonical forest data model.
pub mod model;
/// Sibling-name collision resolution.
pub mod naming;
/// Reactive subscription layer.
pub mod observe;
/// Plugin contracts: entities, lifecycle cascades, hooks.
pub mod plugin;
/// Persistence contracts and SQLite repository implementations.
pub mod repo;
/// Use-case orchestration services.
pub mod service;

/// Re-export logging entry points for embedding layers.
pub use logging::{default_log_level, init_logging, logging_status};

/// Re-export the core configuration.
pub use config::CoreConfig;

/// Re-export canonical model types.
pub use model::command::{
    CommandEnvelope, CommandKind, CommandOutcome, ErrorCode, NameConflictMode,
};
pub use model::entity::{
    EntityCardinality, EntityKind, EntityMetadata, EntityRelationship, EntityWorkingCopyConfig,
    ReferenceManagement,
};
pub use model::event::{
    ChangeEvent, ChangeEventKind, ChangeRecord, WorkingCopyEvent, WorkingCopyEventKind,
};
pub use model::ids::{EntityId, NodeId, TreeId, WorkingCopyId};
pub use model::node::{Tree, TreeNode, TreeRootState, NODE_TYPE_FOLDER};
pub use model::working_copy::{WorkingCopy, WorkingCopyPatch};

/// Re-export plugin contracts.
pub use plugin::hooks::{HookContext, HookError, HookStage, NodeTypeHooks};

/// Re-export subscription handles.
pub use observe::{ChangeEventStream, SubscriptionRecord, WorkingCopyEventStream};

/// Re-export query/request models.
pub use service::query_service::{
    ChildListOptions, ChildSortBy, DescendantOptions, ExportPayload, NodeSearchQuery,
    NodesCopyResult, SearchMode, SortOrder,
};

/// Re-export the developer-facing facade.
pub use service::forest_service::{CreateRequest, FacadeError, ForestService};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
