//! Orchestrated facade: the developer-facing API of the core.
//!
//! # Responsibility
//! - Own the process-scoped state (connection, registry, hub, pipeline)
//!   with an explicit initialize/dispose lifecycle.
//! - Validate inputs, wrap mutations in command envelopes, group
//!   multi-step operations under one undo unit, and convert internal
//!   results to the public outcome shape.
//! - Publish committed change records to the subscription hub.
//!
//! # Invariants
//! - Change events reach subscribers only after their transaction has
//!   committed, in commit order.
//! - Undo units carry symmetric replay payloads, so undo followed by redo
//!   restores the exact post-operation rows.

use crate::config::CoreConfig;
use crate::db::{open_store, open_store_in_memory, DbError};
use crate::model::command::{
    CommandEnvelope, CommandKind, CommandOutcome, ErrorCode, NameConflictMode, ReplayOp, UndoUnit,
};
use crate::model::event::{
    ChangeKind, ChangeRecord, WorkingCopyEvent, WorkingCopyEventKind,
};
use crate::model::ids::{NodeId, TreeId};
use crate::model::node::{NodeType, Tree, TreeNode, TreeRootState};
use crate::model::now_ms;
use crate::model::working_copy::WorkingCopyPatch;
use crate::observe::{
    ChangeEventStream, SubscriptionHub, SubscriptionRecord, WorkingCopyEventStream,
};
use crate::plugin::hooks::{HookFailure, HookFailureLog, NodeTypeHooks};
use crate::plugin::registry::{PluginRegistry, RegistryError};
use crate::repo::node_repo::{self, NodeRepoError, SqliteNodeRepository};
use crate::repo::root_state_repo;
use crate::repo::view_state_repo;
use crate::service::command_pipeline::{CommandEventRecord, CommandPipeline};
use crate::service::mutation_service::{MutationOutcome, MutationService};
use crate::service::query_service::{
    ChildListOptions, DescendantOptions, ExportPayload, NodeSearchQuery, NodesCopyResult,
    QueryService, QueryServiceError,
};
use crate::service::working_copy_service::WorkingCopyService;
use log::info;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;

/// Result type for facade read paths.
pub type FacadeResult<T> = Result<T, FacadeError>;

/// Errors surfaced by facade read paths and lifecycle operations.
#[derive(Debug)]
pub enum FacadeError {
    Db(DbError),
    Repo(NodeRepoError),
    Query(QueryServiceError),
    Registry(RegistryError),
    /// Import/export payload could not be decoded.
    Payload(String),
}

impl Display for FacadeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Query(err) => write!(f, "{err}"),
            Self::Registry(err) => write!(f, "{err}"),
            Self::Payload(message) => write!(f, "invalid payload: {message}"),
        }
    }
}

impl Error for FacadeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Query(err) => Some(err),
            Self::Registry(err) => Some(err),
            Self::Payload(_) => None,
        }
    }
}

impl From<DbError> for FacadeError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<NodeRepoError> for FacadeError {
    fn from(value: NodeRepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<QueryServiceError> for FacadeError {
    fn from(value: QueryServiceError) -> Self {
        Self::Query(value)
    }
}

impl From<RegistryError> for FacadeError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

impl FacadeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Db(_) => ErrorCode::DatabaseError,
            Self::Repo(NodeRepoError::NodeNotFound(_)) => ErrorCode::NodeNotFound,
            Self::Repo(_) => ErrorCode::DatabaseError,
            Self::Query(err) => err.code(),
            Self::Registry(_) => ErrorCode::ValidationError,
            Self::Payload(_) => ErrorCode::InvalidOperation,
        }
    }
}

/// Request shape for [`ForestService::create`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub tree_node_type: NodeType,
    pub parent_node_id: NodeId,
    pub name: String,
    pub description: Option<String>,
    pub on_name_conflict: NameConflictMode,
}

/// Developer-facing facade over the whole core.
///
/// Mutating entry points take `&mut self`, so writers serialise through
/// the borrow checker; the store is strictly single-writer.
pub struct ForestService {
    conn: Connection,
    config: CoreConfig,
    registry: PluginRegistry,
    hook_log: HookFailureLog,
    hub: Arc<SubscriptionHub>,
    pipeline: CommandPipeline,
}

impl ForestService {
    /// Opens the store under `dir`, seeds the forest and starts the
    /// subscription sweeper.
    pub fn initialize(config: CoreConfig, dir: impl AsRef<Path>) -> FacadeResult<Self> {
        let conn = open_store(dir, &config.app_name)?;
        Self::bootstrap(config, conn)
    }

    /// Fully in-memory instance for tests and tooling.
    pub fn initialize_in_memory(config: CoreConfig) -> FacadeResult<Self> {
        let conn = open_store_in_memory()?;
        Self::bootstrap(config, conn)
    }

    fn bootstrap(config: CoreConfig, conn: Connection) -> FacadeResult<Self> {
        node_repo::seed_forest(&conn, now_ms())?;

        let hub = Arc::new(SubscriptionHub::new(
            config.subscription_idle_limit_ms,
            config.max_tree_depth,
        ));
        SubscriptionHub::start_sweeper(&hub, config.subscription_gc_interval_ms);

        let pipeline = CommandPipeline::new(&config);
        let hook_log = HookFailureLog::new(config.max_event_history_size);

        info!(
            "event=forest_init module=service status=ok app_name={}",
            config.app_name
        );
        Ok(Self {
            conn,
            config,
            registry: PluginRegistry::new(),
            hook_log,
            hub,
            pipeline,
        })
    }

    /// Stops the sweeper and completes every subscription.
    pub fn dispose(&mut self) {
        self.hub.shutdown();
        info!("event=forest_dispose module=service status=ok");
    }

    // ---- plugin registration --------------------------------------------

    /// Registers one entity for a node type. Fails with
    /// `VALIDATION_ERROR` semantics on duplicates or bad metadata.
    pub fn register_entity(
        &mut self,
        node_type: impl Into<String>,
        entity_key: impl Into<String>,
        metadata: crate::model::entity::EntityMetadata,
    ) -> FacadeResult<()> {
        self.registry
            .register_entity(node_type, entity_key, metadata)?;
        Ok(())
    }

    /// Registers a hook set for a node type.
    pub fn register_hooks(&mut self, node_type: impl Into<String>, hooks: Box<dyn NodeTypeHooks>) {
        self.registry.register_hooks(node_type, hooks);
    }

    /// Registered `(node_type, entity_key)` pairs.
    pub fn registered_entity_keys(&self) -> Vec<(String, String)> {
        self.registry.registered_entity_keys()
    }

    /// Runs one closure against the store connection.
    ///
    /// Plugin code uses this to read and write its entity rows inside the
    /// core's store; hooks themselves never receive a handle.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.conn)
    }

    // ---- read paths ------------------------------------------------------

    pub fn get_tree(&self, tree_id: TreeId) -> FacadeResult<Option<Tree>> {
        Ok(node_repo::get_tree(&self.conn, tree_id)?)
    }

    pub fn get_trees(&self) -> FacadeResult<Vec<Tree>> {
        Ok(node_repo::list_trees(&self.conn)?)
    }

    pub fn get_node(&self, node_id: &NodeId) -> FacadeResult<Option<TreeNode>> {
        Ok(self.query().get_node(node_id)?)
    }

    pub fn get_children(
        &self,
        parent_node_id: &NodeId,
        options: &ChildListOptions,
    ) -> FacadeResult<Vec<TreeNode>> {
        Ok(self.query().list_children(parent_node_id, options)?)
    }

    pub fn list_descendants(
        &self,
        root_node_id: &NodeId,
        options: &DescendantOptions,
    ) -> FacadeResult<Vec<TreeNode>> {
        Ok(self.query().list_descendants(root_node_id, options)?)
    }

    pub fn list_ancestors(&self, node_id: &NodeId) -> FacadeResult<Vec<TreeNode>> {
        Ok(self.query().list_ancestors(node_id)?)
    }

    pub fn search_nodes(&self, query: &NodeSearchQuery) -> FacadeResult<Vec<TreeNode>> {
        Ok(self.query().search_nodes(query)?)
    }

    pub fn copy_nodes(&self, node_ids: &[NodeId]) -> FacadeResult<NodesCopyResult> {
        Ok(self.query().copy_nodes(node_ids)?)
    }

    pub fn export_nodes(&self, node_ids: &[NodeId]) -> FacadeResult<ExportPayload> {
        Ok(self.query().export_nodes(node_ids)?)
    }

    /// Serialises an export payload as JSON bytes.
    pub fn export_to_bytes(&self, node_ids: &[NodeId]) -> FacadeResult<Vec<u8>> {
        let payload = self.export_nodes(node_ids)?;
        serde_json::to_vec(&payload).map_err(|err| FacadeError::Payload(err.to_string()))
    }

    /// Recorded command history, oldest first.
    pub fn command_history(&self) -> Vec<CommandEventRecord> {
        self.pipeline.history()
    }

    /// Suppressed hook failures, oldest first.
    pub fn hook_failures(&self) -> Vec<HookFailure> {
        self.hook_log.snapshot()
    }

    // ---- persisted & ephemeral view state -------------------------------

    pub fn root_state(
        &self,
        tree_id: TreeId,
        root_node_type: &str,
    ) -> FacadeResult<Option<TreeRootState>> {
        Ok(root_state_repo::get_root_state(&self.conn, tree_id, root_node_type)?)
    }

    pub fn set_node_expanded(
        &mut self,
        tree_id: TreeId,
        root_node_type: &str,
        node_id: &NodeId,
        expanded: bool,
    ) -> FacadeResult<TreeRootState> {
        Ok(root_state_repo::set_node_expanded(
            &self.conn,
            tree_id,
            root_node_type,
            node_id,
            expanded,
            now_ms(),
        )?)
    }

    pub fn put_view(&mut self, view_key: &str, payload: &serde_json::Value) -> FacadeResult<()> {
        view_state_repo::put_view(&self.conn, view_key, payload, now_ms())
            .map_err(|err| FacadeError::Payload(err.to_string()))
    }

    pub fn get_view(&self, view_key: &str) -> FacadeResult<Option<serde_json::Value>> {
        view_state_repo::get_view(&self.conn, view_key)
            .map_err(|err| FacadeError::Payload(err.to_string()))
    }

    pub fn take_view(&mut self, view_key: &str) -> FacadeResult<Option<serde_json::Value>> {
        view_state_repo::take_view(&self.conn, view_key)
            .map_err(|err| FacadeError::Payload(err.to_string()))
    }

    // ---- subscriptions ---------------------------------------------------

    pub fn subscribe_node(
        &self,
        node_id: &NodeId,
        node_types: Option<Vec<NodeType>>,
        include_initial_value: bool,
    ) -> FacadeResult<ChangeEventStream> {
        Ok(SubscriptionHub::subscribe_node(
            &self.hub,
            &self.conn,
            node_id,
            node_types,
            include_initial_value,
        )?)
    }

    pub fn subscribe_children(
        &self,
        parent_node_id: &NodeId,
        node_types: Option<Vec<NodeType>>,
        include_initial_snapshot: bool,
    ) -> FacadeResult<ChangeEventStream> {
        Ok(SubscriptionHub::subscribe_children(
            &self.hub,
            &self.conn,
            parent_node_id,
            node_types,
            include_initial_snapshot,
        )?)
    }

    pub fn subscribe_subtree(
        &self,
        root_node_id: &NodeId,
        max_depth: Option<usize>,
        node_types: Option<Vec<NodeType>>,
        include_initial_snapshot: bool,
    ) -> FacadeResult<ChangeEventStream> {
        Ok(SubscriptionHub::subscribe_subtree(
            &self.hub,
            &self.conn,
            root_node_id,
            max_depth,
            node_types,
            include_initial_snapshot,
        )?)
    }

    pub fn subscribe_working_copies(&self, node_id: Option<NodeId>) -> WorkingCopyEventStream {
        SubscriptionHub::subscribe_working_copies(&self.hub, node_id)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.hub.active_subscriptions()
    }

    // ---- mutating entry points ------------------------------------------

    /// Creates one node through the draft working-copy protocol.
    ///
    /// Draft and commit share one group id and surface as one undo unit;
    /// the persisted node is re-read as a sanity check before returning.
    pub fn create(&mut self, request: CreateRequest) -> CommandOutcome {
        let now = now_ms();
        let draft_envelope = CommandEnvelope::new(CommandKind::CreateWorkingCopyForCreate, now)
            .with_conflict_mode(request.on_name_conflict);
        let seq = match self.admit(&draft_envelope) {
            Ok(seq) => seq,
            Err(outcome) => return outcome,
        };

        if request.name.is_empty() || request.name.chars().count() > self.config.max_name_length {
            return self.fail(
                &draft_envelope,
                seq,
                ErrorCode::InvalidOperation,
                &format!(
                    "name length must be 1..={}, got {}",
                    self.config.max_name_length,
                    request.name.chars().count()
                ),
            );
        }

        let draft = {
            let working_copies =
                WorkingCopyService::new(&self.conn, &self.registry, &self.hook_log);
            match working_copies.create_draft(
                &request.parent_node_id,
                &request.tree_node_type,
                &request.name,
                now,
            ) {
                Ok(draft) => draft,
                Err(err) => {
                    let code = err.code();
                    return self.fail(&draft_envelope, seq, code, &err.to_string());
                }
            }
        };
        self.pipeline.record_success(&draft_envelope.command_id, seq);
        self.hub.publish_working_copies(&[WorkingCopyEvent {
            kind: WorkingCopyEventKind::Created,
            working_copy_id: draft.working_copy_id.clone(),
            node_id: None,
            timestamp: now,
        }]);

        if request.description.is_some() {
            let patch = WorkingCopyPatch {
                description: Some(request.description.clone()),
                ..WorkingCopyPatch::default()
            };
            let updated = WorkingCopyService::new(&self.conn, &self.registry, &self.hook_log)
                .update(&draft.working_copy_id, &patch, now);
            if let Err(err) = updated {
                let code = err.code();
                return self.fail(&draft_envelope, seq, code, &err.to_string());
            }
        }

        let commit_envelope = CommandEnvelope::in_group(
            CommandKind::CommitWorkingCopyForCreate,
            draft_envelope.group_id.clone(),
            now,
        )
        .with_conflict_mode(request.on_name_conflict);
        let commit_seq = match self.admit(&commit_envelope) {
            Ok(seq) => seq,
            Err(outcome) => return outcome,
        };

        let committed = {
            let working_copies =
                WorkingCopyService::new(&self.conn, &self.registry, &self.hook_log);
            match working_copies.commit(&draft.working_copy_id, true, request.on_name_conflict, now)
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    let code = err.code();
                    return self.fail(&commit_envelope, commit_seq, code, &err.to_string());
                }
            }
        };

        // Sanity check: the committed node must be readable back.
        match node_repo::get_node(&self.conn, &committed.node.id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return self.fail(
                    &commit_envelope,
                    commit_seq,
                    ErrorCode::UnknownError,
                    "created node missing on read-back",
                );
            }
            Err(err) => {
                return self.fail(
                    &commit_envelope,
                    commit_seq,
                    ErrorCode::DatabaseError,
                    &err.to_string(),
                );
            }
        }

        let node_id = committed.node.id.clone();
        let changes = vec![committed.change];
        let undo = undo_unit_from_changes(
            CommandKind::CommitWorkingCopyForCreate,
            &commit_envelope.group_id,
            &changes,
        );
        self.hub.publish_working_copies(&[WorkingCopyEvent {
            kind: WorkingCopyEventKind::Committed,
            working_copy_id: draft.working_copy_id,
            node_id: Some(node_id.clone()),
            timestamp: now,
        }]);
        self.succeed(&commit_envelope, commit_seq, changes, undo)
            .with_node_id(node_id)
    }

    /// Renames one node through the working-copy protocol (optimistic
    /// version check included).
    pub fn update_node_name(
        &mut self,
        node_id: &NodeId,
        new_name: &str,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::UpdateNodeName, now)
            .with_conflict_mode(on_name_conflict);
        let seq = match self.admit(&envelope) {
            Ok(seq) => seq,
            Err(outcome) => return outcome,
        };

        if new_name.is_empty() || new_name.chars().count() > self.config.max_name_length {
            return self.fail(
                &envelope,
                seq,
                ErrorCode::InvalidOperation,
                &format!(
                    "name length must be 1..={}, got {}",
                    self.config.max_name_length,
                    new_name.chars().count()
                ),
            );
        }

        let working_copies =
            WorkingCopyService::new(&self.conn, &self.registry, &self.hook_log);
        let copy = match working_copies.open_for_node(node_id, now) {
            Ok(copy) => copy,
            Err(err) => {
                let code = err.code();
                return self.fail(&envelope, seq, code, &err.to_string());
            }
        };
        self.hub.publish_working_copies(&[WorkingCopyEvent {
            kind: WorkingCopyEventKind::Created,
            working_copy_id: copy.working_copy_id.clone(),
            node_id: Some(node_id.clone()),
            timestamp: now,
        }]);

        let result = working_copies
            .update(&copy.working_copy_id, &WorkingCopyPatch::rename(new_name), now)
            .and_then(|_| {
                working_copies.commit(&copy.working_copy_id, false, on_name_conflict, now)
            });

        match result {
            Ok(outcome) => {
                self.hub.publish_working_copies(&[WorkingCopyEvent {
                    kind: WorkingCopyEventKind::Committed,
                    working_copy_id: copy.working_copy_id.clone(),
                    node_id: Some(outcome.node.id.clone()),
                    timestamp: now,
                }]);
                let changes = vec![outcome.change];
                let undo =
                    undo_unit_from_changes(CommandKind::UpdateNodeName, &envelope.group_id, &changes);
                self.succeed(&envelope, seq, changes, undo)
                    .with_node_id(outcome.node.id)
            }
            Err(err) => {
                // The working copy survives a failed commit for a retry.
                let code = err.code();
                self.fail(&envelope, seq, code, &err.to_string())
            }
        }
    }

    /// Moves nodes under a new parent.
    pub fn move_nodes(
        &mut self,
        node_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope =
            CommandEnvelope::new(CommandKind::MoveNodes, now).with_conflict_mode(on_name_conflict);
        self.run_mutation(envelope, CommandKind::MoveNodes, |service| {
            service.move_nodes(node_ids, to_parent, on_name_conflict, now)
        })
    }

    /// Clones subtrees under a new parent.
    pub fn duplicate_nodes(
        &mut self,
        node_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::DuplicateNodes, now)
            .with_conflict_mode(on_name_conflict);
        self.run_mutation(envelope, CommandKind::DuplicateNodes, |service| {
            service.duplicate_nodes(node_ids, to_parent, on_name_conflict, now)
        })
    }

    /// Pastes a copied payload under a new parent.
    pub fn paste_nodes(
        &mut self,
        payload: &NodesCopyResult,
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope =
            CommandEnvelope::new(CommandKind::PasteNodes, now).with_conflict_mode(on_name_conflict);
        if payload.kind != "nodes-copy" {
            let seq = match self.admit(&envelope) {
                Ok(seq) => seq,
                Err(outcome) => return outcome,
            };
            return self.fail(
                &envelope,
                seq,
                ErrorCode::InvalidOperation,
                &format!("unexpected clipboard payload kind `{}`", payload.kind),
            );
        }
        self.run_mutation(envelope, CommandKind::PasteNodes, |service| {
            service.paste_nodes(
                &payload.nodes,
                &payload.root_node_ids,
                to_parent,
                on_name_conflict,
                now,
            )
        })
    }

    /// Soft-deletes nodes into their tree's trash.
    pub fn move_to_trash(&mut self, node_ids: &[NodeId]) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::MoveToTrash, now);
        self.run_mutation(envelope, CommandKind::MoveToTrash, |service| {
            service.move_to_trash(node_ids, now)
        })
    }

    /// Restores trashed nodes.
    pub fn recover_from_trash(
        &mut self,
        node_ids: &[NodeId],
        to_parent: Option<&NodeId>,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::RecoverFromTrash, now)
            .with_conflict_mode(on_name_conflict);
        self.run_mutation(envelope, CommandKind::RecoverFromTrash, |service| {
            service.recover_from_trash(node_ids, to_parent, on_name_conflict, now)
        })
    }

    /// Hard-deletes subtrees.
    pub fn remove_nodes(&mut self, node_ids: &[NodeId]) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::RemoveNodes, now);
        self.run_mutation(envelope, CommandKind::RemoveNodes, |service| {
            service.remove(node_ids, now)
        })
    }

    /// Imports foreign rows under a parent.
    pub fn import_nodes(
        &mut self,
        nodes: &[TreeNode],
        root_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::ImportNodes, now)
            .with_conflict_mode(on_name_conflict);
        self.run_mutation(envelope, CommandKind::ImportNodes, |service| {
            service.import_nodes(nodes, root_ids, to_parent, on_name_conflict, now)
        })
    }

    /// Imports a JSON export payload (template or file bytes).
    pub fn import_from_bytes(
        &mut self,
        bytes: &[u8],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
    ) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::ImportNodes, now)
            .with_conflict_mode(on_name_conflict);

        let payload: ExportPayload = match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(err) => {
                let seq = match self.admit(&envelope) {
                    Ok(seq) => seq,
                    Err(outcome) => return outcome,
                };
                return self.fail(
                    &envelope,
                    seq,
                    ErrorCode::InvalidOperation,
                    &format!("export payload decode failed: {err}"),
                );
            }
        };

        self.run_mutation(envelope, CommandKind::ImportNodes, |service| {
            service.import_nodes(
                &payload.nodes,
                &payload.metadata.root_node_ids,
                to_parent,
                on_name_conflict,
                now,
            )
        })
    }

    /// Undoes the most recent undoable command by replaying its inverse.
    pub fn undo(&mut self) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::Undo, now);
        let seq = match self.admit(&envelope) {
            Ok(seq) => seq,
            Err(outcome) => return outcome,
        };

        let unit = match self.pipeline.take_undo() {
            Ok(unit) => unit,
            Err(err) => return self.fail(&envelope, seq, err.code(), &err.to_string()),
        };

        let service =
            MutationService::new(&self.conn, &self.registry, &self.hook_log, &self.config);
        match service.replay(&unit.inverse, now) {
            Ok(outcome) => {
                self.pipeline.push_redo(unit);
                self.pipeline.record_success(&envelope.command_id, seq);
                self.hub.publish(&self.conn, &outcome.changes);
                CommandOutcome::succeeded(seq)
            }
            Err(err) => {
                let code = err.code();
                self.pipeline.restore_undo(unit);
                self.fail(&envelope, seq, code, &err.to_string())
            }
        }
    }

    /// Redoes the most recently undone command by replaying its forward
    /// payload (ids included, so a re-created node keeps its original id).
    pub fn redo(&mut self) -> CommandOutcome {
        let now = now_ms();
        let envelope = CommandEnvelope::new(CommandKind::Redo, now);
        let seq = match self.admit(&envelope) {
            Ok(seq) => seq,
            Err(outcome) => return outcome,
        };

        let unit = match self.pipeline.take_redo() {
            Ok(unit) => unit,
            Err(err) => return self.fail(&envelope, seq, err.code(), &err.to_string()),
        };

        let service =
            MutationService::new(&self.conn, &self.registry, &self.hook_log, &self.config);
        match service.replay(&unit.forward, now) {
            Ok(outcome) => {
                self.pipeline.rearm_undo(unit);
                self.pipeline.record_success(&envelope.command_id, seq);
                self.hub.publish(&self.conn, &outcome.changes);
                CommandOutcome::succeeded(seq)
            }
            Err(err) => {
                let code = err.code();
                self.pipeline.restore_redo(unit);
                self.fail(&envelope, seq, code, &err.to_string())
            }
        }
    }

    // ---- internals -------------------------------------------------------

    fn query(&self) -> QueryService<SqliteNodeRepository<'_>> {
        QueryService::new(SqliteNodeRepository::new(&self.conn), &self.config)
    }

    fn admit(&mut self, envelope: &CommandEnvelope) -> Result<u64, CommandOutcome> {
        let seq = self.pipeline.next_seq();
        if let Err(err) = self.pipeline.validate(envelope) {
            let message = err.to_string();
            self.pipeline
                .record_failure(&envelope.command_id, seq, err.code(), &message);
            return Err(CommandOutcome::failed(seq, err.code(), message));
        }
        Ok(seq)
    }

    fn run_mutation<F>(
        &mut self,
        envelope: CommandEnvelope,
        kind: CommandKind,
        operation: F,
    ) -> CommandOutcome
    where
        F: FnOnce(
            &MutationService<'_>,
        )
            -> Result<MutationOutcome, crate::service::mutation_service::MutationServiceError>,
    {
        let seq = match self.admit(&envelope) {
            Ok(seq) => seq,
            Err(outcome) => return outcome,
        };

        let service =
            MutationService::new(&self.conn, &self.registry, &self.hook_log, &self.config);
        match operation(&service) {
            Ok(outcome) => {
                let undo = if kind.is_undoable() {
                    undo_unit_from_changes(kind, &envelope.group_id, &outcome.changes)
                } else {
                    None
                };
                self.succeed(&envelope, seq, outcome.changes, undo)
                    .with_new_node_ids(outcome.new_node_ids)
            }
            Err(err) => {
                let code = err.code();
                self.fail(&envelope, seq, code, &err.to_string())
            }
        }
    }

    fn succeed(
        &mut self,
        envelope: &CommandEnvelope,
        seq: u64,
        changes: Vec<ChangeRecord>,
        undo: Option<UndoUnit>,
    ) -> CommandOutcome {
        if let Some(unit) = undo {
            self.pipeline.push_undo(unit);
        }
        self.pipeline.record_success(&envelope.command_id, seq);
        self.hub.publish(&self.conn, &changes);
        CommandOutcome::succeeded(seq)
    }

    fn fail(
        &mut self,
        envelope: &CommandEnvelope,
        seq: u64,
        code: ErrorCode,
        message: &str,
    ) -> CommandOutcome {
        self.pipeline
            .record_failure(&envelope.command_id, seq, code, message);
        CommandOutcome::failed(seq, code, message)
    }
}

impl Drop for ForestService {
    fn drop(&mut self) {
        self.hub.shutdown();
    }
}

/// Derives the symmetric undo unit for one batch of homogeneous change
/// records.
///
/// Created batches invert to deletes of the same ids; updated batches
/// invert to writes of the previous rows; deleted batches (recorded
/// children-first) invert to parents-first re-creation.
fn undo_unit_from_changes(
    kind: CommandKind,
    group_id: &str,
    changes: &[ChangeRecord],
) -> Option<UndoUnit> {
    if changes.is_empty() {
        return None;
    }

    let first_kind = changes[0].kind;
    if changes.iter().any(|change| change.kind != first_kind) {
        return None;
    }

    let unit = match first_kind {
        ChangeKind::Created => {
            let nodes: Vec<TreeNode> = changes
                .iter()
                .filter_map(|change| change.node.clone())
                .collect();
            let node_ids = nodes.iter().map(|node| node.id.clone()).collect();
            UndoUnit {
                group_id: group_id.to_string(),
                kind,
                forward: ReplayOp::CreateNodes { nodes },
                inverse: ReplayOp::DeleteNodes { node_ids },
            }
        }
        ChangeKind::Updated => {
            let forward: Vec<TreeNode> = changes
                .iter()
                .filter_map(|change| change.node.clone())
                .collect();
            let inverse: Vec<TreeNode> = changes
                .iter()
                .filter_map(|change| change.previous_node.clone())
                .collect();
            UndoUnit {
                group_id: group_id.to_string(),
                kind,
                forward: ReplayOp::WriteNodes { nodes: forward },
                inverse: ReplayOp::WriteNodes { nodes: inverse },
            }
        }
        ChangeKind::Deleted => {
            // Deletion changes arrive children-first; re-creation must go
            // parents-first.
            let mut previous: Vec<TreeNode> = changes
                .iter()
                .filter_map(|change| change.previous_node.clone())
                .collect();
            previous.reverse();
            let node_ids = previous.iter().map(|node| node.id.clone()).collect();
            UndoUnit {
                group_id: group_id.to_string(),
                kind,
                forward: ReplayOp::DeleteNodes { node_ids },
                inverse: ReplayOp::CreateNodes { nodes: previous },
            }
        }
    };
    Some(unit)
}
