//! Working-copy use-case service: draft, copy, mutate, commit, discard.
//!
//! # Responsibility
//! - Enforce the two-phase-commit protocol between ephemeral copies and
//!   durable nodes.
//! - Run the optimistic version check and sibling-name resolution during
//!   commit.
//!
//! # Invariants
//! - A commit either transitions node and working copy together or leaves
//!   both untouched (one transaction across both schemas).
//! - After a successful commit, no working copy referring to the committed
//!   node remains.
//! - Discard is idempotent.

use crate::model::command::{ErrorCode, NameConflictMode};
use crate::model::event::ChangeRecord;
use crate::model::ids::{NodeId, WorkingCopyId};
use crate::model::node::TreeNode;
use crate::model::working_copy::{WorkingCopy, WorkingCopyPatch};
use crate::naming::create_new_name;
use crate::plugin::hooks::{HookContext, HookError, HookFailureLog, HookStage};
use crate::plugin::lifecycle;
use crate::plugin::registry::PluginRegistry;
use crate::repo::entity_repo::EntityRepoError;
use crate::repo::node_repo::{self, NodeRepoError};
use crate::repo::working_copy_repo::{self, WorkingCopyRepoError};
use log::info;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result type for working-copy service operations.
pub type WorkingCopyServiceResult<T> = Result<T, WorkingCopyServiceError>;

/// Errors from working-copy service operations.
#[derive(Debug)]
pub enum WorkingCopyServiceError {
    /// Referenced node does not exist.
    NodeNotFound(NodeId),
    /// Referenced working copy does not exist.
    WorkingCopyNotFound(WorkingCopyId),
    /// An unresolved working copy already targets the source node.
    WorkingCopyAlreadyExists {
        node_id: NodeId,
        working_copy_id: WorkingCopyId,
    },
    /// The source node's version advanced past the copy's baseline.
    CommitConflict {
        node_id: NodeId,
        base_version: i64,
        current_version: i64,
    },
    /// Sibling name collision under error conflict mode.
    NameNotUnique { parent: NodeId, name: String },
    /// Caller's draft flag disagrees with the stored copy.
    DraftFlagMismatch(WorkingCopyId),
    /// A `stop_on_error` hook aborted the commit.
    HookAborted(HookError),
    /// Forest persistence failure.
    Repo(NodeRepoError),
    /// Ephemeral persistence failure.
    WorkingCopyRepo(WorkingCopyRepoError),
    /// Entity persistence failure.
    Entity(EntityRepoError),
}

impl Display for WorkingCopyServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node not found: {id}"),
            Self::WorkingCopyNotFound(id) => write!(f, "working copy not found: {id}"),
            Self::WorkingCopyAlreadyExists {
                node_id,
                working_copy_id,
            } => write!(
                f,
                "working copy {working_copy_id} already targets node {node_id}"
            ),
            Self::CommitConflict {
                node_id,
                base_version,
                current_version,
            } => write!(
                f,
                "commit conflict on {node_id}: copied at version {base_version}, node is at {current_version}"
            ),
            Self::NameNotUnique { parent, name } => {
                write!(f, "name `{name}` already taken under {parent}")
            }
            Self::DraftFlagMismatch(id) => {
                write!(f, "draft flag disagrees with stored working copy {id}")
            }
            Self::HookAborted(err) => write!(f, "hook aborted commit: {err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::WorkingCopyRepo(err) => write!(f, "{err}"),
            Self::Entity(err) => write!(f, "{err}"),
        }
    }
}

impl Error for WorkingCopyServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::WorkingCopyRepo(err) => Some(err),
            Self::Entity(err) => Some(err),
            Self::HookAborted(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NodeRepoError> for WorkingCopyServiceError {
    fn from(value: NodeRepoError) -> Self {
        match value {
            NodeRepoError::NodeNotFound(id) => Self::NodeNotFound(id),
            other => Self::Repo(other),
        }
    }
}

impl From<WorkingCopyRepoError> for WorkingCopyServiceError {
    fn from(value: WorkingCopyRepoError) -> Self {
        match value {
            WorkingCopyRepoError::NotFound(id) => Self::WorkingCopyNotFound(id),
            other => Self::WorkingCopyRepo(other),
        }
    }
}

impl From<EntityRepoError> for WorkingCopyServiceError {
    fn from(value: EntityRepoError) -> Self {
        Self::Entity(value)
    }
}

impl From<rusqlite::Error> for WorkingCopyServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(NodeRepoError::from(value))
    }
}

impl WorkingCopyServiceError {
    /// Stable error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NodeNotFound(_) => ErrorCode::NodeNotFound,
            Self::WorkingCopyNotFound(_) => ErrorCode::WorkingCopyNotFound,
            Self::WorkingCopyAlreadyExists { .. } => ErrorCode::WorkingCopyAlreadyExists,
            Self::CommitConflict { .. } => ErrorCode::CommitConflict,
            Self::NameNotUnique { .. } => ErrorCode::NameNotUnique,
            Self::DraftFlagMismatch(_) => ErrorCode::InvalidOperation,
            Self::HookAborted(_) => ErrorCode::ValidationError,
            Self::Repo(_) | Self::WorkingCopyRepo(_) | Self::Entity(_) => ErrorCode::DatabaseError,
        }
    }
}

/// Result of one successful commit.
#[derive(Debug)]
pub struct CommitOutcome {
    /// The node as persisted by the commit.
    pub node: TreeNode,
    /// The durable-store change record to publish after commit.
    pub change: ChangeRecord,
}

/// Working-copy service facade over the attached two-schema store.
pub struct WorkingCopyService<'a> {
    conn: &'a Connection,
    registry: &'a PluginRegistry,
    hook_log: &'a HookFailureLog,
}

impl<'a> WorkingCopyService<'a> {
    pub fn new(
        conn: &'a Connection,
        registry: &'a PluginRegistry,
        hook_log: &'a HookFailureLog,
    ) -> Self {
        Self {
            conn,
            registry,
            hook_log,
        }
    }

    /// Creates a draft working copy for a new node under `parent_id`.
    ///
    /// The draft name is resolved against the parent's live children up
    /// front, so the common commit path stays collision-free.
    pub fn create_draft(
        &self,
        parent_id: &NodeId,
        node_type: &str,
        base_name: &str,
        now: i64,
    ) -> WorkingCopyServiceResult<WorkingCopy> {
        node_repo::get_node_required(self.conn, parent_id)?;
        let siblings = node_repo::sibling_names(self.conn, parent_id, None)?;
        let name = create_new_name(&siblings, base_name);

        let copy = WorkingCopy::draft(parent_id.clone(), node_type, name, now);
        working_copy_repo::insert_working_copy(self.conn, &copy)?;
        info!(
            "event=working_copy_draft module=service status=ok working_copy_id={} parent={}",
            copy.working_copy_id, parent_id
        );
        Ok(copy)
    }

    /// Creates a working copy mirroring an existing node.
    ///
    /// # Errors
    /// - [`WorkingCopyServiceError::NodeNotFound`] when the source is
    ///   missing.
    /// - [`WorkingCopyServiceError::WorkingCopyAlreadyExists`] when an
    ///   unresolved copy already targets the node.
    pub fn create_from_node(
        &self,
        node_id: &NodeId,
        now: i64,
    ) -> WorkingCopyServiceResult<WorkingCopy> {
        let node = node_repo::get_node_required(self.conn, node_id)?;
        if let Some(existing) = working_copy_repo::find_by_source_node(self.conn, node_id)? {
            return Err(WorkingCopyServiceError::WorkingCopyAlreadyExists {
                node_id: node_id.clone(),
                working_copy_id: existing.working_copy_id,
            });
        }

        let copy = WorkingCopy::from_node(&node, now);
        working_copy_repo::insert_working_copy(self.conn, &copy)?;
        lifecycle::create_working_copies(self.conn, self.registry, node_id, &node.node_type, now)?;
        Ok(copy)
    }

    /// Returns the unresolved working copy targeting `node_id`, creating
    /// one when absent. Retry paths (a failed commit leaves the copy in
    /// place) reuse the surviving copy instead of failing.
    pub fn open_for_node(
        &self,
        node_id: &NodeId,
        now: i64,
    ) -> WorkingCopyServiceResult<WorkingCopy> {
        if let Some(existing) = working_copy_repo::find_by_source_node(self.conn, node_id)? {
            return Ok(existing);
        }
        self.create_from_node(node_id, now)
    }

    /// Applies a field patch to one working copy, refreshing `updated_at`.
    pub fn update(
        &self,
        working_copy_id: &WorkingCopyId,
        patch: &WorkingCopyPatch,
        now: i64,
    ) -> WorkingCopyServiceResult<WorkingCopy> {
        let mut copy = self.require_working_copy(working_copy_id)?;

        if let Some(name) = &patch.name {
            copy.name = name.clone();
        }
        if let Some(description) = &patch.description {
            copy.description = description.clone();
        }
        if let Some(parent) = &patch.parent_node_id {
            copy.parent_node_id = parent.clone();
        }
        if let Some(payload) = &patch.payload {
            copy.payload = Some(payload.clone());
        }
        copy.updated_at = now;

        working_copy_repo::update_working_copy(self.conn, &copy)?;
        Ok(copy)
    }

    /// Whether the copy's source node moved past the recorded baseline.
    /// Draft copies never conflict.
    pub fn check_conflict(
        &self,
        working_copy_id: &WorkingCopyId,
    ) -> WorkingCopyServiceResult<bool> {
        let copy = self.require_working_copy(working_copy_id)?;
        if copy.is_draft {
            return Ok(false);
        }

        let source_id = copy
            .working_copy_of
            .as_ref()
            .ok_or_else(|| WorkingCopyServiceError::DraftFlagMismatch(working_copy_id.clone()))?;
        let source = node_repo::get_node_required(self.conn, source_id)?;
        Ok(Some(source.version) != copy.base_version)
    }

    /// Commits one working copy: creates the node (draft) or writes the
    /// source node back (non-draft), then removes the copy.
    ///
    /// # Errors
    /// - `WORKING_COPY_NOT_FOUND` when the copy is missing.
    /// - `COMMIT_CONFLICT` when the source advanced past the baseline; the
    ///   copy survives for a retry.
    /// - `NAME_NOT_UNIQUE` under error conflict mode.
    pub fn commit(
        &self,
        working_copy_id: &WorkingCopyId,
        is_draft: bool,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> WorkingCopyServiceResult<CommitOutcome> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let outcome = self.commit_in_tx(&tx, working_copy_id, is_draft, on_name_conflict, now)?;
        tx.commit()?;

        info!(
            "event=working_copy_commit module=service status=ok working_copy_id={} node_id={} draft={}",
            working_copy_id, outcome.node.id, is_draft
        );
        Ok(outcome)
    }

    fn commit_in_tx(
        &self,
        tx: &Transaction<'_>,
        working_copy_id: &WorkingCopyId,
        is_draft: bool,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> WorkingCopyServiceResult<CommitOutcome> {
        let copy = working_copy_repo::get_working_copy(tx, working_copy_id)?
            .ok_or_else(|| WorkingCopyServiceError::WorkingCopyNotFound(working_copy_id.clone()))?;
        if copy.is_draft != is_draft {
            return Err(WorkingCopyServiceError::DraftFlagMismatch(
                working_copy_id.clone(),
            ));
        }

        let source = if is_draft {
            None
        } else {
            let source_id = copy.working_copy_of.as_ref().ok_or_else(|| {
                WorkingCopyServiceError::DraftFlagMismatch(working_copy_id.clone())
            })?;
            let source = node_repo::get_node_required(tx, source_id)?;
            let base_version = copy.base_version.unwrap_or(source.version);
            if source.version > base_version {
                return Err(WorkingCopyServiceError::CommitConflict {
                    node_id: source.id.clone(),
                    base_version,
                    current_version: source.version,
                });
            }
            Some(source)
        };

        let exclude = source.as_ref().map(|node| &node.id);
        let siblings = node_repo::sibling_names(tx, &copy.parent_node_id, exclude)?;
        let name = if siblings.contains(&copy.name) {
            match on_name_conflict {
                NameConflictMode::Error => {
                    return Err(WorkingCopyServiceError::NameNotUnique {
                        parent: copy.parent_node_id.clone(),
                        name: copy.name.clone(),
                    });
                }
                NameConflictMode::AutoRename => create_new_name(&siblings, &copy.name),
            }
        } else {
            copy.name.clone()
        };

        let (node, change, stage_pair) = match source {
            None => {
                let mut node = TreeNode::new(
                    NodeId::generate(),
                    copy.parent_node_id.clone(),
                    copy.node_type.clone(),
                    name,
                    now,
                );
                node.description = copy.description.clone();

                self.run_hooks(HookStage::BeforeCreate, &node, copy.payload.as_ref())?;
                let change = node_repo::insert_node(tx, &node)?;
                lifecycle::on_node_create(tx, self.registry, &node.id, &node.node_type, now)?;
                (node, change, HookStage::AfterCreate)
            }
            Some(source) => {
                let mut node = source;
                node.parent_node_id = copy.parent_node_id.clone();
                node.name = name;
                node.description = copy.description.clone();
                node.updated_at = now;
                node.version += 1;

                self.run_hooks(HookStage::BeforeUpdate, &node, copy.payload.as_ref())?;
                let change = node_repo::update_node(tx, &node)?;
                (node, change, HookStage::AfterUpdate)
            }
        };

        let session = lifecycle::load_session(tx, self.registry, &node.id, &node.node_type)?;
        lifecycle::commit_working_copies(tx, self.registry, &node.node_type, &session, now)?;
        working_copy_repo::delete_working_copy(tx, working_copy_id)?;

        self.run_hooks(stage_pair, &node, copy.payload.as_ref())?;
        Ok(CommitOutcome { node, change })
    }

    /// Deletes one working copy and its buffered entity rows. Idempotent.
    pub fn discard(
        &self,
        working_copy_id: &WorkingCopyId,
    ) -> WorkingCopyServiceResult<Option<WorkingCopy>> {
        let Some(copy) = working_copy_repo::get_working_copy(self.conn, working_copy_id)? else {
            return Ok(None);
        };

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        if let Some(source_id) = &copy.working_copy_of {
            let session =
                lifecycle::load_session(&tx, self.registry, source_id, &copy.node_type)?;
            lifecycle::discard_working_copies(&tx, &session)?;
        }
        working_copy_repo::delete_working_copy(&tx, working_copy_id)?;
        tx.commit()?;
        Ok(Some(copy))
    }

    fn require_working_copy(
        &self,
        working_copy_id: &WorkingCopyId,
    ) -> WorkingCopyServiceResult<WorkingCopy> {
        working_copy_repo::get_working_copy(self.conn, working_copy_id)?
            .ok_or_else(|| WorkingCopyServiceError::WorkingCopyNotFound(working_copy_id.clone()))
    }

    fn run_hooks(
        &self,
        stage: HookStage,
        node: &TreeNode,
        payload: Option<&serde_json::Value>,
    ) -> WorkingCopyServiceResult<()> {
        let ctx = HookContext {
            node_id: &node.id,
            node_type: &node.node_type,
            name: Some(&node.name),
            parent_node_id: Some(&node.parent_node_id),
            payload,
        };
        self.registry
            .run_hooks(self.hook_log, stage, &ctx)
            .map_err(WorkingCopyServiceError::HookAborted)
    }
}
