//! Command envelopes, stable error codes and undo/redo replay payloads.
//!
//! # Responsibility
//! - Define the envelope every mutating entry point travels in.
//! - Define the closed command-kind set and which kinds are undoable.
//! - Define the symmetric replay payloads undo/redo execute.
//!
//! # Invariants
//! - `ErrorCode` strings are stable wire identifiers; they never change
//!   spelling.
//! - Replay payloads carry exact node rows, so replaying them restores
//!   byte-identical state (ids and versions included).

use crate::model::ids::NodeId;
use crate::model::node::TreeNode;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable error taxonomy surfaced by every public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NameNotUnique,
    StaleVersion,
    HasInboundRefs,
    IllegalRelation,
    NodeNotFound,
    InvalidOperation,
    WorkingCopyNotFound,
    WorkingCopyAlreadyExists,
    CommitConflict,
    ValidationError,
    DatabaseError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NameNotUnique => "NAME_NOT_UNIQUE",
            Self::StaleVersion => "STALE_VERSION",
            Self::HasInboundRefs => "HAS_INBOUND_REFS",
            Self::IllegalRelation => "ILLEGAL_RELATION",
            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::WorkingCopyNotFound => "WORKING_COPY_NOT_FOUND",
            Self::WorkingCopyAlreadyExists => "WORKING_COPY_ALREADY_EXISTS",
            Self::CommitConflict => "COMMIT_CONFLICT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sibling-name conflict handling requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameConflictMode {
    /// Fail with `NAME_NOT_UNIQUE` on collision.
    #[default]
    Error,
    /// Derive a free sibling name on collision.
    AutoRename,
}

/// Closed set of command kinds the pipeline dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    CreateWorkingCopyForCreate,
    CommitWorkingCopyForCreate,
    DiscardWorkingCopyForCreate,
    CreateWorkingCopy,
    CommitWorkingCopy,
    DiscardWorkingCopy,
    UpdateNodeName,
    MoveNodes,
    DuplicateNodes,
    PasteNodes,
    MoveToTrash,
    RecoverFromTrash,
    RemoveNodes,
    ImportNodes,
    Undo,
    Redo,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateWorkingCopyForCreate => "create-working-copy-for-create",
            Self::CommitWorkingCopyForCreate => "commit-working-copy-for-create",
            Self::DiscardWorkingCopyForCreate => "discard-working-copy-for-create",
            Self::CreateWorkingCopy => "create-working-copy",
            Self::CommitWorkingCopy => "commit-working-copy",
            Self::DiscardWorkingCopy => "discard-working-copy",
            Self::UpdateNodeName => "update-node-name",
            Self::MoveNodes => "move-nodes",
            Self::DuplicateNodes => "duplicate-nodes",
            Self::PasteNodes => "paste-nodes",
            Self::MoveToTrash => "move-to-trash",
            Self::RecoverFromTrash => "recover-from-trash",
            Self::RemoveNodes => "remove-nodes",
            Self::ImportNodes => "import-nodes",
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }

    /// Parses a wire kind string; unknown kinds are rejected by the
    /// pipeline as `INVALID_OPERATION`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create-working-copy-for-create" => Some(Self::CreateWorkingCopyForCreate),
            "commit-working-copy-for-create" => Some(Self::CommitWorkingCopyForCreate),
            "discard-working-copy-for-create" => Some(Self::DiscardWorkingCopyForCreate),
            "create-working-copy" => Some(Self::CreateWorkingCopy),
            "commit-working-copy" => Some(Self::CommitWorkingCopy),
            "discard-working-copy" => Some(Self::DiscardWorkingCopy),
            "update-node-name" => Some(Self::UpdateNodeName),
            "move-nodes" => Some(Self::MoveNodes),
            "duplicate-nodes" => Some(Self::DuplicateNodes),
            "paste-nodes" => Some(Self::PasteNodes),
            "move-to-trash" => Some(Self::MoveToTrash),
            "recover-from-trash" => Some(Self::RecoverFromTrash),
            "remove-nodes" => Some(Self::RemoveNodes),
            "import-nodes" => Some(Self::ImportNodes),
            "undo" => Some(Self::Undo),
            "redo" => Some(Self::Redo),
            _ => None,
        }
    }

    /// Whether success of this kind enters the undo history.
    ///
    /// The undoable family is create (the commit leg), update, move and
    /// delete; recover pairs with trash as its move-back.
    pub fn is_undoable(self) -> bool {
        matches!(
            self,
            Self::CommitWorkingCopyForCreate
                | Self::UpdateNodeName
                | Self::MoveNodes
                | Self::MoveToTrash
                | Self::RecoverFromTrash
                | Self::RemoveNodes
        )
    }
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Envelope identifying one command instance.
///
/// Several envelopes may share a `group_id` when they form one user-visible
/// operation (create = draft + commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub group_id: String,
    pub kind: CommandKind,
    /// Epoch ms at which the caller issued the command.
    pub issued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_name_conflict: Option<NameConflictMode>,
}

impl CommandEnvelope {
    /// Builds an envelope with fresh command and group ids.
    pub fn new(kind: CommandKind, issued_at: i64) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            group_id: Uuid::new_v4().to_string(),
            kind,
            issued_at,
            on_name_conflict: None,
        }
    }

    /// Builds an envelope joining an existing undo group.
    pub fn in_group(kind: CommandKind, group_id: impl Into<String>, issued_at: i64) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            group_id: group_id.into(),
            kind,
            issued_at,
            on_name_conflict: None,
        }
    }

    pub fn with_conflict_mode(mut self, mode: NameConflictMode) -> Self {
        self.on_name_conflict = Some(mode);
        self
    }
}

/// Replayable mutation payload carrying exact node rows.
///
/// Undo units store a forward and an inverse `ReplayOp`; executing either
/// writes the recorded rows verbatim, so replay restores ids, versions and
/// timestamps exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ReplayOp {
    /// Insert the recorded rows (entity stubs are re-created per cascade).
    CreateNodes { nodes: Vec<TreeNode> },
    /// Hard-delete the identified rows (entity cascade applies).
    DeleteNodes { node_ids: Vec<NodeId> },
    /// Overwrite existing rows with the recorded field states.
    WriteNodes { nodes: Vec<TreeNode> },
}

/// One undoable unit: a command plus its symmetric replay payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoUnit {
    pub group_id: String,
    pub kind: CommandKind,
    pub forward: ReplayOp,
    pub inverse: ReplayOp,
}

/// Result shape returned by facade entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    /// Monotonic sequence assigned by the pipeline.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_node_ids: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandOutcome {
    pub fn succeeded(seq: u64) -> Self {
        Self {
            success: true,
            seq,
            node_id: None,
            new_node_ids: Vec::new(),
            code: None,
            message: None,
        }
    }

    pub fn failed(seq: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            seq,
            node_id: None,
            new_node_ids: Vec::new(),
            code: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_new_node_ids(mut self, ids: Vec<NodeId>) -> Self {
        self.new_node_ids = ids;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandEnvelope, CommandKind, ErrorCode, NameConflictMode};

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            CommandKind::CreateWorkingCopyForCreate,
            CommandKind::CommitWorkingCopyForCreate,
            CommandKind::UpdateNodeName,
            CommandKind::MoveNodes,
            CommandKind::MoveToTrash,
            CommandKind::RecoverFromTrash,
            CommandKind::RemoveNodes,
            CommandKind::ImportNodes,
            CommandKind::Undo,
        ] {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::parse("drop-table"), None);
    }

    #[test]
    fn undoable_set_covers_create_update_move_delete() {
        assert!(CommandKind::CommitWorkingCopyForCreate.is_undoable());
        assert!(CommandKind::UpdateNodeName.is_undoable());
        assert!(CommandKind::MoveNodes.is_undoable());
        assert!(CommandKind::RemoveNodes.is_undoable());
        assert!(!CommandKind::Undo.is_undoable());
        assert!(!CommandKind::CreateWorkingCopyForCreate.is_undoable());
    }

    #[test]
    fn grouped_envelopes_share_group_id() {
        let first = CommandEnvelope::new(CommandKind::CreateWorkingCopyForCreate, 1);
        let second = CommandEnvelope::in_group(
            CommandKind::CommitWorkingCopyForCreate,
            first.group_id.clone(),
            2,
        )
        .with_conflict_mode(NameConflictMode::AutoRename);

        assert_eq!(first.group_id, second.group_id);
        assert_ne!(first.command_id, second.command_id);
        assert_eq!(second.on_name_conflict, Some(NameConflictMode::AutoRename));
    }

    #[test]
    fn error_codes_use_stable_wire_spelling() {
        assert_eq!(ErrorCode::NameNotUnique.as_str(), "NAME_NOT_UNIQUE");
        assert_eq!(ErrorCode::CommitConflict.as_str(), "COMMIT_CONFLICT");
    }
}
