//! Command pipeline: envelope validation, sequencing, undo/redo stacks and
//! the recorded command history.
//!
//! # Responsibility
//! - Assign a monotonic sequence to every processed command.
//! - Keep the bounded undo/redo stacks and the bounded history ring.
//! - Sanitize error text before it enters the recorded history.
//!
//! # Invariants
//! - Undo/redo stacks evict oldest-first at capacity and never grow past
//!   it.
//! - A new undoable command clears the redo stack.
//! - Recorded messages contain no newlines/tabs and respect the configured
//!   length cap.

use crate::config::CoreConfig;
use crate::model::command::{CommandEnvelope, ErrorCode, UndoUnit};
use crate::model::now_ms;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One recorded command, success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEventRecord {
    pub command_id: String,
    pub seq: u64,
    pub timestamp: i64,
    /// Set for failures; `None` marks success.
    pub code: Option<ErrorCode>,
    /// Sanitized failure text.
    pub message: Option<String>,
}

/// Pipeline-level failures. All surface as `INVALID_OPERATION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    EmptyCommandId,
    CommandIdTooLong { length: usize, max: usize },
    NothingToUndo,
    NothingToRedo,
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCommandId => write!(f, "command id must not be empty"),
            Self::CommandIdTooLong { length, max } => {
                write!(f, "command id length {length} exceeds {max}")
            }
            Self::NothingToUndo => write!(f, "undo stack is empty"),
            Self::NothingToRedo => write!(f, "redo stack is empty"),
        }
    }
}

impl Error for PipelineError {}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidOperation
    }
}

/// Sequencing and history state for one core instance.
pub struct CommandPipeline {
    undo_stack: VecDeque<UndoUnit>,
    redo_stack: VecDeque<UndoUnit>,
    history: VecDeque<CommandEventRecord>,
    next_seq: u64,
    max_undo: usize,
    max_redo: usize,
    max_history: usize,
    max_command_id_length: usize,
    max_error_message_length: usize,
}

impl CommandPipeline {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            history: VecDeque::new(),
            next_seq: 0,
            max_undo: config.max_undo_stack_size,
            max_redo: config.max_redo_stack_size,
            max_history: config.max_event_history_size,
            max_command_id_length: config.max_command_id_length,
            max_error_message_length: config.max_error_message_length,
        }
    }

    /// Validates the envelope identity fields.
    pub fn validate(&self, envelope: &CommandEnvelope) -> Result<(), PipelineError> {
        if envelope.command_id.trim().is_empty() {
            return Err(PipelineError::EmptyCommandId);
        }
        if envelope.command_id.len() > self.max_command_id_length {
            return Err(PipelineError::CommandIdTooLong {
                length: envelope.command_id.len(),
                max: self.max_command_id_length,
            });
        }
        Ok(())
    }

    /// Claims the next command sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Records a successful command in the history ring.
    pub fn record_success(&mut self, command_id: &str, seq: u64) {
        self.push_history(CommandEventRecord {
            command_id: command_id.to_string(),
            seq,
            timestamp: now_ms(),
            code: None,
            message: None,
        });
    }

    /// Records a failed command; the message is sanitized before storage.
    pub fn record_failure(&mut self, command_id: &str, seq: u64, code: ErrorCode, message: &str) {
        let sanitized = self.sanitize_message(message);
        self.push_history(CommandEventRecord {
            command_id: command_id.to_string(),
            seq,
            timestamp: now_ms(),
            code: Some(code),
            message: Some(sanitized),
        });
    }

    /// Pushes one undoable unit, evicting oldest-first at capacity and
    /// clearing the redo stack.
    pub fn push_undo(&mut self, unit: UndoUnit) {
        if self.undo_stack.len() == self.max_undo {
            self.undo_stack.pop_front();
        }
        self.undo_stack.push_back(unit);
        self.redo_stack.clear();
    }

    /// Pops the most recent undo unit.
    pub fn take_undo(&mut self) -> Result<UndoUnit, PipelineError> {
        self.undo_stack.pop_back().ok_or(PipelineError::NothingToUndo)
    }

    /// Puts a unit back after a failed inverse execution.
    pub fn restore_undo(&mut self, unit: UndoUnit) {
        self.undo_stack.push_back(unit);
    }

    /// Pushes one unit onto the redo stack, evicting oldest-first.
    pub fn push_redo(&mut self, unit: UndoUnit) {
        if self.redo_stack.len() == self.max_redo {
            self.redo_stack.pop_front();
        }
        self.redo_stack.push_back(unit);
    }

    /// Pops the most recent redo unit.
    pub fn take_redo(&mut self) -> Result<UndoUnit, PipelineError> {
        self.redo_stack.pop_back().ok_or(PipelineError::NothingToRedo)
    }

    /// Puts a unit back after a failed redo execution.
    pub fn restore_redo(&mut self, unit: UndoUnit) {
        self.redo_stack.push_back(unit);
    }

    /// Re-arms the undo stack after a successful undo, without clearing
    /// redo.
    pub fn rearm_undo(&mut self, unit: UndoUnit) {
        if self.undo_stack.len() == self.max_undo {
            self.undo_stack.pop_front();
        }
        self.undo_stack.push_back(unit);
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    /// History snapshot, oldest first.
    pub fn history(&self) -> Vec<CommandEventRecord> {
        self.history.iter().cloned().collect()
    }

    fn push_history(&mut self, record: CommandEventRecord) {
        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Strips newlines/tabs and truncates to the configured cap.
    fn sanitize_message(&self, value: &str) -> String {
        let normalized = value.replace(['\n', '\r', '\t'], " ");
        let mut truncated = normalized
            .chars()
            .take(self.max_error_message_length)
            .collect::<String>();
        if normalized.chars().count() > self.max_error_message_length {
            truncated.push_str("...");
        }
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandPipeline, PipelineError};
    use crate::config::CoreConfig;
    use crate::model::command::{
        CommandEnvelope, CommandKind, ErrorCode, ReplayOp, UndoUnit,
    };

    fn unit(tag: &str) -> UndoUnit {
        UndoUnit {
            group_id: tag.to_string(),
            kind: CommandKind::MoveNodes,
            forward: ReplayOp::DeleteNodes { node_ids: vec![] },
            inverse: ReplayOp::DeleteNodes { node_ids: vec![] },
        }
    }

    #[test]
    fn validate_rejects_bad_command_ids() {
        let pipeline = CommandPipeline::new(&CoreConfig::default());

        let mut envelope = CommandEnvelope::new(CommandKind::MoveNodes, 1);
        envelope.command_id = String::new();
        assert!(matches!(
            pipeline.validate(&envelope).unwrap_err(),
            PipelineError::EmptyCommandId
        ));

        envelope.command_id = "x".repeat(101);
        assert!(matches!(
            pipeline.validate(&envelope).unwrap_err(),
            PipelineError::CommandIdTooLong { length: 101, max: 100 }
        ));

        envelope.command_id = "x".repeat(100);
        pipeline.validate(&envelope).unwrap();
    }

    #[test]
    fn undo_stack_evicts_oldest_and_clears_redo() {
        let mut config = CoreConfig::default();
        config.max_undo_stack_size = 2;
        let mut pipeline = CommandPipeline::new(&config);

        pipeline.push_undo(unit("a"));
        pipeline.push_undo(unit("b"));
        let undone = pipeline.take_undo().unwrap();
        pipeline.push_redo(undone);
        assert_eq!(pipeline.redo_len(), 1);

        pipeline.push_undo(unit("c"));
        pipeline.push_undo(unit("d"));
        // "a" was evicted when "d" arrived; redo cleared by the new push.
        assert_eq!(pipeline.undo_len(), 2);
        assert_eq!(pipeline.redo_len(), 0);
        assert_eq!(pipeline.take_undo().unwrap().group_id, "d");
        assert_eq!(pipeline.take_undo().unwrap().group_id, "c");
        assert!(matches!(
            pipeline.take_undo().unwrap_err(),
            PipelineError::NothingToUndo
        ));
    }

    #[test]
    fn history_sanitizes_and_caps_messages() {
        let mut config = CoreConfig::default();
        config.max_event_history_size = 2;
        config.max_error_message_length = 10;
        let mut pipeline = CommandPipeline::new(&config);

        let seq = pipeline.next_seq();
        pipeline.record_failure(
            "cmd-1",
            seq,
            ErrorCode::DatabaseError,
            "line one\nline two\tand then some trailing detail",
        );
        let seq = pipeline.next_seq();
        pipeline.record_success("cmd-2", seq);
        let seq = pipeline.next_seq();
        pipeline.record_success("cmd-3", seq);

        let history = pipeline.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command_id, "cmd-2");
        assert_eq!(history[1].command_id, "cmd-3");

        let mut short = CommandPipeline::new(&config);
        let seq = short.next_seq();
        short.record_failure("cmd", seq, ErrorCode::UnknownError, "bad\nnews everyone");
        let record = &short.history()[0];
        let message = record.message.as_deref().unwrap();
        assert!(!message.contains('\n'));
        assert!(message.starts_with("bad news"));
        assert!(message.ends_with("..."));
    }

    #[test]
    fn sequence_is_monotonic() {
        let mut pipeline = CommandPipeline::new(&CoreConfig::default());
        let first = pipeline.next_seq();
        let second = pipeline.next_seq();
        assert!(second > first);
    }
}
