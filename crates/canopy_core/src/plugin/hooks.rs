//! Node lifecycle hooks for plugin node types.
//!
//! # Responsibility
//! - Define the hook contract plugins implement around node mutations.
//! - Record suppressed hook failures in a bounded ring buffer.
//!
//! # Invariants
//! - Hooks receive identifiers and payload snapshots only, never store
//!   handles.
//! - A failing hook aborts its mutation only when the implementation opts
//!   in via `stop_on_error`.

use crate::model::ids::NodeId;
use crate::model::now_ms;
use log::warn;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

/// Mutation stage a hook runs around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeMove,
    AfterMove,
    OnLoad,
    OnUnload,
}

impl HookStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeCreate => "before_create",
            Self::AfterCreate => "after_create",
            Self::BeforeUpdate => "before_update",
            Self::AfterUpdate => "after_update",
            Self::BeforeDelete => "before_delete",
            Self::AfterDelete => "after_delete",
            Self::BeforeMove => "before_move",
            Self::AfterMove => "after_move",
            Self::OnLoad => "on_load",
            Self::OnUnload => "on_unload",
        }
    }
}

impl Display for HookStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot handed to hooks. Identifiers and payloads only.
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub node_id: &'a NodeId,
    pub node_type: &'a str,
    pub name: Option<&'a str>,
    pub parent_node_id: Option<&'a NodeId>,
    pub payload: Option<&'a serde_json::Value>,
}

/// Failure raised by a hook implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError {
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for HookError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for HookError {}

/// Hook contract for one registered node type.
///
/// Every stage defaults to a no-op so implementations override only what
/// they need.
#[allow(unused_variables)]
pub trait NodeTypeHooks: Send + Sync {
    /// When true, a failure in any stage aborts the surrounding mutation.
    fn stop_on_error(&self) -> bool {
        false
    }

    fn before_create(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn after_create(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn before_update(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn after_update(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn before_delete(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn after_delete(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn before_move(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn after_move(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn on_load(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }
    fn on_unload(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    fn run_stage(&self, stage: HookStage, ctx: &HookContext<'_>) -> Result<(), HookError> {
        match stage {
            HookStage::BeforeCreate => self.before_create(ctx),
            HookStage::AfterCreate => self.after_create(ctx),
            HookStage::BeforeUpdate => self.before_update(ctx),
            HookStage::AfterUpdate => self.after_update(ctx),
            HookStage::BeforeDelete => self.before_delete(ctx),
            HookStage::AfterDelete => self.after_delete(ctx),
            HookStage::BeforeMove => self.before_move(ctx),
            HookStage::AfterMove => self.after_move(ctx),
            HookStage::OnLoad => self.on_load(ctx),
            HookStage::OnUnload => self.on_unload(ctx),
        }
    }
}

/// One suppressed hook failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub stage: HookStage,
    pub node_type: String,
    pub node_id: NodeId,
    pub message: String,
    pub timestamp: i64,
}

/// Bounded ring buffer of suppressed hook failures.
pub struct HookFailureLog {
    capacity: usize,
    entries: Mutex<VecDeque<HookFailure>>,
}

impl HookFailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one suppressed failure, evicting the oldest entry at
    /// capacity.
    pub fn record(&self, stage: HookStage, ctx: &HookContext<'_>, err: &HookError) {
        warn!(
            "event=hook_failed module=plugin status=suppressed stage={} node_type={} node_id={} error={}",
            stage, ctx.node_type, ctx.node_id, err
        );

        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(HookFailure {
            stage,
            node_type: ctx.node_type.to_string(),
            node_id: ctx.node_id.clone(),
            message: err.message.clone(),
            timestamp: now_ms(),
        });
    }

    /// Snapshot of recorded failures, oldest first.
    pub fn snapshot(&self) -> Vec<HookFailure> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{HookContext, HookError, HookFailureLog, HookStage, NodeTypeHooks};
    use crate::model::ids::NodeId;

    struct FailingHooks;

    impl NodeTypeHooks for FailingHooks {
        fn before_delete(&self, _ctx: &HookContext<'_>) -> Result<(), HookError> {
            Err(HookError::new("refusing delete"))
        }
    }

    #[test]
    fn default_stages_are_no_ops() {
        let hooks = FailingHooks;
        let node_id = NodeId::new("n1");
        let ctx = HookContext {
            node_id: &node_id,
            node_type: "folder",
            name: None,
            parent_node_id: None,
            payload: None,
        };

        assert!(hooks.run_stage(HookStage::BeforeCreate, &ctx).is_ok());
        assert!(hooks.run_stage(HookStage::BeforeDelete, &ctx).is_err());
        assert!(!hooks.stop_on_error());
    }

    #[test]
    fn failure_log_evicts_oldest_at_capacity() {
        let log = HookFailureLog::new(2);
        let node_id = NodeId::new("n1");
        let ctx = HookContext {
            node_id: &node_id,
            node_type: "folder",
            name: None,
            parent_node_id: None,
            payload: None,
        };

        for n in 0..3 {
            log.record(
                HookStage::AfterUpdate,
                &ctx,
                &HookError::new(format!("failure {n}")),
            );
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].message, "failure 1");
        assert_eq!(snapshot[1].message, "failure 2");
    }
}
