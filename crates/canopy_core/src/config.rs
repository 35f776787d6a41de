//! Core runtime configuration.
//!
//! # Responsibility
//! - Carry the database-name prefix and every operational limit in one
//!   place, so services never hard-code bounds.

/// Tunable limits and identity for one core instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Database-name prefix; files are `{app_name}-core.db` and
    /// `{app_name}-ephemeral.db`.
    pub app_name: String,
    pub max_undo_stack_size: usize,
    pub max_redo_stack_size: usize,
    pub max_event_history_size: usize,
    pub max_copy_nodes: usize,
    pub max_paste_nodes: usize,
    pub max_name_length: usize,
    pub max_command_id_length: usize,
    pub max_error_message_length: usize,
    pub max_tree_depth: usize,
    pub command_timeout_ms: u64,
    pub subscription_gc_interval_ms: u64,
    pub subscription_idle_limit_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "canopy".to_string(),
            max_undo_stack_size: 100,
            max_redo_stack_size: 100,
            max_event_history_size: 1000,
            max_copy_nodes: 1000,
            max_paste_nodes: 1000,
            max_name_length: 255,
            max_command_id_length: 100,
            max_error_message_length: 200,
            max_tree_depth: 50,
            command_timeout_ms: 30_000,
            subscription_gc_interval_ms: 300_000,
            subscription_idle_limit_ms: 300_000,
        }
    }
}

impl CoreConfig {
    /// Config with a custom database-name prefix and default limits.
    pub fn with_app_name(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }
}
