//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls, entity cascades and hooks into
//!   use-case level APIs.
//! - Keep embedding layers decoupled from storage details.

pub mod command_pipeline;
pub mod forest_service;
pub mod mutation_service;
pub mod query_service;
pub mod working_copy_service;
