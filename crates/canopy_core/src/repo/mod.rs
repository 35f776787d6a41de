//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts over the core and
//!   ephemeral schemas.
//! - Isolate SQLite query details from service/business orchestration.
//!
//! # Invariants
//! - Repository writes validate domain records before persistence.
//! - Repository APIs return semantic errors (`NodeNotFound`) in addition to
//!   DB transport errors.
//! - Functions take plain connections so services can compose them inside
//!   one transaction spanning both schemas.

pub mod entity_repo;
pub mod node_repo;
pub mod root_state_repo;
pub mod view_state_repo;
pub mod working_copy_repo;
