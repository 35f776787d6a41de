//! Connection bootstrap utilities for the two-database store.
//!
//! # Responsibility
//! - Open the durable core database and attach the ephemeral database under
//!   the `eph` schema name.
//! - Configure connection pragmas required by core behavior.
//! - Trigger core migrations and the ephemeral rebuild before returning a
//!   usable connection.

use super::migrations::{apply_migrations, reset_ephemeral};
use super::DbResult;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Schema name the ephemeral database is attached under.
pub const EPHEMERAL_SCHEMA: &str = "eph";

/// Opens the store under `dir` for `app_name` and applies all pending
/// migrations.
///
/// Files are `{app_name}-core.db` and `{app_name}-ephemeral.db`. The
/// ephemeral file is wiped (schema rebuilt) as part of the open.
pub fn open_store(dir: impl AsRef<Path>, app_name: &str) -> DbResult<Connection> {
    let dir = dir.as_ref();
    let core_path = dir.join(format!("{app_name}-core.db"));
    let ephemeral_path = dir.join(format!("{app_name}-ephemeral.db"));

    let mut conn = Connection::open(core_path)?;
    conn.execute(
        "ATTACH DATABASE ?1 AS eph;",
        [ephemeral_path.to_string_lossy().as_ref()],
    )?;
    bootstrap_connection(&mut conn)?;
    Ok(conn)
}

/// Opens a fully in-memory store (core + ephemeral) and applies all
/// migrations. Used by tests and short-lived tooling.
pub fn open_store_in_memory() -> DbResult<Connection> {
    let mut conn = Connection::open_in_memory()?;
    conn.execute_batch("ATTACH DATABASE ':memory:' AS eph;")?;
    bootstrap_connection(&mut conn)?;
    Ok(conn)
}

fn bootstrap_connection(conn: &mut Connection) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn)?;
    reset_ephemeral(conn)?;
    Ok(())
}
