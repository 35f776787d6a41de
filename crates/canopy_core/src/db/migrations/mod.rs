//! SQLite migration registry and executor.
//!
//! # Responsibility
//! - Register core-schema migrations in strictly increasing order.
//! - Apply pending migrations atomically.
//! - Rebuild the attached ephemeral schema on demand.
//!
//! # Invariants
//! - `version` values must remain monotonic.
//! - Applied migration version is mirrored to `PRAGMA user_version`.
//! - The ephemeral rebuild drops every object in the `eph` schema first.

use crate::db::{DbError, DbResult};
use log::{error, info, warn};
use rusqlite::Connection;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("0001_forest.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("0002_entities.sql"),
    },
];

/// Ephemeral schema applied to the attached `eph` database on every open.
pub(crate) const EPHEMERAL_SCHEMA_SQL: &str = include_str!("ephemeral.sql");

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS
        .iter()
        .map(|migration| migration.version)
        .max()
        .unwrap_or(0)
}

/// Applies all pending core-schema migrations on the provided connection.
///
/// # Invariants
/// - Migrations run in strictly increasing version order.
/// - `PRAGMA user_version` is updated after each successful migration step.
/// - Migration execution is wrapped in one transaction.
///
/// # Errors
/// - Returns [`DbError::UnsupportedSchemaVersion`] when the schema is newer
///   than this binary supports.
/// - Returns [`DbError::Sqlite`] when any migration step or commit fails.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let started_at = Instant::now();
    validate_registry(MIGRATIONS)?;

    let current_version = current_user_version(conn)?;
    let latest = latest_version();

    if current_version > latest {
        warn!(
            "event=db_migrate_done module=db status=error from_version={} to_version={} duration_ms={} error_code=unsupported_schema_version",
            current_version,
            latest,
            started_at.elapsed().as_millis()
        );
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: current_version,
            latest_supported: latest,
        });
    }

    if current_version == latest {
        info!(
            "event=db_migrate_done module=db status=ok from_version={} to_version={} applied_count=0 duration_ms={}",
            current_version,
            latest,
            started_at.elapsed().as_millis()
        );
        return Ok(());
    }

    info!(
        "event=db_migrate_start module=db status=start from_version={} to_version={}",
        current_version, latest
    );

    let tx = conn.transaction()?;
    let mut applied_count = 0u32;
    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        let step_started_at = Instant::now();
        tx.execute_batch(migration.sql).map_err(|err| {
            error!(
                "event=db_migrate_step_done module=db status=error target_version={} duration_ms={} error_code=migration_sql_failed error={}",
                migration.version,
                step_started_at.elapsed().as_millis(),
                err
            );
            DbError::Sqlite(err)
        })?;

        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))
            .map_err(|err| {
                error!(
                    "event=db_migrate_step_done module=db status=error target_version={} duration_ms={} error_code=user_version_update_failed error={}",
                    migration.version,
                    step_started_at.elapsed().as_millis(),
                    err
                );
                DbError::Sqlite(err)
            })?;

        applied_count += 1;
        info!(
            "event=db_migrate_step_done module=db status=ok target_version={} duration_ms={}",
            migration.version,
            step_started_at.elapsed().as_millis()
        );
    }

    tx.commit().map_err(|err| {
        error!(
            "event=db_migrate_done module=db status=error from_version={} to_version={} applied_count={} duration_ms={} error_code=commit_failed error={}",
            current_version,
            latest,
            applied_count,
            started_at.elapsed().as_millis(),
            err
        );
        DbError::Sqlite(err)
    })?;

    info!(
        "event=db_migrate_done module=db status=ok from_version={} to_version={} applied_count={} duration_ms={}",
        current_version,
        latest,
        applied_count,
        started_at.elapsed().as_millis()
    );

    Ok(())
}

/// Drops every table in the attached `eph` schema and re-applies the
/// ephemeral schema. Called once per open; working copies never survive a
/// restart.
pub fn reset_ephemeral(conn: &Connection) -> DbResult<()> {
    let mut stmt = conn.prepare(
        "SELECT name FROM eph.sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%';",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = Vec::new();
    while let Some(row) = rows.next()? {
        tables.push(row.get::<_, String>(0)?);
    }
    drop(rows);
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS eph.\"{table}\";"))?;
    }

    conn.execute_batch(EPHEMERAL_SCHEMA_SQL)?;
    info!(
        "event=ephemeral_reset module=db status=ok dropped_tables={}",
        tables.len()
    );
    Ok(())
}

fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

fn validate_registry(migrations: &[Migration]) -> DbResult<()> {
    let mut previous = 0;
    for migration in migrations {
        if migration.version == 0 {
            return Err(DbError::InvalidMigrationRegistry(
                "migration version must start from 1",
            ));
        }

        if migration.version <= previous {
            return Err(DbError::InvalidMigrationRegistry(
                "migration versions must be strictly increasing and unique",
            ));
        }

        previous = migration.version;
    }

    Ok(())
}
