//! Database migration runner.
//!
//! Runs on every [`Database::open_at`]; `PRAGMA user_version` records how
//! many migrations the file has seen.
//!
//! [`Database::open_at`]: crate::Database::open_at

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// Applied in order; entry `i` moves `user_version` from `i` to `i + 1`.
const MIGRATIONS: &[(&str, Migration)] = &[("v001_initial", v001_initial::up)];

const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the cache schema up to [`CURRENT_VERSION`].
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    tracing::debug!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking cache migrations"
    );

    for (version, (name, up)) in (1u32..).zip(MIGRATIONS) {
        if current >= version {
            continue;
        }
        tracing::info!(migration = name, "applying cache migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}
