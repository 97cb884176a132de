//! Bundled schema scripts, applied in version order.
//!
//! # Invariants
//! - Script versions start at 1 and increase by one.
//! - Pending scripts share one transaction; each bumps `PRAGMA user_version`
//!   as it completes, so a failure leaves the file at its old version.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

struct Script {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

macro_rules! script {
    ($version:literal, $name:literal) => {
        Script {
            version: $version,
            name: $name,
            sql: include_str!(concat!($name, ".sql")),
        }
    };
}

const SCRIPTS: &[Script] = &[
    script!(1, "0001_items"),
    script!(2, "0002_item_tombstones"),
];

/// Schema version produced by the newest bundled script.
pub fn latest_version() -> u32 {
    SCRIPTS.last().map_or(0, |script| script.version)
}

/// Names of the scripts a database at `version` still needs.
pub fn pending_scripts(version: u32) -> Vec<&'static str> {
    SCRIPTS
        .iter()
        .filter(|script| script.version > version)
        .map(|script| script.name)
        .collect()
}

/// Brings `conn` to [`latest_version`] and returns how many scripts ran.
///
/// # Errors
/// - `DbError::SchemaTooNew` when the file is ahead of this build.
/// - `DbError::Migration` naming the first script that failed.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<usize> {
    let found = current_user_version(conn)?;
    let supported = latest_version();
    if found > supported {
        return Err(DbError::SchemaTooNew { found, supported });
    }

    let pending = SCRIPTS
        .iter()
        .filter(|script| script.version > found)
        .collect::<Vec<_>>();
    if pending.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    for script in &pending {
        tx.execute_batch(script.sql)
            .and_then(|()| tx.pragma_update(None, "user_version", script.version))
            .map_err(|source| DbError::Migration {
                version: script.version,
                script: script.name,
                source,
            })?;
        debug!(
            "event=db_migrate module=db status=step script={}",
            script.name
        );
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from={} to={} applied={}",
        found,
        supported,
        pending.len()
    );
    Ok(pending.len())
}

pub(crate) fn current_user_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}
