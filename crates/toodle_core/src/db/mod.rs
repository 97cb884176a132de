//! Persistence bootstrap for item stores.
//!
//! A connection leaves this module only after every bundled schema script
//! has run, so repositories can assume the latest layout.

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

use std::error::Error;
use std::fmt::{Display, Formatter};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    /// Opening or configuring the connection failed.
    Sqlite(rusqlite::Error),
    /// A bundled schema script failed; nothing from the batch was kept.
    Migration {
        version: u32,
        script: &'static str,
        source: rusqlite::Error,
    },
    /// The file was written by a build with a newer schema.
    SchemaTooNew { found: u32, supported: u32 },
}

impl DbError {
    /// Schema version tied to this failure, when there is one.
    pub fn schema_version(&self) -> Option<u32> {
        match self {
            Self::Migration { version, .. } => Some(*version),
            Self::SchemaTooNew { found, .. } => Some(*found),
            Self::Sqlite(_) => None,
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite: {err}"),
            Self::Migration {
                version,
                script,
                source,
            } => write!(f, "schema script {script}.sql (v{version}) failed: {source}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "schema v{found} comes from a newer build; this build reads up to v{supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(source) | Self::Migration { source, .. } => Some(source),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
