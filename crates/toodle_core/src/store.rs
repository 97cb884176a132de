//! Store: the root native resource owning the database connection.
//!
//! # Responsibility
//! - Open (and migrate) the file-backed item store at a caller-supplied path.
//! - Share the collection's change channel with every manager derived from it.
//!
//! # Invariants
//! - A `Store` value exists only after migrations succeeded.
//! - Closing a store drops its connection; managers derived from it must be
//!   closed first. The runtime cascades if they are not.

use crate::db::{open_db, open_db_in_memory};
use crate::error::{CoreError, CoreResult};
use crate::handle::{NativeResource, StoreKind};
use crate::notify::ChangeChannel;
use crate::repo::item_repo::SqliteItemRepository;
use log::info;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IN_MEMORY_LABEL: &str = ":memory:";

pub struct Store {
    conn: Connection,
    path: PathBuf,
    channel: Arc<ChangeChannel>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Opens the store at `path` with a private change channel.
    ///
    /// # Errors
    /// - `CoreError::NativeConstruction` when the file cannot be opened or
    ///   its schema cannot be migrated.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let channel = Arc::new(ChangeChannel::new(path.display().to_string()));
        Self::open_with_channel(path, channel)
    }

    /// Opens the store at `path`, joining an existing collection channel.
    pub fn open_with_channel(
        path: impl AsRef<Path>,
        channel: Arc<ChangeChannel>,
    ) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_db(&path).map_err(|source| CoreError::NativeConstruction {
            path: path.clone(),
            source,
        })?;
        info!(
            "event=store_open module=store status=ok path={}",
            path.display()
        );
        Ok(Self {
            conn,
            path,
            channel,
        })
    }

    /// Opens a private in-memory store; nothing outlives `close`.
    pub fn open_in_memory() -> CoreResult<Self> {
        let path = PathBuf::from(IN_MEMORY_LABEL);
        let conn = open_db_in_memory().map_err(|source| CoreError::NativeConstruction {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            conn,
            path,
            channel: Arc::new(ChangeChannel::new(IN_MEMORY_LABEL)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channel(&self) -> &Arc<ChangeChannel> {
        &self.channel
    }

    pub(crate) fn repo(&self) -> CoreResult<SqliteItemRepository<'_>> {
        Ok(SqliteItemRepository::try_new(&self.conn)?)
    }

    /// Closes the connection.
    pub fn close(self) {
        info!(
            "event=store_close module=store status=ok path={}",
            self.path.display()
        );
    }
}

impl NativeResource for Store {
    type Kind = StoreKind;

    fn release(self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::error::CoreError;
    use crate::repo::item_repo::ItemRepository;

    #[test]
    fn open_in_memory_yields_ready_repository() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.repo().unwrap();
        assert!(repo.list_items().unwrap().is_empty());
        drop(repo);
        store.close();
    }

    #[test]
    fn open_fails_with_native_construction_error_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("toodle.sqlite3");

        let err = Store::open(&path).unwrap_err();
        match err {
            CoreError::NativeConstruction { path: failed, .. } => assert_eq!(failed, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
