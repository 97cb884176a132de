//! Per-process store cache keyed by database path.
//!
//! # Responsibility
//! - Keep at most one open store (and one collection manager) per path.
//! - Sequence store release and reacquisition with the host's foreground
//!   and background transitions.
//!
//! # Invariants
//! - Paths are keyed canonically: two spellings of one file share a store.
//! - Managers are always closed before the store they came from.
//! - Paths stay known across a background phase and reopen on foreground.
//! - Listener registrations do not survive a background phase; callers
//!   register again after `enter_foreground`.

use crate::error::{CoreError, CoreResult};
use crate::handle::{Handle, ManagerKind, StoreKind};
use crate::runtime::{collection_key, ListManager, Runtime, RuntimeStats};
use log::info;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Foreground,
    Background,
}

struct OpenStore {
    store: Handle<StoreKind>,
    manager: Option<Handle<ManagerKind>>,
}

pub struct Session {
    runtime: Runtime,
    known: BTreeMap<PathBuf, Option<OpenStore>>,
    phase: LifecyclePhase,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            runtime: Runtime::new(),
            known: BTreeMap::new(),
            phase: LifecyclePhase::Foreground,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Opens the store at `path` unless it is already open.
    pub fn open_store(&mut self, path: impl AsRef<Path>) -> CoreResult<&Handle<StoreKind>> {
        let key = collection_key(path.as_ref());
        if !self.is_open(&key) {
            let store = self.runtime.open_store(&key)?;
            self.known.insert(
                key.clone(),
                Some(OpenStore {
                    store,
                    manager: None,
                }),
            );
        }
        self.open_entry(&key).map(|entry| &entry.store)
    }

    pub fn is_open(&self, path: impl AsRef<Path>) -> bool {
        let key = collection_key(path.as_ref());
        matches!(self.known.get(&key), Some(Some(_)))
    }

    /// Returns the manager for an open store, creating it on first use.
    pub fn list_manager(&mut self, path: impl AsRef<Path>) -> CoreResult<ListManager<'_>> {
        let key = collection_key(path.as_ref());
        let path = key.as_path();
        let entry = self
            .known
            .get_mut(path)
            .and_then(Option::as_mut)
            .ok_or_else(|| CoreError::NotOpen(path.to_path_buf()))?;
        if entry.manager.is_none() {
            entry.manager = Some(self.runtime.list_manager(&entry.store)?);
        }

        let manager = self
            .open_entry(path)?
            .manager
            .as_ref()
            .ok_or_else(|| CoreError::NotOpen(path.to_path_buf()))?;
        self.runtime.manager(manager)
    }

    /// Closes the store at `path` and forgets it.
    pub fn close_store(&mut self, path: impl AsRef<Path>) -> CoreResult<()> {
        let key = collection_key(path.as_ref());
        let path = key.as_path();
        let Some(Some(entry)) = self.known.remove(path) else {
            return Err(CoreError::NotOpen(path.to_path_buf()));
        };
        close_entry(&mut self.runtime, entry)
    }

    /// Releases every open store, keeping the paths for `enter_foreground`.
    ///
    /// Returns the number of stores closed.
    pub fn enter_background(&mut self) -> CoreResult<usize> {
        let mut closed = 0;
        let mut first_error = None;
        for slot in self.known.values_mut() {
            if let Some(entry) = slot.take() {
                closed += 1;
                if let Err(err) = close_entry(&mut self.runtime, entry) {
                    first_error.get_or_insert(err);
                }
            }
        }
        self.phase = LifecyclePhase::Background;
        info!(
            "event=session_background module=session status=ok closed={}",
            closed
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(closed),
        }
    }

    /// Reopens every store released by `enter_background`.
    ///
    /// Returns the number of stores reopened.
    pub fn enter_foreground(&mut self) -> CoreResult<usize> {
        let mut reopened = 0;
        for (path, slot) in self.known.iter_mut() {
            if slot.is_some() {
                continue;
            }
            let store = self.runtime.open_store(path)?;
            *slot = Some(OpenStore {
                store,
                manager: None,
            });
            reopened += 1;
        }
        self.phase = LifecyclePhase::Foreground;
        info!(
            "event=session_foreground module=session status=ok reopened={}",
            reopened
        );
        Ok(reopened)
    }

    /// Closes everything and forgets every path.
    pub fn shutdown(&mut self) -> CoreResult<()> {
        let result = self.enter_background().map(|_| ());
        self.known.clear();
        result
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    pub fn stats(&self) -> RuntimeStats {
        self.runtime.stats()
    }

    fn open_entry(&self, path: &Path) -> CoreResult<&OpenStore> {
        self.known
            .get(path)
            .and_then(Option::as_ref)
            .ok_or_else(|| CoreError::NotOpen(path.to_path_buf()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn close_entry(runtime: &mut Runtime, entry: OpenStore) -> CoreResult<()> {
    if let Some(manager) = entry.manager {
        runtime.close_list_manager(manager)?;
    }
    runtime.close_store(entry.store)
}
