//! Native runtime owning every handle table.
//!
//! # Responsibility
//! - Issue and release store, collection manager and item draft handles.
//! - Route manager operations to the owning store's repository and fire the
//!   collection's change channel after each committed mutation.
//!
//! # Invariants
//! - A manager never outlives its store: closing a store releases any
//!   manager still attached to it.
//! - Every store opened on the same database file shares one change channel,
//!   so a mutation through any handle reaches the collection's listener.
//! - Validation runs before any SQL.

use crate::batch::{IdentifierSet, ItemSet};
use crate::error::{CoreError, CoreResult};
use crate::handle::{
    handle_from_raw, Handle, HandleStats, HandleTable, ItemKind, ManagerKind, NativeResource,
    StoreKind,
};
use crate::model::item::{Item, ItemDraft, ItemId, ItemPatch};
use crate::notify::{ChangeChannel, ChangeListener, ChannelStats, DeliveryOutcome, SubscriptionId};
use crate::repo::item_repo::ItemRepository;
use crate::store::Store;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Native state behind a collection manager handle.
pub struct ManagerSlot {
    store: u64,
    owner: u64,
    channel: Arc<ChangeChannel>,
}

impl NativeResource for ManagerSlot {
    type Kind = ManagerKind;

    fn release(self) {
        self.channel.release_owner(self.owner);
        debug!(
            "event=manager_close module=runtime status=ok collection={} owner={}",
            self.channel.collection(),
            self.owner
        );
    }
}

impl NativeResource for ItemDraft {
    type Kind = ItemKind;

    fn release(self) {}
}

/// Allocation ledger across all handle tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub stores: HandleStats,
    pub managers: HandleStats,
    pub items: HandleStats,
    /// Managers released because their store closed underneath them.
    pub cascaded_managers: usize,
}

impl RuntimeStats {
    pub fn is_balanced(&self) -> bool {
        self.stores.is_balanced() && self.managers.is_balanced() && self.items.is_balanced()
    }
}

#[derive(Default)]
pub struct Runtime {
    stores: HandleTable<Store>,
    managers: HandleTable<ManagerSlot>,
    items: HandleTable<ItemDraft>,
    channels: HashMap<PathBuf, Weak<ChangeChannel>>,
    next_owner: u64,
    cascaded_managers: usize,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the store at `path` and returns the owning handle.
    ///
    /// Opening the same file twice yields two handles on one collection.
    ///
    /// # Errors
    /// - `CoreError::NativeConstruction` when the file cannot be opened or
    ///   migrated.
    pub fn open_store(&mut self, path: impl AsRef<Path>) -> CoreResult<Handle<StoreKind>> {
        let path = path.as_ref();
        let channel = self.channel_for(path);
        let store = Store::open_with_channel(path, channel)?;
        Ok(self.stores.acquire(store))
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory_store(&mut self) -> CoreResult<Handle<StoreKind>> {
        let store = Store::open_in_memory()?;
        Ok(self.stores.acquire(store))
    }

    /// Closes a store, releasing any manager still attached to it first.
    pub fn close_store(&mut self, handle: Handle<StoreKind>) -> CoreResult<()> {
        let raw = handle.raw();
        let store = self.stores.take(handle)?;

        let orphans = self.managers.take_where(|slot| slot.store == raw);
        if !orphans.is_empty() {
            self.cascaded_managers += orphans.len();
            warn!(
                "event=store_close module=runtime status=cascade path={} managers={}",
                store.path().display(),
                orphans.len()
            );
        }
        orphans.into_iter().for_each(NativeResource::release);

        store.release();
        Ok(())
    }

    pub fn store_path(&self, handle: &Handle<StoreKind>) -> CoreResult<&Path> {
        Ok(self.stores.get(handle)?.path())
    }

    /// Derives a collection manager from an open store.
    pub fn list_manager(&mut self, store: &Handle<StoreKind>) -> CoreResult<Handle<ManagerKind>> {
        let channel = Arc::clone(self.stores.get(store)?.channel());
        self.next_owner += 1;
        let slot = ManagerSlot {
            store: store.raw(),
            owner: self.next_owner,
            channel,
        };
        debug!(
            "event=manager_open module=runtime status=ok collection={} owner={}",
            slot.channel.collection(),
            slot.owner
        );
        Ok(self.managers.acquire(slot))
    }

    /// Closes a manager, dropping the listener registration it owns.
    pub fn close_list_manager(&mut self, handle: Handle<ManagerKind>) -> CoreResult<()> {
        self.managers.release(handle)?;
        Ok(())
    }

    /// Borrows the operations of a live manager.
    pub fn manager(&self, handle: &Handle<ManagerKind>) -> CoreResult<ListManager<'_>> {
        let slot = self.managers.get(handle)?;
        let store = self.stores.get(&handle_from_raw::<StoreKind>(slot.store)?)?;
        Ok(ListManager {
            owner: slot.owner,
            store,
            channel: &slot.channel,
            drafts: &self.items,
        })
    }

    /// Allocates an empty item draft.
    pub fn item_new(&mut self) -> Handle<ItemKind> {
        self.items.acquire(ItemDraft::default())
    }

    pub fn item(&self, handle: &Handle<ItemKind>) -> CoreResult<&ItemDraft> {
        Ok(self.items.get(handle)?)
    }

    pub fn item_mut(&mut self, handle: &Handle<ItemKind>) -> CoreResult<&mut ItemDraft> {
        Ok(self.items.get_mut(handle)?)
    }

    pub fn item_release(&mut self, handle: Handle<ItemKind>) -> CoreResult<()> {
        self.items.release(handle)?;
        Ok(())
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            stores: self.stores.stats(),
            managers: self.managers.stats(),
            items: self.items.stats(),
            cascaded_managers: self.cascaded_managers,
        }
    }

    /// Releases everything still live: managers, then stores, then drafts.
    pub fn shutdown(&mut self) {
        let managers = self.managers.release_all();
        let stores = self.stores.release_all();
        let items = self.items.release_all();
        if managers + stores + items > 0 {
            info!(
                "event=runtime_shutdown module=runtime status=ok managers={} stores={} items={}",
                managers, stores, items
            );
        }
        self.channels.clear();
    }

    fn channel_for(&mut self, path: &Path) -> Arc<ChangeChannel> {
        self.channels.retain(|_, channel| channel.strong_count() > 0);

        let key = collection_key(path);
        if let Some(channel) = self.channels.get(&key).and_then(Weak::upgrade) {
            return channel;
        }
        let channel = Arc::new(ChangeChannel::new(key.display().to_string()));
        self.channels.insert(key, Arc::downgrade(&channel));
        channel
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves `path` to a stable key even before the file exists.
///
/// Every spelling of one database file maps to the same key.
pub(crate) fn collection_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Borrowed view of one collection manager.
pub struct ListManager<'a> {
    owner: u64,
    store: &'a Store,
    channel: &'a Arc<ChangeChannel>,
    drafts: &'a HandleTable<ItemDraft>,
}

impl ListManager<'_> {
    /// Builds and persists an item in one call.
    ///
    /// # Errors
    /// - `CoreError::Validation` when the normalized name is empty.
    pub fn create_item(&self, name: &str, due_date: Option<i64>) -> CoreResult<Item> {
        let mut draft = ItemDraft::new(name);
        draft.set_due_date(due_date);
        self.persist(&draft)
    }

    /// Persists a draft; the draft handle stays with the caller.
    pub fn save_item(&self, draft: &Handle<ItemKind>) -> CoreResult<Item> {
        let draft = self.drafts.get(draft)?;
        self.persist(draft)
    }

    /// Active items in insertion order.
    pub fn all_items(&self) -> CoreResult<ItemSet> {
        Ok(ItemSet::new(self.store.repo()?.list_items()?))
    }

    pub fn all_identifiers(&self) -> CoreResult<IdentifierSet> {
        Ok(IdentifierSet::new(self.store.repo()?.list_identifiers()?))
    }

    pub fn fetch_item(&self, id: ItemId) -> CoreResult<Option<Item>> {
        Ok(self.store.repo()?.get_item(id)?)
    }

    /// Applies `patch` to a stored item and returns the new snapshot.
    ///
    /// An empty patch returns the stored item without writing or notifying.
    pub fn update_item(&self, id: ItemId, patch: &ItemPatch) -> CoreResult<Item> {
        let repo = self.store.repo()?;
        let current = repo.get_item(id)?.ok_or(CoreError::NotFound(id))?;
        if patch.is_empty() {
            return Ok(current);
        }

        let updated = patch.apply(&current)?;
        repo.update_item(&updated)?;
        info!(
            "event=item_update module=runtime status=ok id={} collection={}",
            id,
            self.channel.collection()
        );
        self.notify();
        Ok(updated)
    }

    pub fn complete_item(&self, id: ItemId, completion_date: i64) -> CoreResult<Item> {
        self.update_item(
            id,
            &ItemPatch {
                completion_date: Some(Some(completion_date)),
                ..ItemPatch::default()
            },
        )
    }

    /// Tombstones an item; later queries no longer return it.
    pub fn delete_item(&self, id: ItemId) -> CoreResult<()> {
        self.store.repo()?.soft_delete_item(id)?;
        info!(
            "event=item_delete module=runtime status=ok id={} collection={}",
            id,
            self.channel.collection()
        );
        self.notify();
        Ok(())
    }

    /// Makes `listener` the collection's only listener.
    ///
    /// Only a weak reference is kept; the caller decides how long the
    /// listener lives.
    pub fn register_change_listener<L>(&self, listener: &Arc<L>) -> SubscriptionId
    where
        L: ChangeListener + 'static,
    {
        self.channel.register(self.owner, listener)
    }

    pub fn unregister_change_listener(&self) -> Option<SubscriptionId> {
        self.channel.unregister()
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.channel.subscription()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    fn persist(&self, draft: &ItemDraft) -> CoreResult<Item> {
        let item = draft.build()?;
        self.store.repo()?.create_item(&item)?;
        info!(
            "event=item_create module=runtime status=ok id={} collection={}",
            item.id,
            self.channel.collection()
        );
        self.notify();
        Ok(item)
    }

    fn notify(&self) -> DeliveryOutcome {
        self.channel.fire(|| match self.all_items() {
            Ok(items) => Some(items),
            Err(err) => {
                warn!(
                    "event=listener_fire module=runtime status=error collection={} error={}",
                    self.channel.collection(),
                    err
                );
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Runtime;
    use crate::error::CoreError;
    use crate::handle::HandleError;
    use crate::model::item::{ItemPatch, ItemValidationError};
    use uuid::Uuid;

    #[test]
    fn in_memory_store_round_trip_balances_ledger() {
        let mut runtime = Runtime::new();
        let store = runtime.open_in_memory_store().unwrap();
        let manager = runtime.list_manager(&store).unwrap();

        let created = runtime
            .manager(&manager)
            .unwrap()
            .create_item("  Buy   milk ", None)
            .unwrap();
        assert_eq!(created.name, "Buy milk");

        let items = runtime.manager(&manager).unwrap().all_items().unwrap();
        assert_eq!(items.count(), 1);
        assert_eq!(items.get(0), Some(&created));
        items.release();

        runtime.close_list_manager(manager).unwrap();
        runtime.close_store(store).unwrap();
        assert!(runtime.stats().is_balanced());
        assert_eq!(runtime.stats().cascaded_managers, 0);
    }

    #[test]
    fn blank_name_is_rejected_before_storage() {
        let mut runtime = Runtime::new();
        let store = runtime.open_in_memory_store().unwrap();
        let manager = runtime.list_manager(&store).unwrap();
        let view = runtime.manager(&manager).unwrap();

        assert!(matches!(
            view.create_item(" \t ", Some(5)),
            Err(CoreError::Validation(ItemValidationError::EmptyName))
        ));
        assert!(view.all_identifiers().unwrap().is_empty());
    }

    #[test]
    fn closing_store_cascades_to_attached_managers() {
        let mut runtime = Runtime::new();
        let store = runtime.open_in_memory_store().unwrap();
        let manager = runtime.list_manager(&store).unwrap();
        let stale = manager.raw();

        runtime.close_store(store).unwrap();

        assert!(runtime.stats().is_balanced());
        assert_eq!(runtime.stats().cascaded_managers, 1);
        let manager = crate::handle::handle_from_raw(stale).unwrap();
        assert!(matches!(
            runtime.manager(&manager),
            Err(CoreError::UseAfterRelease(HandleError::Released { .. }))
        ));
    }

    #[test]
    fn drafts_are_saved_through_setters() {
        let mut runtime = Runtime::new();
        let store = runtime.open_in_memory_store().unwrap();
        let manager = runtime.list_manager(&store).unwrap();
        let draft = runtime.item_new();
        runtime
            .item_mut(&draft)
            .unwrap()
            .set_name("Call mom")
            .set_due_date(Some(1_700_000_000_000));

        let saved = runtime.manager(&manager).unwrap().save_item(&draft).unwrap();
        assert_eq!(saved.name, "Call mom");
        assert_eq!(saved.due_date, Some(1_700_000_000_000));
        assert_eq!(runtime.item(&draft).unwrap().name(), "Call mom");

        runtime.item_release(draft).unwrap();
        runtime.close_list_manager(manager).unwrap();
        runtime.close_store(store).unwrap();
        assert!(runtime.stats().is_balanced());
    }

    #[test]
    fn update_complete_and_delete_follow_item_lifecycle() {
        let mut runtime = Runtime::new();
        let store = runtime.open_in_memory_store().unwrap();
        let manager = runtime.list_manager(&store).unwrap();
        let view = runtime.manager(&manager).unwrap();

        let item = view.create_item("Water plants", Some(10)).unwrap();
        let renamed = view
            .update_item(
                item.id,
                &ItemPatch {
                    name: Some("Water the plants".to_string()),
                    due_date: Some(None),
                    ..ItemPatch::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "Water the plants");
        assert_eq!(renamed.due_date, None);

        let done = view.complete_item(item.id, 42).unwrap();
        assert!(done.is_complete());
        assert_eq!(view.fetch_item(item.id).unwrap(), Some(done));

        view.delete_item(item.id).unwrap();
        assert_eq!(view.fetch_item(item.id).unwrap(), None);
        assert!(matches!(
            view.delete_item(item.id),
            Err(CoreError::NotFound(id)) if id == item.id
        ));
        assert!(matches!(
            view.complete_item(Uuid::new_v4(), 1),
            Err(CoreError::NotFound(_))
        ));
    }
}
