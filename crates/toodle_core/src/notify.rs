//! Collection-changed notification channel.
//!
//! # Responsibility
//! - Hold the single listener registration for one collection.
//! - Deliver a fresh item batch to that listener after every committed
//!   mutation, or record that the listener is gone.
//!
//! # Invariants
//! - At most one registration exists; registering again replaces it.
//! - The registration holds the listener weakly and never extends its life.
//! - A listener that cannot be resolved is logged and skipped, never an error.
//! - The listener is invoked without the registration lock held, so it may
//!   register or unregister from inside the callback.
//!
//! State machine: `Unregistered -> Registered -> Firing -> Registered`, and
//! back to `Unregistered` on explicit unregister or owner close.

use crate::batch::ItemSet;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Receiver of collection-changed events.
///
/// Called synchronously on the thread that committed the mutation. The
/// listener owns the delivered batch and must hop to its own execution
/// context before touching thread-affine state.
pub trait ChangeListener: Send + Sync {
    /// `None` means the collection could not be read for this delivery.
    fn on_items_changed(&self, items: Option<ItemSet>);
}

/// Identity of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unregistered,
    Registered,
    Firing,
}

/// Result of one fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing is registered.
    NoListener,
    /// The listener's owner is gone; the event was dropped.
    ListenerUnresolved,
    /// The listener ran; `count` is `None` when the batch was absent.
    Delivered { count: Option<usize> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub fired: u64,
    pub delivered: u64,
    pub unresolved: u64,
    pub no_listener: u64,
}

struct Registration {
    id: SubscriptionId,
    owner: u64,
    target: Weak<dyn ChangeListener>,
}

#[derive(Default)]
struct ChannelSlot {
    registration: Option<Registration>,
    firing: bool,
    stats: ChannelStats,
}

/// One-listener-at-a-time pub/sub path for a single collection.
pub struct ChangeChannel {
    collection: String,
    next_id: AtomicU64,
    slot: Mutex<ChannelSlot>,
}

impl ChangeChannel {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            next_id: AtomicU64::new(1),
            slot: Mutex::new(ChannelSlot::default()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Registers `listener` on behalf of `owner`, replacing any previous one.
    ///
    /// `owner` is the raw value of the registering manager handle; closing
    /// that manager removes the registration only if it still owns it.
    pub fn register<L>(&self, owner: u64, listener: &Arc<L>) -> SubscriptionId
    where
        L: ChangeListener + 'static,
    {
        let strong: Arc<dyn ChangeListener> = listener.clone();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let previous = self.lock().registration.replace(Registration {
            id,
            owner,
            target: Arc::downgrade(&strong),
        });

        match previous {
            Some(previous) => info!(
                "event=listener_register module=notify status=ok collection={} subscription={} replaced={}",
                self.collection, id.0, previous.id.0
            ),
            None => info!(
                "event=listener_register module=notify status=ok collection={} subscription={}",
                self.collection, id.0
            ),
        }
        id
    }

    /// Drops the current registration, whoever owns it.
    pub fn unregister(&self) -> Option<SubscriptionId> {
        let removed = self.lock().registration.take().map(|registration| registration.id);
        if let Some(id) = removed {
            info!(
                "event=listener_unregister module=notify status=ok collection={} subscription={}",
                self.collection, id.0
            );
        }
        removed
    }

    /// Drops the registration only when `owner` made it.
    pub fn release_owner(&self, owner: u64) -> Option<SubscriptionId> {
        let mut slot = self.lock();
        let owned = slot
            .registration
            .as_ref()
            .is_some_and(|registration| registration.owner == owner);
        if !owned {
            return None;
        }
        let id = slot.registration.take().map(|registration| registration.id);
        drop(slot);

        if let Some(id) = id {
            info!(
                "event=listener_unregister module=notify status=ok collection={} subscription={} reason=owner_closed",
                self.collection, id.0
            );
        }
        id
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.lock()
            .registration
            .as_ref()
            .map(|registration| registration.id)
    }

    pub fn state(&self) -> ChannelState {
        let slot = self.lock();
        match (&slot.registration, slot.firing) {
            (_, true) => ChannelState::Firing,
            (Some(_), false) => ChannelState::Registered,
            (None, false) => ChannelState::Unregistered,
        }
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock().stats
    }

    /// Delivers one change event to the registered listener.
    ///
    /// `load` is only called once the listener has been resolved, so no
    /// batch is built for an absent or collected listener.
    pub fn fire(&self, load: impl FnOnce() -> Option<ItemSet>) -> DeliveryOutcome {
        let target = {
            let mut slot = self.lock();
            slot.stats.fired += 1;
            let target = slot
                .registration
                .as_ref()
                .map(|registration| (registration.id, registration.target.clone()));
            if target.is_none() {
                slot.stats.no_listener += 1;
            }
            target
        };

        let Some((id, weak)) = target else {
            debug!(
                "event=listener_fire module=notify status=skipped collection={} reason=no_listener",
                self.collection
            );
            return DeliveryOutcome::NoListener;
        };
        let Some(listener) = weak.upgrade() else {
            self.lock().stats.unresolved += 1;
            warn!(
                "event=listener_unresolved module=notify status=dropped collection={} subscription={}",
                self.collection, id.0
            );
            return DeliveryOutcome::ListenerUnresolved;
        };

        let items = load();
        let count = items.as_ref().map(ItemSet::count);
        let firing = FiringGuard::enter(self);
        listener.on_items_changed(items);
        drop(firing);
        self.lock().stats.delivered += 1;

        debug!(
            "event=listener_fire module=notify status=ok collection={} subscription={} count={}",
            self.collection,
            id.0,
            count.map_or_else(|| "absent".to_string(), |count| count.to_string())
        );
        DeliveryOutcome::Delivered { count }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelSlot> {
        // Listeners never run under this lock and no critical section can
        // panic, so a poisoned slot still holds consistent data.
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks the channel as firing until dropped, including on unwind.
struct FiringGuard<'a> {
    channel: &'a ChangeChannel,
}

impl<'a> FiringGuard<'a> {
    fn enter(channel: &'a ChangeChannel) -> Self {
        channel.lock().firing = true;
        Self { channel }
    }
}

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.channel.lock().firing = false;
    }
}

/// One queued change event.
#[derive(Debug)]
pub struct ItemsChanged {
    pub items: Option<ItemSet>,
}

/// Listener that forwards deliveries into an `mpsc` queue.
///
/// The consumer drains the receiver on its own thread, so delivery never
/// depends on which thread committed the mutation.
pub struct QueuedListener {
    sender: Sender<ItemsChanged>,
}

impl QueuedListener {
    pub fn channel() -> (Arc<Self>, Receiver<ItemsChanged>) {
        let (sender, receiver) = mpsc::channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl ChangeListener for QueuedListener {
    fn on_items_changed(&self, items: Option<ItemSet>) {
        if self.sender.send(ItemsChanged { items }).is_err() {
            debug!("event=listener_queue module=notify status=dropped reason=receiver_closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeChannel, ChangeListener, ChannelState, DeliveryOutcome, QueuedListener};
    use crate::batch::ItemSet;
    use crate::model::item::ItemDraft;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl ChangeListener for Counting {
        fn on_items_changed(&self, items: Option<ItemSet>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(items) = items {
                items.release();
            }
        }
    }

    fn one_item() -> Option<ItemSet> {
        Some(ItemSet::new(vec![ItemDraft::new("milk").build().unwrap()]))
    }

    #[test]
    fn fire_without_listener_is_a_no_op() {
        let channel = ChangeChannel::new("test");
        assert_eq!(channel.state(), ChannelState::Unregistered);
        assert_eq!(channel.fire(one_item), DeliveryOutcome::NoListener);
        assert_eq!(channel.stats().no_listener, 1);
    }

    #[test]
    fn registered_listener_receives_batch() {
        let channel = ChangeChannel::new("test");
        let listener = Arc::new(Counting::default());
        channel.register(7, &listener);
        assert_eq!(channel.state(), ChannelState::Registered);

        assert_eq!(
            channel.fire(one_item),
            DeliveryOutcome::Delivered { count: Some(1) }
        );
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Registered);
    }

    #[test]
    fn dropped_listener_is_unresolved_and_load_is_skipped() {
        let channel = ChangeChannel::new("test");
        let listener = Arc::new(Counting::default());
        channel.register(7, &listener);
        drop(listener);

        let outcome = channel.fire(|| panic!("batch must not be built for a dead listener"));
        assert_eq!(outcome, DeliveryOutcome::ListenerUnresolved);
        assert_eq!(channel.stats().unresolved, 1);
        assert_eq!(channel.stats().delivered, 0);
    }

    #[test]
    fn release_owner_ignores_foreign_owner() {
        let channel = ChangeChannel::new("test");
        let listener = Arc::new(Counting::default());
        let id = channel.register(7, &listener);

        assert_eq!(channel.release_owner(8), None);
        assert_eq!(channel.subscription(), Some(id));
        assert_eq!(channel.release_owner(7), Some(id));
        assert_eq!(channel.state(), ChannelState::Unregistered);
    }

    #[test]
    fn queued_listener_hands_batches_to_another_thread() {
        let channel = ChangeChannel::new("test");
        let (listener, receiver) = QueuedListener::channel();
        channel.register(1, &listener);

        let consumer = std::thread::spawn(move || {
            let event = receiver.recv().unwrap();
            event.items.map(ItemSet::release)
        });

        channel.fire(one_item);
        assert_eq!(consumer.join().unwrap(), Some(1));
    }

    struct Panicking;

    impl ChangeListener for Panicking {
        fn on_items_changed(&self, _items: Option<ItemSet>) {
            panic!("listener failed");
        }
    }

    #[test]
    fn panicking_listener_does_not_leave_channel_firing() {
        let channel = ChangeChannel::new("test");
        let listener = Arc::new(Panicking);
        channel.register(3, &listener);

        let fired = std::panic::catch_unwind(AssertUnwindSafe(|| channel.fire(one_item)));

        assert!(fired.is_err());
        assert_eq!(channel.state(), ChannelState::Registered);
        assert_eq!(channel.stats().delivered, 0);
    }
}
