//! Typed opaque handles over a generational arena.
//!
//! # Responsibility
//! - Name native objects (store, collection manager, item draft) by value.
//! - Own the acquire/release bookkeeping for each resource kind.
//!
//! # Invariants
//! - A `Handle` is neither `Clone` nor `Copy`; release consumes it.
//! - Raw values are never `0`, and encode kind tag, generation and slot.
//! - A released slot bumps its generation, so stale raw values are rejected
//!   instead of resolving to whatever reuses the slot. A slot whose
//!   generation is exhausted is retired and never handed out again.
//! - `allocations - releases == live` for every table.
//!
//! Raw layout (most significant first): 8-bit kind tag, 24-bit generation,
//! 32-bit slot index plus one.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::NonZeroU64;

const SLOT_BITS: u32 = 32;
const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Marker for a family of native objects addressable by handle.
pub trait HandleKind: 'static {
    /// Distinct non-zero tag written into every raw value of this kind.
    const TAG: u8;
    const NAME: &'static str;
}

/// Root resource owning the store connection.
#[derive(Debug)]
pub enum StoreKind {}

/// Child of a store exposing item operations and the change subscription.
#[derive(Debug)]
pub enum ManagerKind {}

/// Transient item draft built with setters before it is saved.
#[derive(Debug)]
pub enum ItemKind {}

impl HandleKind for StoreKind {
    const TAG: u8 = 1;
    const NAME: &'static str = "store";
}

impl HandleKind for ManagerKind {
    const TAG: u8 = 2;
    const NAME: &'static str = "collection_manager";
}

impl HandleKind for ItemKind {
    const TAG: u8 = 3;
    const NAME: &'static str = "item";
}

/// Owning reference to one native object of kind `K`.
///
/// The only legal operations are passing it to the runtime, comparing it and
/// converting it to a raw value for a foreign caller.
#[must_use = "a handle must be released through the runtime that issued it"]
pub struct Handle<K: HandleKind> {
    raw: NonZeroU64,
    _kind: PhantomData<fn() -> K>,
}

impl<K: HandleKind> Handle<K> {
    fn new(slot: u32, generation: u32) -> Self {
        let raw = (u64::from(K::TAG) << (SLOT_BITS + GENERATION_BITS))
            | (u64::from(generation & GENERATION_MASK) << SLOT_BITS)
            | (u64::from(slot) + 1);
        Self {
            raw: NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN),
            _kind: PhantomData,
        }
    }

    /// Rebuilds a handle from a raw value handed out by `into_raw`/`raw`.
    ///
    /// Intended for boundary code only. The returned value is checked by the
    /// issuing table on every use; stale or foreign values surface as
    /// `HandleError` rather than resolving to another object.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let raw = NonZeroU64::new(raw)?;
        if (raw.get() >> (SLOT_BITS + GENERATION_BITS)) as u8 != K::TAG {
            return None;
        }
        Some(Self {
            raw,
            _kind: PhantomData,
        })
    }

    /// Transfers ownership to a foreign caller as an integer.
    pub fn into_raw(self) -> u64 {
        self.raw.get()
    }

    /// Returns the raw value without giving up ownership.
    pub fn raw(&self) -> u64 {
        self.raw.get()
    }

    fn slot(&self) -> usize {
        ((self.raw.get() & SLOT_MASK) - 1) as usize
    }

    fn generation(&self) -> u32 {
        ((self.raw.get() >> SLOT_BITS) as u32) & GENERATION_MASK
    }
}

impl<K: HandleKind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: HandleKind> Eq for Handle<K> {}

impl<K: HandleKind> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: HandleKind> Debug for Handle<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle<{}>({:#x})", K::NAME, self.raw)
    }
}

/// Lookup failures for raw handle values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// Raw value is zero or carries another kind's tag.
    Invalid { kind: &'static str, raw: u64 },
    /// Raw value names a slot that was released (or never issued).
    Released { kind: &'static str, raw: u64 },
}

impl Display for HandleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { kind, raw } => write!(f, "invalid {kind} handle {raw:#x}"),
            Self::Released { kind, raw } => {
                write!(f, "{kind} handle {raw:#x} used after release")
            }
        }
    }
}

impl Error for HandleError {}

/// Capability implemented per resource kind: how its native state is torn
/// down when the owning handle is released.
pub trait NativeResource {
    type Kind: HandleKind;

    /// Called exactly once, when the handle naming this value is released.
    fn release(self);
}

/// Allocation ledger for one handle table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub allocations: u64,
    pub releases: u64,
    pub live: usize,
    /// Slots retired after exhausting their generation counter.
    pub retired: usize,
}

impl HandleStats {
    /// True when every acquired handle has been released.
    pub fn is_balanced(&self) -> bool {
        self.allocations == self.releases && self.live == 0
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational arena owning every live object of one resource kind.
pub struct HandleTable<T: NativeResource> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    stats: HandleStats,
}

impl<T: NativeResource> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            stats: HandleStats::default(),
        }
    }
}

impl<T: NativeResource> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `value` and returns the handle naming it.
    pub fn acquire(&mut self, value: T) -> Handle<T::Kind> {
        self.stats.allocations += 1;
        self.stats.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    pub fn get(&self, handle: &Handle<T::Kind>) -> Result<&T, HandleError> {
        self.slots
            .get(handle.slot())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| released::<T::Kind>(handle.raw()))
    }

    pub fn get_mut(&mut self, handle: &Handle<T::Kind>) -> Result<&mut T, HandleError> {
        self.slots
            .get_mut(handle.slot())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or_else(|| released::<T::Kind>(handle.raw()))
    }

    pub fn contains(&self, handle: &Handle<T::Kind>) -> bool {
        self.get(handle).is_ok()
    }

    /// Removes the value without running its release hook.
    pub fn take(&mut self, handle: Handle<T::Kind>) -> Result<T, HandleError> {
        let index = handle.slot();
        let slot = self
            .slots
            .get_mut(index)
            .filter(|slot| slot.generation == handle.generation() && slot.value.is_some())
            .ok_or_else(|| released::<T::Kind>(handle.raw()))?;

        let value = slot.value.take().ok_or_else(|| released::<T::Kind>(handle.raw()))?;
        if slot.generation < GENERATION_MASK {
            slot.generation += 1;
            self.free.push(index as u32);
        } else {
            self.stats.retired += 1;
        }
        self.stats.releases += 1;
        self.stats.live -= 1;
        Ok(value)
    }

    /// Releases the object named by `handle`, consuming the handle.
    pub fn release(&mut self, handle: Handle<T::Kind>) -> Result<(), HandleError> {
        self.take(handle)?.release();
        Ok(())
    }

    /// Removes every value matching `predicate`, in slot order.
    pub fn take_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let matching = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.as_ref().is_some_and(&mut predicate))
            .map(|(index, slot)| Handle::<T::Kind>::new(index as u32, slot.generation))
            .collect::<Vec<_>>();

        matching
            .into_iter()
            .filter_map(|handle| self.take(handle).ok())
            .collect()
    }

    /// Releases every live value, in slot order.
    pub fn release_all(&mut self) -> usize {
        let values = self.take_where(|_| true);
        let count = values.len();
        values.into_iter().for_each(NativeResource::release);
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    pub fn len(&self) -> usize {
        self.stats.live
    }

    pub fn is_empty(&self) -> bool {
        self.stats.live == 0
    }

    pub fn stats(&self) -> HandleStats {
        self.stats
    }
}

fn released<K: HandleKind>(raw: u64) -> HandleError {
    HandleError::Released { kind: K::NAME, raw }
}

/// Resolves a raw foreign value into a handle of kind `K`.
pub fn handle_from_raw<K: HandleKind>(raw: u64) -> Result<Handle<K>, HandleError> {
    Handle::from_raw(raw).ok_or(HandleError::Invalid { kind: K::NAME, raw })
}

#[cfg(test)]
mod tests {
    use super::{
        handle_from_raw, Handle, HandleError, HandleKind, HandleTable, ItemKind, NativeResource,
        StoreKind, GENERATION_MASK,
    };
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug)]
    enum ProbeKind {}

    impl HandleKind for ProbeKind {
        const TAG: u8 = 200;
        const NAME: &'static str = "probe";
    }

    struct Probe {
        released: Rc<Cell<u32>>,
    }

    impl NativeResource for Probe {
        type Kind = ProbeKind;

        fn release(self) {
            self.released.set(self.released.get() + 1);
        }
    }

    fn probe(counter: &Rc<Cell<u32>>) -> Probe {
        Probe {
            released: Rc::clone(counter),
        }
    }

    #[test]
    fn acquire_then_release_balances_ledger() {
        let counter = Rc::new(Cell::new(0));
        let mut table = HandleTable::new();

        let handle = table.acquire(probe(&counter));
        assert_eq!(table.len(), 1);
        table.release(handle).unwrap();

        assert_eq!(counter.get(), 1);
        assert!(table.stats().is_balanced());
    }

    #[test]
    fn stale_raw_value_is_rejected_after_slot_reuse() {
        let counter = Rc::new(Cell::new(0));
        let mut table = HandleTable::new();

        let first = table.acquire(probe(&counter));
        let stale_raw = first.raw();
        table.release(first).unwrap();
        let second = table.acquire(probe(&counter));

        assert_ne!(second.raw(), stale_raw);
        let stale = handle_from_raw::<ProbeKind>(stale_raw).unwrap();
        assert!(matches!(
            table.get(&stale),
            Err(HandleError::Released { kind: "probe", .. })
        ));
        assert!(matches!(table.release(stale), Err(HandleError::Released { .. })));
        assert_eq!(counter.get(), 1);
        assert!(table.contains(&second));
    }

    #[test]
    fn raw_value_of_another_kind_is_invalid() {
        let counter = Rc::new(Cell::new(0));
        let mut table = HandleTable::new();
        let handle = table.acquire(probe(&counter));

        assert!(Handle::<StoreKind>::from_raw(handle.raw()).is_none());
        assert!(matches!(
            handle_from_raw::<ItemKind>(handle.raw()),
            Err(HandleError::Invalid { kind: "item", .. })
        ));
        assert!(handle_from_raw::<ProbeKind>(0).is_err());
        table.release(handle).unwrap();
    }

    #[test]
    fn release_all_runs_every_hook_once() {
        let counter = Rc::new(Cell::new(0));
        let mut table = HandleTable::new();
        for _ in 0..4 {
            let _ = table.acquire(probe(&counter)).into_raw();
        }

        assert_eq!(table.release_all(), 4);
        assert_eq!(counter.get(), 4);
        assert!(table.stats().is_balanced());
        assert_eq!(table.release_all(), 0);
    }

    #[test]
    fn slot_with_exhausted_generation_is_retired() {
        let counter = Rc::new(Cell::new(0));
        let mut table = HandleTable::new();
        let _ = table.acquire(probe(&counter)).into_raw();
        table.slots[0].generation = GENERATION_MASK;
        let last = Handle::<ProbeKind>::new(0, GENERATION_MASK);
        let last_raw = last.raw();

        table.release(last).unwrap();
        let next = table.acquire(probe(&counter));

        assert_eq!(next.slot(), 1);
        assert_eq!(table.stats().retired, 1);
        let stale = handle_from_raw::<ProbeKind>(last_raw).unwrap();
        assert!(matches!(table.get(&stale), Err(HandleError::Released { .. })));
        table.release(next).unwrap();
        assert!(table.stats().is_balanced());
    }
}
