//! C layouts for items, identifiers and their sets.
//!
//! # Invariants
//! - Every string and element handed out is counted once on allocation and
//!   once on release; a balanced ledger means nothing leaked or double-freed.
//! - Releasing a set frees each element's strings, then the element array,
//!   then the set header.
//! - Null set pointers mean "absent" and are accepted by release as no-ops.

use std::ffi::{c_char, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use toodle_core::{Identifier, IdentifierSet, Item, ItemSet};

#[repr(C)]
#[derive(Debug)]
pub struct ToodleItem {
    pub uuid: *mut c_char,
    pub name: *mut c_char,
    pub has_due_date: bool,
    pub due_date: i64,
    pub has_completion_date: bool,
    pub completion_date: i64,
}

#[repr(C)]
#[derive(Debug)]
pub struct ToodleItemSet {
    pub items: *mut ToodleItem,
    pub count: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct ToodleIdentifier {
    pub uuid: *mut c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct ToodleIdentifierSet {
    pub identifiers: *mut ToodleIdentifier,
    pub count: usize,
}

struct Counter {
    allocated: AtomicU64,
    released: AtomicU64,
}

impl Counter {
    const fn new() -> Self {
        Self {
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    fn allocate(&self, count: u64) {
        self.allocated.fetch_add(count, Ordering::Relaxed);
    }

    fn release(&self, count: u64) {
        self.released.fetch_add(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.allocated.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
        )
    }
}

static STRINGS: Counter = Counter::new();
static RECORDS: Counter = Counter::new();
static SETS: Counter = Counter::new();

/// Process-wide allocation counts for marshalled memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarshalLedger {
    pub strings_allocated: u64,
    pub strings_released: u64,
    pub records_allocated: u64,
    pub records_released: u64,
    pub sets_allocated: u64,
    pub sets_released: u64,
}

impl MarshalLedger {
    pub fn is_balanced(&self) -> bool {
        self.strings_allocated == self.strings_released
            && self.records_allocated == self.records_released
            && self.sets_allocated == self.sets_released
    }
}

pub fn ledger() -> MarshalLedger {
    let (strings_allocated, strings_released) = STRINGS.snapshot();
    let (records_allocated, records_released) = RECORDS.snapshot();
    let (sets_allocated, sets_released) = SETS.snapshot();
    MarshalLedger {
        strings_allocated,
        strings_released,
        records_allocated,
        records_released,
        sets_allocated,
        sets_released,
    }
}

/// Copies `value` into a C string owned by the caller.
///
/// Interior NUL bytes cannot be represented and are dropped.
pub(crate) fn string_into_raw(value: &str) -> *mut c_char {
    let text = CString::new(value.replace('\0', "")).unwrap_or_default();
    STRINGS.allocate(1);
    text.into_raw()
}

/// # Safety
/// `value` must be null or come from `string_into_raw` and not be released yet.
pub(crate) unsafe fn string_release(value: *mut c_char) {
    if value.is_null() {
        return;
    }
    drop(CString::from_raw(value));
    STRINGS.release(1);
}

impl ToodleItem {
    fn from_item(item: &Item) -> Self {
        Self {
            uuid: string_into_raw(&item.id.to_string()),
            name: string_into_raw(&item.name),
            has_due_date: item.due_date.is_some(),
            due_date: item.due_date.unwrap_or_default(),
            has_completion_date: item.completion_date.is_some(),
            completion_date: item.completion_date.unwrap_or_default(),
        }
    }

    unsafe fn release_strings(&mut self) {
        string_release(std::mem::replace(&mut self.uuid, ptr::null_mut()));
        string_release(std::mem::replace(&mut self.name, ptr::null_mut()));
    }
}

impl ToodleIdentifier {
    fn from_identifier(identifier: &Identifier) -> Self {
        Self {
            uuid: string_into_raw(&identifier.to_string()),
        }
    }
}

/// Moves a batch into C memory; `None` becomes a null pointer.
pub fn item_set_into_raw(items: Option<ItemSet>) -> *mut ToodleItemSet {
    let Some(items) = items else {
        return ptr::null_mut();
    };
    let elements = items
        .iter()
        .map(ToodleItem::from_item)
        .collect::<Box<[_]>>();
    items.release();

    let count = elements.len();
    RECORDS.allocate(count as u64);
    SETS.allocate(1);
    Box::into_raw(Box::new(ToodleItemSet {
        items: Box::into_raw(elements).cast::<ToodleItem>(),
        count,
    }))
}

/// Frees a set produced by `item_set_into_raw`.
///
/// # Safety
/// `set` must be null or an unreleased pointer from `item_set_into_raw`,
/// with `items` and `count` unmodified.
pub unsafe fn item_set_release(set: *mut ToodleItemSet) -> usize {
    if set.is_null() {
        return 0;
    }
    let set = Box::from_raw(set);
    let mut elements = Box::from_raw(ptr::slice_from_raw_parts_mut(set.items, set.count));
    for element in elements.iter_mut() {
        element.release_strings();
    }
    let count = elements.len();
    drop(elements);
    drop(set);

    RECORDS.release(count as u64);
    SETS.release(1);
    count
}

/// Moves identifiers into C memory; `None` becomes a null pointer.
pub fn identifier_set_into_raw(identifiers: Option<IdentifierSet>) -> *mut ToodleIdentifierSet {
    let Some(identifiers) = identifiers else {
        return ptr::null_mut();
    };
    let elements = identifiers
        .iter()
        .map(ToodleIdentifier::from_identifier)
        .collect::<Box<[_]>>();
    identifiers.release();

    let count = elements.len();
    RECORDS.allocate(count as u64);
    SETS.allocate(1);
    Box::into_raw(Box::new(ToodleIdentifierSet {
        identifiers: Box::into_raw(elements).cast::<ToodleIdentifier>(),
        count,
    }))
}

/// # Safety
/// Same contract as [`item_set_release`].
pub unsafe fn identifier_set_release(set: *mut ToodleIdentifierSet) -> usize {
    if set.is_null() {
        return 0;
    }
    let set = Box::from_raw(set);
    let mut elements = Box::from_raw(ptr::slice_from_raw_parts_mut(
        set.identifiers,
        set.count,
    ));
    for element in elements.iter_mut() {
        string_release(std::mem::replace(&mut element.uuid, ptr::null_mut()));
    }
    let count = elements.len();
    drop(elements);
    drop(set);

    RECORDS.release(count as u64);
    SETS.release(1);
    count
}
