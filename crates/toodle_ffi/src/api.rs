//! Exported C functions.
//!
//! # FFI contract
//! - Every function returns a `ToodleStatus` (or a nullable pointer) and
//!   never unwinds into the caller.
//! - Handles are `uint64_t`; `0` is never a valid handle.
//! - Store handles belong to the process-wide session and are shared per
//!   path; manager, item and listener handles belong to the caller.
//! - Calls from different threads take turns on one process-wide lock.
//!   A call made from inside a change callback returns `Busy` instead of
//!   waiting on itself. A callback must not block on another thread that is
//!   calling into the library.
//! - Strings and sets returned by the library are released with the
//!   matching `*_release` function, never with `free`.

use crate::marshal::{
    self, identifier_set_into_raw, item_set_into_raw, ToodleIdentifierSet, ToodleItemSet,
};
use crate::status::{clear_last_error, last_error, set_last_error, BoundaryError, ToodleStatus};
use log::{error, info, warn};
use std::cell::Cell;
use std::ffi::{c_char, c_void, CStr};
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};
use toodle_core::{
    handle_from_raw, ChangeListener, CoreConfig, CoreError, HandleKind, HandleTable, ItemKind,
    ItemPatch, ItemSet, ManagerKind, NativeResource, Session, StoreKind,
};
use uuid::Uuid;

/// Receives ownership of a set (null when the list could not be read) and
/// must pass it to `toodle_item_set_release`.
///
/// Runs synchronously on the thread that committed the change.
pub type ToodleChangeCallback = extern "C" fn(user_data: *mut c_void, items: *mut ToodleItemSet);

/// Liveness token returned by listener registration.
#[derive(Debug)]
pub enum ListenerKind {}

impl HandleKind for ListenerKind {
    const TAG: u8 = 4;
    const NAME: &'static str = "listener";
}

struct UserData(*mut c_void);

// The registering caller guarantees `user_data` may be used from whichever
// thread commits a change.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

struct CallbackListener {
    callback: ToodleChangeCallback,
    user_data: UserData,
}

impl ChangeListener for CallbackListener {
    fn on_items_changed(&self, items: Option<ItemSet>) {
        (self.callback)(self.user_data.0, item_set_into_raw(items));
    }
}

struct ListenerToken {
    listener: Arc<CallbackListener>,
}

impl NativeResource for ListenerToken {
    type Kind = ListenerKind;

    fn release(self) {
        drop(self.listener);
    }
}

struct BoundaryState {
    session: Session,
    listeners: HandleTable<ListenerToken>,
    active: bool,
}

static STATE: Mutex<Option<BoundaryState>> = Mutex::new(None);

thread_local! {
    static HOLDS_STATE: Cell<bool> = const { Cell::new(false) };
}

/// Leaves the field unchanged.
pub const TOODLE_FIELD_KEEP: u32 = 0;
/// Stores the accompanying value.
pub const TOODLE_FIELD_SET: u32 = 1;
/// Clears the field.
pub const TOODLE_FIELD_CLEAR: u32 = 2;

fn run(op: &'static str, body: impl FnOnce() -> Result<(), BoundaryError>) -> ToodleStatus {
    match guarded(op, body) {
        Ok(()) => ToodleStatus::Ok,
        Err(status) => status,
    }
}

fn run_ptr<T>(op: &'static str, body: impl FnOnce() -> Result<*mut T, BoundaryError>) -> *mut T {
    guarded(op, body).unwrap_or(ptr::null_mut())
}

fn guarded<T>(
    op: &'static str,
    body: impl FnOnce() -> Result<T, BoundaryError>,
) -> Result<T, ToodleStatus> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => {
            clear_last_error();
            Ok(value)
        }
        Ok(Err(err)) => {
            warn!(
                "event=ffi_call module=ffi status=error op={} code={:?}",
                op, err.status
            );
            set_last_error(err.message);
            Err(err.status)
        }
        Err(_) => {
            error!("event=ffi_call module=ffi status=panic op={}", op);
            set_last_error(format!("{op} panicked"));
            Err(ToodleStatus::Panic)
        }
    }
}

/// Lock on the boundary state, flagged on the holding thread so a
/// re-entrant call from a callback fails fast instead of deadlocking.
struct StateGuard {
    guard: MutexGuard<'static, Option<BoundaryState>>,
}

impl Deref for StateGuard {
    type Target = Option<BoundaryState>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for StateGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        HOLDS_STATE.with(|held| held.set(false));
    }
}

fn lock_state() -> Result<StateGuard, BoundaryError> {
    if HOLDS_STATE.with(Cell::get) {
        return Err(BoundaryError::busy());
    }
    let guard = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    HOLDS_STATE.with(|held| held.set(true));
    Ok(StateGuard { guard })
}

fn with_state<T>(
    body: impl FnOnce(&mut BoundaryState) -> Result<T, BoundaryError>,
) -> Result<T, BoundaryError> {
    let mut guard = lock_state()?;
    let state = guard
        .as_mut()
        .filter(|state| state.active)
        .ok_or_else(BoundaryError::not_initialized)?;
    body(state)
}

unsafe fn read_str<'a>(value: *const c_char, what: &'static str) -> Result<&'a str, BoundaryError> {
    if value.is_null() {
        return Err(BoundaryError::invalid_argument(format!("{what} is null")));
    }
    CStr::from_ptr(value)
        .to_str()
        .map_err(|_| BoundaryError::invalid_argument(format!("{what} is not valid UTF-8")))
}

unsafe fn read_optional_str<'a>(
    value: *const c_char,
    what: &'static str,
) -> Result<Option<&'a str>, BoundaryError> {
    if value.is_null() {
        return Ok(None);
    }
    read_str(value, what).map(Some)
}

unsafe fn read_uuid(value: *const c_char) -> Result<Uuid, BoundaryError> {
    let text = read_str(value, "uuid")?;
    Uuid::parse_str(text.trim())
        .map_err(|_| BoundaryError::invalid_argument(format!("`{text}` is not a valid uuid")))
}

unsafe fn write_out(out: *mut u64, value: u64) -> Result<(), BoundaryError> {
    if out.is_null() {
        return Err(BoundaryError::invalid_argument("output pointer is null"));
    }
    out.write(value);
    Ok(())
}

fn field_update(
    mode: u32,
    value: i64,
    what: &'static str,
) -> Result<Option<Option<i64>>, BoundaryError> {
    match mode {
        TOODLE_FIELD_KEEP => Ok(None),
        TOODLE_FIELD_SET => Ok(Some(Some(value))),
        TOODLE_FIELD_CLEAR => Ok(Some(None)),
        other => Err(BoundaryError::invalid_argument(format!(
            "{what} mode {other} is not KEEP, SET or CLEAR"
        ))),
    }
}

fn check_out(out: *mut u64) -> Result<(), BoundaryError> {
    if out.is_null() {
        return Err(BoundaryError::invalid_argument("output pointer is null"));
    }
    Ok(())
}

/// Creates the process-wide session and optionally starts file logging.
///
/// `level` and `log_dir` may be null; `TOODLE_LOG_LEVEL` / `TOODLE_LOG_DIR`
/// are used in their place. Calling again while initialized is a no-op.
///
/// # Safety
/// Non-null arguments must be NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn toodle_init(level: *const c_char, log_dir: *const c_char) -> ToodleStatus {
    run("toodle_init", || {
        let mut config = CoreConfig::from_env()
            .map_err(|err| BoundaryError::invalid_argument(err.to_string()))?;
        if let Some(level) = read_optional_str(level, "level")? {
            config.log_level = toodle_core::logging::normalize_level(level)
                .map_err(BoundaryError::invalid_argument)?;
        }
        if let Some(dir) = read_optional_str(log_dir, "log_dir")? {
            config.log_dir = Some(dir.into());
        }
        config
            .init_logging()
            .map_err(BoundaryError::invalid_argument)?;

        let mut guard = lock_state()?;
        let state = guard.get_or_insert_with(|| BoundaryState {
            session: Session::new(),
            listeners: HandleTable::new(),
            active: false,
        });
        if !state.active {
            state.active = true;
            info!(
                "event=ffi_init module=ffi status=ok version={}",
                toodle_core::core_version()
            );
        }
        Ok(())
    })
}

/// Closes every store and releases every listener token still held.
///
/// Handles issued before this call report `UseAfterRelease` afterwards,
/// including after a later `toodle_init`.
#[no_mangle]
pub extern "C" fn toodle_shutdown() -> ToodleStatus {
    run("toodle_shutdown", || {
        let mut guard = lock_state()?;
        let Some(state) = guard.as_mut().filter(|state| state.active) else {
            return Ok(());
        };
        state.active = false;

        let closed = state.session.shutdown();
        state.session.runtime_mut().shutdown();
        let listeners = state.listeners.release_all();
        info!(
            "event=ffi_shutdown module=ffi status=ok listeners={}",
            listeners
        );
        closed.map_err(BoundaryError::from)
    })
}

/// Opens (or reuses) the store at `path`.
///
/// # Safety
/// `path` must be a NUL-terminated string and `out_store` writable.
#[no_mangle]
pub unsafe extern "C" fn toodle_open_store(path: *const c_char, out_store: *mut u64) -> ToodleStatus {
    run("toodle_open_store", || {
        let path = read_str(path, "path")?;
        check_out(out_store)?;
        with_state(|state| {
            let raw = state.session.open_store(path)?.raw();
            write_out(out_store, raw)
        })
    })
}

/// Closes a store and any manager still attached to it.
#[no_mangle]
pub extern "C" fn toodle_close_store(store: u64) -> ToodleStatus {
    run("toodle_close_store", || {
        with_state(|state| {
            let handle = handle_from_raw::<StoreKind>(store)?;
            let path = state.session.runtime().store_path(&handle)?.to_path_buf();
            state.session.close_store(&path)?;
            Ok(())
        })
    })
}

/// # Safety
/// `out_manager` must be writable.
#[no_mangle]
pub unsafe extern "C" fn toodle_list_manager(store: u64, out_manager: *mut u64) -> ToodleStatus {
    run("toodle_list_manager", || {
        check_out(out_manager)?;
        with_state(|state| {
            let store = handle_from_raw::<StoreKind>(store)?;
            let manager = state.session.runtime_mut().list_manager(&store)?;
            write_out(out_manager, manager.into_raw())
        })
    })
}

/// Closes a manager and drops the listener registration it made.
#[no_mangle]
pub extern "C" fn toodle_close_list_manager(manager: u64) -> ToodleStatus {
    run("toodle_close_list_manager", || {
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            state.session.runtime_mut().close_list_manager(manager)?;
            Ok(())
        })
    })
}

/// Creates and persists an item; `due_date` is ignored unless
/// `has_due_date` is set.
///
/// # Safety
/// `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn toodle_create_item(
    manager: u64,
    name: *const c_char,
    has_due_date: bool,
    due_date: i64,
) -> ToodleStatus {
    run("toodle_create_item", || {
        let name = read_str(name, "name")?;
        let due_date = has_due_date.then_some(due_date);
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            state
                .session
                .runtime()
                .manager(&manager)?
                .create_item(name, due_date)?;
            Ok(())
        })
    })
}

/// Allocates an empty item draft.
///
/// # Safety
/// `out_item` must be writable.
#[no_mangle]
pub unsafe extern "C" fn toodle_item_new(out_item: *mut u64) -> ToodleStatus {
    run("toodle_item_new", || {
        check_out(out_item)?;
        with_state(|state| {
            let item = state.session.runtime_mut().item_new();
            write_out(out_item, item.into_raw())
        })
    })
}

/// # Safety
/// `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn toodle_item_set_name(item: u64, name: *const c_char) -> ToodleStatus {
    run("toodle_item_set_name", || {
        let name = read_str(name, "name")?;
        with_draft(item, |draft| {
            draft.set_name(name);
        })
    })
}

#[no_mangle]
pub extern "C" fn toodle_item_set_due_date(item: u64, due_date: i64) -> ToodleStatus {
    run("toodle_item_set_due_date", || {
        with_draft(item, |draft| {
            draft.set_due_date(Some(due_date));
        })
    })
}

#[no_mangle]
pub extern "C" fn toodle_item_clear_due_date(item: u64) -> ToodleStatus {
    run("toodle_item_clear_due_date", || {
        with_draft(item, |draft| {
            draft.set_due_date(None);
        })
    })
}

#[no_mangle]
pub extern "C" fn toodle_item_set_completion_date(item: u64, completion_date: i64) -> ToodleStatus {
    run("toodle_item_set_completion_date", || {
        with_draft(item, |draft| {
            draft.set_completion_date(Some(completion_date));
        })
    })
}

#[no_mangle]
pub extern "C" fn toodle_item_release(item: u64) -> ToodleStatus {
    run("toodle_item_release", || {
        with_state(|state| {
            let item = handle_from_raw::<ItemKind>(item)?;
            state.session.runtime_mut().item_release(item)?;
            Ok(())
        })
    })
}

/// Persists a draft; the draft stays owned by the caller.
#[no_mangle]
pub extern "C" fn toodle_save_item(manager: u64, item: u64) -> ToodleStatus {
    run("toodle_save_item", || {
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            let item = handle_from_raw::<ItemKind>(item)?;
            state.session.runtime().manager(&manager)?.save_item(&item)?;
            Ok(())
        })
    })
}

/// # Safety
/// `uuid` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn toodle_complete_item(
    manager: u64,
    uuid: *const c_char,
    completion_date: i64,
) -> ToodleStatus {
    run("toodle_complete_item", || {
        let id = read_uuid(uuid)?;
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            state
                .session
                .runtime()
                .manager(&manager)?
                .complete_item(id, completion_date)?;
            Ok(())
        })
    })
}

/// # Safety
/// `uuid` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn toodle_delete_item(manager: u64, uuid: *const c_char) -> ToodleStatus {
    run("toodle_delete_item", || {
        let id = read_uuid(uuid)?;
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            state.session.runtime().manager(&manager)?.delete_item(id)?;
            Ok(())
        })
    })
}

/// Applies a partial update to the item `uuid`.
///
/// A null `name` keeps the stored name. `due_mode` and `completion_mode`
/// take `TOODLE_FIELD_KEEP`, `TOODLE_FIELD_SET` (use the value that follows)
/// or `TOODLE_FIELD_CLEAR`. An update that changes nothing does not notify.
///
/// # Safety
/// `uuid` must be a NUL-terminated string; `name` must be null or one.
#[no_mangle]
pub unsafe extern "C" fn toodle_update_item(
    manager: u64,
    uuid: *const c_char,
    name: *const c_char,
    due_mode: u32,
    due_date: i64,
    completion_mode: u32,
    completion_date: i64,
) -> ToodleStatus {
    run("toodle_update_item", || {
        let id = read_uuid(uuid)?;
        let patch = ItemPatch {
            name: read_optional_str(name, "name")?.map(str::to_string),
            due_date: field_update(due_mode, due_date, "due_date")?,
            completion_date: field_update(completion_mode, completion_date, "completion_date")?,
        };
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            state
                .session
                .runtime()
                .manager(&manager)?
                .update_item(id, &patch)?;
            Ok(())
        })
    })
}

/// Returns a one-element set holding the item `uuid`, or null when it does
/// not exist (`NotFound`) or cannot be read.
///
/// # Safety
/// `uuid` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn toodle_fetch_item(
    manager: u64,
    uuid: *const c_char,
) -> *mut ToodleItemSet {
    run_ptr("toodle_fetch_item", || {
        let id = read_uuid(uuid)?;
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            let item = state
                .session
                .runtime()
                .manager(&manager)?
                .fetch_item(id)?
                .ok_or(CoreError::NotFound(id))?;
            Ok(item_set_into_raw(Some(ItemSet::new(vec![item]))))
        })
    })
}

/// Returns every active item in insertion order, or null when the list
/// cannot be read (see `toodle_last_error_message`).
#[no_mangle]
pub extern "C" fn toodle_all_items(manager: u64) -> *mut ToodleItemSet {
    run_ptr("toodle_all_items", || {
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            let items = state.session.runtime().manager(&manager)?.all_items()?;
            Ok(item_set_into_raw(Some(items)))
        })
    })
}

#[no_mangle]
pub extern "C" fn toodle_all_identifiers(manager: u64) -> *mut ToodleIdentifierSet {
    run_ptr("toodle_all_identifiers", || {
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            let identifiers = state
                .session
                .runtime()
                .manager(&manager)?
                .all_identifiers()?;
            Ok(identifier_set_into_raw(Some(identifiers)))
        })
    })
}

/// Releases a set from `toodle_all_items` or a change callback. Null is a no-op.
///
/// # Safety
/// `set` must be null or an unreleased set returned by this library.
#[no_mangle]
pub unsafe extern "C" fn toodle_item_set_release(set: *mut ToodleItemSet) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| marshal::item_set_release(set)));
}

/// # Safety
/// `set` must be null or an unreleased set returned by this library.
#[no_mangle]
pub unsafe extern "C" fn toodle_identifier_set_release(set: *mut ToodleIdentifierSet) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| marshal::identifier_set_release(set)));
}

/// Makes `callback` the only change listener of the manager's list.
///
/// The returned listener handle keeps the registration deliverable; once it
/// is released, changes are dropped with a warning instead of calling back.
///
/// # Safety
/// `user_data` must stay valid until the listener handle is released, and
/// `out_listener` must be writable.
#[no_mangle]
pub unsafe extern "C" fn toodle_register_change_listener(
    manager: u64,
    callback: Option<ToodleChangeCallback>,
    user_data: *mut c_void,
    out_listener: *mut u64,
) -> ToodleStatus {
    run("toodle_register_change_listener", || {
        let callback =
            callback.ok_or_else(|| BoundaryError::invalid_argument("callback is null"))?;
        check_out(out_listener)?;
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            let listener = Arc::new(CallbackListener {
                callback,
                user_data: UserData(user_data),
            });
            state
                .session
                .runtime()
                .manager(&manager)?
                .register_change_listener(&listener);
            let token = state.listeners.acquire(ListenerToken { listener });
            write_out(out_listener, token.into_raw())
        })
    })
}

#[no_mangle]
pub extern "C" fn toodle_unregister_change_listener(manager: u64) -> ToodleStatus {
    run("toodle_unregister_change_listener", || {
        with_state(|state| {
            let manager = handle_from_raw::<ManagerKind>(manager)?;
            state
                .session
                .runtime()
                .manager(&manager)?
                .unregister_change_listener();
            Ok(())
        })
    })
}

/// Releases a listener handle; later changes no longer reach its callback.
#[no_mangle]
pub extern "C" fn toodle_listener_release(listener: u64) -> ToodleStatus {
    run("toodle_listener_release", || {
        with_state(|state| {
            let listener = handle_from_raw::<ListenerKind>(listener)?;
            state.listeners.release(listener)?;
            Ok(())
        })
    })
}

/// Copies the calling thread's last error message, or null if the last call
/// succeeded. Release the result with `toodle_string_release`.
#[no_mangle]
pub extern "C" fn toodle_last_error_message() -> *mut c_char {
    panic::catch_unwind(|| {
        last_error().map_or(ptr::null_mut(), |message| marshal::string_into_raw(&message))
    })
    .unwrap_or(ptr::null_mut())
}

/// # Safety
/// `value` must be null or a string returned by this library.
#[no_mangle]
pub unsafe extern "C" fn toodle_string_release(value: *mut c_char) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| marshal::string_release(value)));
}

fn with_draft(
    item: u64,
    edit: impl FnOnce(&mut toodle_core::ItemDraft),
) -> Result<(), BoundaryError> {
    with_state(|state| {
        let item = handle_from_raw::<ItemKind>(item)?;
        edit(state.session.runtime_mut().item_mut(&item)?);
        Ok(())
    })
}

