//! C ABI boundary for the Toodle core.
//!
//! # Responsibility
//! - Export the todo list operations as `extern "C"` functions over raw
//!   `u64` handles.
//! - Marshal item and identifier sets into `#[repr(C)]` layouts with
//!   explicit release functions.
//!
//! # Invariants
//! - No exported function unwinds across the boundary.
//! - Every marshalled allocation is counted in [`marshal::ledger`].

pub mod api;
pub mod marshal;
pub mod status;

pub use api::{ToodleChangeCallback, TOODLE_FIELD_CLEAR, TOODLE_FIELD_KEEP, TOODLE_FIELD_SET};
pub use marshal::{
    ledger, MarshalLedger, ToodleIdentifier, ToodleIdentifierSet, ToodleItem, ToodleItemSet,
};
pub use status::ToodleStatus;
