//! Status codes and the per-thread last-error slot.
//!
//! # Invariants
//! - Every exported call either returns `Ok` and clears the slot, or returns
//!   a failure code and stores a message for `toodle_last_error_message`.

use std::cell::RefCell;
use std::fmt::Display;
use toodle_core::{CoreError, HandleError};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToodleStatus {
    Ok = 0,
    /// Null pointer, non-UTF-8 text, malformed id or null handle.
    InvalidArgument = 1,
    Validation = 2,
    NativeConstruction = 3,
    UseAfterRelease = 4,
    NotFound = 5,
    Storage = 6,
    NotInitialized = 7,
    /// Called from inside a change callback while the triggering call still
    /// holds the boundary.
    Busy = 8,
    Panic = 9,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Failure carried back to the exported function that hit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BoundaryError {
    pub status: ToodleStatus,
    pub message: String,
}

impl BoundaryError {
    pub fn new(status: ToodleStatus, message: impl Display) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    pub fn invalid_argument(message: impl Display) -> Self {
        Self::new(ToodleStatus::InvalidArgument, message)
    }

    pub fn not_initialized() -> Self {
        Self::new(
            ToodleStatus::NotInitialized,
            "toodle_init has not been called",
        )
    }

    pub fn busy() -> Self {
        Self::new(
            ToodleStatus::Busy,
            "re-entrant toodle call from inside a change callback",
        )
    }
}

impl From<CoreError> for BoundaryError {
    fn from(value: CoreError) -> Self {
        let status = match &value {
            CoreError::NativeConstruction { .. } => ToodleStatus::NativeConstruction,
            CoreError::Validation(_) => ToodleStatus::Validation,
            CoreError::UseAfterRelease(HandleError::Invalid { .. }) => {
                ToodleStatus::InvalidArgument
            }
            CoreError::UseAfterRelease(HandleError::Released { .. }) | CoreError::NotOpen(_) => {
                ToodleStatus::UseAfterRelease
            }
            CoreError::NotFound(_) => ToodleStatus::NotFound,
            CoreError::Storage(_) => ToodleStatus::Storage,
        };
        Self::new(status, value)
    }
}

impl From<HandleError> for BoundaryError {
    fn from(value: HandleError) -> Self {
        CoreError::from(value).into()
    }
}

pub(crate) fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

pub(crate) fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::{clear_last_error, last_error, set_last_error, BoundaryError, ToodleStatus};
    use toodle_core::{handle_from_raw, CoreError, ItemValidationError, StoreKind};

    #[test]
    fn core_errors_map_to_stable_codes() {
        let validation: BoundaryError = CoreError::Validation(ItemValidationError::EmptyName).into();
        assert_eq!(validation.status, ToodleStatus::Validation);

        let null_handle: BoundaryError = handle_from_raw::<StoreKind>(0).unwrap_err().into();
        assert_eq!(null_handle.status, ToodleStatus::InvalidArgument);
        assert!(null_handle.message.contains("store"));
    }

    #[test]
    fn last_error_is_per_thread() {
        set_last_error("boom".to_string());
        let other = std::thread::spawn(last_error).join().unwrap();

        assert_eq!(other, None);
        assert_eq!(last_error().as_deref(), Some("boom"));
        clear_last_error();
        assert_eq!(last_error(), None);
    }
}
