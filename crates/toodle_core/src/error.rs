//! Crate-level error taxonomy surfaced to runtime and boundary callers.
//!
//! # Invariants
//! - Validation failures never reach SQL.
//! - No variant is retried automatically; every failure goes straight back
//!   to the caller of the triggering operation.

use crate::db::DbError;
use crate::handle::HandleError;
use crate::model::item::{ItemId, ItemValidationError};
use crate::repo::item_repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
    /// The store at `path` could not be opened or migrated.
    NativeConstruction { path: PathBuf, source: DbError },
    /// Caller-supplied data was rejected before any storage call.
    Validation(ItemValidationError),
    /// A raw handle value was stale, foreign or null.
    UseAfterRelease(HandleError),
    NotFound(ItemId),
    /// The session holds no store for this path.
    NotOpen(PathBuf),
    Storage(RepoError),
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NativeConstruction { path, source } => {
                write!(f, "failed to open store at `{}`: {source}", path.display())
            }
            Self::Validation(err) => write!(f, "{err}"),
            Self::UseAfterRelease(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "item not found: {id}"),
            Self::NotOpen(path) => write!(f, "no open store for `{}`", path.display()),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NativeConstruction { source, .. } => Some(source),
            Self::Validation(err) => Some(err),
            Self::UseAfterRelease(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::NotFound(_) | Self::NotOpen(_) => None,
        }
    }
}

impl From<ItemValidationError> for CoreError {
    fn from(value: ItemValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<HandleError> for CoreError {
    fn from(value: HandleError) -> Self {
        Self::UseAfterRelease(value)
    }
}

impl From<RepoError> for CoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::Validation(err) => Self::Validation(err),
            other => Self::Storage(other),
        }
    }
}
