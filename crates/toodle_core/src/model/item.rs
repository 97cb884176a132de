//! Todo item domain model.
//!
//! # Responsibility
//! - Define the persisted `Item` record and its lightweight `Identifier`.
//! - Provide the builder-style `ItemDraft` used before persistence.
//! - Normalize and validate display names before any storage call.
//!
//! # Invariants
//! - `id` is stable and never reused for another item.
//! - A persisted item always has a non-empty normalized name.
//! - Items returned from queries are immutable snapshots.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Stable identifier assigned natively when an item is created.
pub type ItemId = Uuid;

/// Validation failures raised before an item crosses into storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemValidationError {
    /// Name is empty after trimming and whitespace collapsing.
    EmptyName,
}

impl Display for ItemValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "item name must not be empty"),
        }
    }
}

impl Error for ItemValidationError {}

/// Persisted todo item snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Display name, already normalized.
    pub name: String,
    /// Unix epoch milliseconds.
    pub due_date: Option<i64>,
    /// Unix epoch milliseconds.
    pub completion_date: Option<i64>,
}

impl Item {
    /// Returns the lightweight key for this item.
    pub fn identifier(&self) -> Identifier {
        Identifier(self.id)
    }

    pub fn is_complete(&self) -> bool {
        self.completion_date.is_some()
    }
}

/// Record key used by existence/iteration queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(pub ItemId);

impl Identifier {
    pub fn id(self) -> ItemId {
        self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutable item under construction.
///
/// Drafts have no identity; one is assigned when the draft is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDraft {
    name: String,
    due_date: Option<i64>,
    completion_date: Option<i64>,
}

impl ItemDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn set_due_date(&mut self, due_date: Option<i64>) -> &mut Self {
        self.due_date = due_date;
        self
    }

    pub fn set_completion_date(&mut self, completion_date: Option<i64>) -> &mut Self {
        self.completion_date = completion_date;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn due_date(&self) -> Option<i64> {
        self.due_date
    }

    pub fn completion_date(&self) -> Option<i64> {
        self.completion_date
    }

    /// Validates the draft and assigns a fresh identity.
    ///
    /// # Errors
    /// - `ItemValidationError::EmptyName` when the normalized name is empty.
    pub fn build(&self) -> Result<Item, ItemValidationError> {
        Ok(Item {
            id: Uuid::new_v4(),
            name: normalize_name(&self.name)?,
            due_date: self.due_date,
            completion_date: self.completion_date,
        })
    }
}

/// Partial update applied to an existing item.
///
/// Outer `None` keeps the stored value; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub due_date: Option<Option<i64>>,
    pub completion_date: Option<Option<i64>>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.due_date.is_none() && self.completion_date.is_none()
    }

    /// Applies this patch on top of a stored snapshot.
    pub fn apply(&self, current: &Item) -> Result<Item, ItemValidationError> {
        let name = match &self.name {
            Some(name) => normalize_name(name)?,
            None => current.name.clone(),
        };
        Ok(Item {
            id: current.id,
            name,
            due_date: self.due_date.unwrap_or(current.due_date),
            completion_date: self.completion_date.unwrap_or(current.completion_date),
        })
    }
}

/// Trims and collapses whitespace, rejecting names that end up empty.
pub fn normalize_name(raw: &str) -> Result<String, ItemValidationError> {
    let collapsed = WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned();
    if collapsed.is_empty() {
        return Err(ItemValidationError::EmptyName);
    }
    Ok(collapsed)
}
