//! Todo domain model.
//!
//! # Responsibility
//! - Define the item record shared by queries, drafts and batches.
//! - Own name normalization and validation rules.
//!
//! # Invariants
//! - Every item is identified by a stable `ItemId` assigned on creation.
//! - Deletion is represented by soft-delete tombstones, not hard delete.

pub mod item;
