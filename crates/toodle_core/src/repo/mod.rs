//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts for items.
//! - Isolate SQLite query details from the runtime and session layers.
//!
//! # Invariants
//! - Repository writes re-validate item names before persistence.
//! - Repository APIs return semantic errors (`NotFound`) in addition to DB
//!   transport errors.

pub mod item_repo;
