//! Native core of the Toodle todo list.
//!
//! Objects live behind typed handles issued by a [`Runtime`]; record sets
//! cross the boundary as [`RecordBatch`]es; committed mutations notify one
//! weakly-held [`ChangeListener`] per collection.

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod handle;
pub mod logging;
pub mod model;
pub mod notify;
pub mod repo;
pub mod runtime;
pub mod session;
pub mod store;

pub use batch::{IdentifierSet, ItemSet, RecordBatch};
pub use config::{ConfigError, CoreConfig};
pub use error::{CoreError, CoreResult};
pub use handle::{
    handle_from_raw, Handle, HandleError, HandleKind, HandleStats, HandleTable, ItemKind,
    ManagerKind, NativeResource, StoreKind,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::item::{Identifier, Item, ItemDraft, ItemId, ItemPatch, ItemValidationError};
pub use notify::{
    ChangeChannel, ChangeListener, ChannelState, ChannelStats, DeliveryOutcome, ItemsChanged,
    QueuedListener, SubscriptionId,
};
pub use repo::item_repo::{ItemRepository, RepoError, RepoResult, SqliteItemRepository};
pub use runtime::{ListManager, Runtime, RuntimeStats};
pub use session::{LifecyclePhase, Session};
pub use store::Store;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
