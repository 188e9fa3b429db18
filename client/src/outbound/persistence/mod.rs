//! Local persistence adapters.

mod local_settings;
mod memory_document_store;
mod revision_check;
mod sqlite_document_store;

pub use local_settings::{LocalSettingsError, LocalSettingsStore};
pub use memory_document_store::MemoryDocumentStore;
pub use sqlite_document_store::SqliteDocumentStore;

/// Partition holding tenant directory entries and business documents.
pub const ROADY_PARTITION: &str = "roady";
/// Partition holding the current user's profile.
pub const USERS_PARTITION: &str = "users";
