//! Sync-server HTTP adapters.
//!
//! One [`SyncServerClient`] implements the profile, tenant-directory and
//! change-feed ports; [`CouchRemoteStore`] wraps it for replication.

mod change_feed;
mod dto;
mod profile_directory;
mod remote_store;
mod tenant_directory;
mod transport;

pub use remote_store::CouchRemoteStore;
pub use transport::SyncServerClient;
