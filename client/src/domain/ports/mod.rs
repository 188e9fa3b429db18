//! Domain ports for the hexagonal boundary.
//!
//! Services depend on these traits only; adapters live under `outbound`.

mod macros;
pub(crate) use macros::define_port_error;

mod change_feed_source;
mod document_store;
mod identity_provider;
mod profile_directory;
mod remote_call_error;
mod remote_document_store;
mod tenant_directory;

#[cfg(test)]
pub use change_feed_source::MockChangeFeedSource;
pub use change_feed_source::{ChangeBatch, ChangeFeedSource, ChangeRecord, FeedName};
pub use document_store::{
    DocumentStore, DocumentStoreError, LocalChange, ReplicatedWrite, find_document,
};
#[cfg(test)]
pub use identity_provider::MockIdentityProvider;
pub use identity_provider::{IdentityProvider, IdentityProviderError, TokenRequest};
#[cfg(test)]
pub use profile_directory::MockProfileDirectory;
pub use profile_directory::ProfileDirectory;
pub use remote_call_error::RemoteCallError;
pub use remote_document_store::{RemoteDocumentStore, RemoteInfo};
#[cfg(test)]
pub use tenant_directory::MockTenantDirectory;
pub use tenant_directory::TenantDirectory;
