//! Driven port for the remote replication database.
//!
//! The shape follows the CouchDB replication surface: an info probe, an
//! incremental changes feed and a bulk write that keeps supplied revisions.

use async_trait::async_trait;

use crate::domain::Document;

use super::{ChangeBatch, RemoteCallError};

/// Database summary returned by the info probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Database name as reported by the server.
    pub database: String,
    /// Current update sequence, when numeric.
    pub update_sequence: Option<u64>,
}

/// Remote side of the replication stream.
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Probe the database; proves reachability and authorisation.
    async fn info(&self) -> Result<RemoteInfo, RemoteCallError>;

    /// Changes after `since`, documents included, at most `limit` entries.
    async fn changes_since(&self, since: u64, limit: usize)
    -> Result<ChangeBatch, RemoteCallError>;

    /// Write documents with their existing revisions (no new edits).
    async fn bulk_write(&self, documents: &[Document]) -> Result<(), RemoteCallError>;
}
