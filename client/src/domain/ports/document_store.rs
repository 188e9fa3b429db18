//! Port for the local document store.
//!
//! The [`DocumentStore`] trait is the only way services touch local documents.
//! Writes use optimistic concurrency: a `put` must carry the revision the
//! caller last read, otherwise the adapter reports
//! [`DocumentStoreError::Conflict`]. There is no multi-document transaction.

use async_trait::async_trait;

use crate::domain::{Document, DocumentId, KeyRange, Revision};

use super::define_port_error;

define_port_error! {
    /// Errors raised by document store adapters.
    pub enum DocumentStoreError {
        /// No document is stored under the key.
        NotFound { id: String } =>
            "document {id} not found" as NotFound,
        /// The supplied revision does not match the stored revision.
        Conflict { id: String } =>
            "document update conflict for {id}" as Conflict,
        /// Underlying storage failed.
        Storage { message: String } =>
            "document store failure: {message}" as InternalError,
        /// Stored bytes could not be decoded or encoded.
        Serialization { message: String } =>
            "document serialisation failed: {message}" as InternalError,
    }
}

/// One entry of the local write journal.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    /// Store-wide sequence assigned to the write.
    pub sequence: u64,
    /// Document state after the write.
    pub document: Document,
}

/// Outcome of storing a document that carries a foreign revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatedWrite {
    /// The incoming revision won and was stored.
    Applied,
    /// The stored revision is equal or newer; nothing changed.
    Superseded,
}

/// Port for local document storage.
///
/// # Revision Semantics
///
/// - Creating a document requires `revision == None`.
/// - Updating requires the exact stored revision.
/// - Every successful `put` returns the new revision; generations start at 1.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document.
    async fn get(&self, id: &DocumentId) -> Result<Document, DocumentStoreError>;

    /// Create or update one document with a revision check.
    async fn put(&self, document: &Document) -> Result<Revision, DocumentStoreError>;

    /// Return up to `limit` documents in key order inside `range`, strictly
    /// after `after` when given.
    async fn scan_page(
        &self,
        range: &KeyRange,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError>;

    /// Return writes with a sequence strictly greater than `sequence`, oldest
    /// first, at most one entry per document.
    async fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> Result<Vec<LocalChange>, DocumentStoreError>;

    /// Store a replicated copy, keeping whichever revision wins.
    async fn apply_replicated(
        &self,
        document: &Document,
    ) -> Result<ReplicatedWrite, DocumentStoreError>;
}

/// Fetch a document, mapping [`DocumentStoreError::NotFound`] to `None`.
///
/// # Examples
///
/// ```rust,ignore
/// let maybe = find_document(store.as_ref(), &id).await?;
/// assert!(maybe.is_none());
/// ```
pub async fn find_document(
    store: &dyn DocumentStore,
    id: &DocumentId,
) -> Result<Option<Document>, DocumentStoreError> {
    match store.get(id).await {
        Ok(document) => Ok(Some(document)),
        Err(DocumentStoreError::NotFound { .. }) => Ok(None),
        Err(error) => Err(error),
    }
}
