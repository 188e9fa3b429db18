//! In-memory document store for tests and ephemeral sessions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::ports::{DocumentStore, DocumentStoreError, LocalChange, ReplicatedWrite};
use crate::domain::{Document, DocumentId, KeyRange, Revision};

use super::revision_check::{check_revision, replicated_revision};

#[derive(Default)]
struct State {
    documents: BTreeMap<DocumentId, StoredDocument>,
    sequence: u64,
}

struct StoredDocument {
    document: Document,
    sequence: u64,
}

impl State {
    fn store(&mut self, document: Document) {
        self.sequence += 1;
        let sequence = self.sequence;
        self.documents
            .insert(document.id.clone(), StoredDocument { document, sequence });
    }
}

/// Document store held entirely in memory; contents vanish with the value.
#[derive(Default)]
pub struct MemoryDocumentStore {
    state: Mutex<State>,
}

impl MemoryDocumentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, DocumentStoreError> {
        self.state
            .lock()
            .map_err(|_| DocumentStoreError::storage("memory store lock poisoned"))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: &DocumentId) -> Result<Document, DocumentStoreError> {
        let state = self.lock()?;
        state
            .documents
            .get(id)
            .map(|stored| stored.document.clone())
            .ok_or_else(|| DocumentStoreError::not_found(id.as_str()))
    }

    async fn put(&self, document: &Document) -> Result<Revision, DocumentStoreError> {
        let mut state = self.lock()?;
        let stored = state
            .documents
            .get(&document.id)
            .and_then(|stored| stored.document.revision.clone());
        check_revision(&document.id, stored.as_ref(), document.revision.as_ref())?;
        let revision = Revision::next(stored.as_ref(), &document.body);
        state.store(document.clone().with_revision(Some(revision.clone())));
        Ok(revision)
    }

    async fn scan_page(
        &self,
        range: &KeyRange,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        let state = self.lock()?;
        Ok(state
            .documents
            .values()
            .map(|stored| &stored.document)
            .filter(|document| range.contains(document.id.as_str()))
            .filter(|document| after.is_none_or(|after| document.id > *after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> Result<Vec<LocalChange>, DocumentStoreError> {
        let state = self.lock()?;
        let mut changes: Vec<_> = state
            .documents
            .values()
            .filter(|stored| stored.sequence > sequence)
            .map(|stored| LocalChange {
                sequence: stored.sequence,
                document: stored.document.clone(),
            })
            .collect();
        changes.sort_by_key(|change| change.sequence);
        changes.truncate(limit);
        Ok(changes)
    }

    async fn apply_replicated(
        &self,
        document: &Document,
    ) -> Result<ReplicatedWrite, DocumentStoreError> {
        let mut state = self.lock()?;
        let stored = state
            .documents
            .get(&document.id)
            .and_then(|stored| stored.document.revision.clone());
        let outcome = replicated_revision(document, stored.as_ref())?;
        if outcome == ReplicatedWrite::Applied {
            state.store(document.clone());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    //! Behavioural coverage of revision checks on the in-memory adapter.

    use super::*;
    use serde_json::{Value, json};

    fn document(id: &str, name: &str) -> Document {
        let Value::Object(body) = json!({ "type": "tenant", "name": name }) else {
            panic!("object literal");
        };
        Document::new(DocumentId::new(id).expect("valid id"), body)
    }

    #[tokio::test]
    async fn stale_revision_conflicts_and_fresh_revision_wins() {
        let store = MemoryDocumentStore::new();
        let first = store.put(&document("tenant_t1", "Acme")).await.expect("create");

        let update = document("tenant_t1", "Acme Ltd").with_revision(Some(first.clone()));
        let second = store.put(&update).await.expect("update");
        assert_eq!(second.generation(), 2);

        let stale = document("tenant_t1", "Stale").with_revision(Some(first));
        assert!(matches!(
            store.put(&stale).await,
            Err(DocumentStoreError::Conflict { .. })
        ));
        let stored = store
            .get(&DocumentId::new("tenant_t1").expect("id"))
            .await
            .expect("stored");
        assert_eq!(stored.body["name"], json!("Acme Ltd"));
    }

    #[tokio::test]
    async fn creating_over_an_existing_document_conflicts() {
        let store = MemoryDocumentStore::new();
        store.put(&document("tenant_t1", "Acme")).await.expect("create");
        assert!(matches!(
            store.put(&document("tenant_t1", "Again")).await,
            Err(DocumentStoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn journal_reports_latest_write_per_document() {
        let store = MemoryDocumentStore::new();
        let rev = store.put(&document("gig_1", "a")).await.expect("create");
        store.put(&document("gig_2", "b")).await.expect("create");
        store
            .put(&document("gig_1", "c").with_revision(Some(rev)))
            .await
            .expect("update");

        let changes = store.changes_since(0, 10).await.expect("journal");
        let ids: Vec<_> = changes
            .iter()
            .map(|change| (change.document.id.as_str(), change.sequence))
            .collect();
        assert_eq!(ids, vec![("gig_2", 2), ("gig_1", 3)]);
        assert!(store.changes_since(3, 10).await.expect("journal").is_empty());
    }

    #[tokio::test]
    async fn replicated_write_keeps_the_winning_revision() {
        let store = MemoryDocumentStore::new();
        let older = document("gig_1", "old")
            .with_revision(Some(Revision::parse("2-aaa").expect("rev")));
        let newer = document("gig_1", "new")
            .with_revision(Some(Revision::parse("3-aaa").expect("rev")));

        assert_eq!(
            store.apply_replicated(&newer).await.expect("apply"),
            ReplicatedWrite::Applied
        );
        assert_eq!(
            store.apply_replicated(&older).await.expect("apply"),
            ReplicatedWrite::Superseded
        );
        let stored = store.get(&newer.id).await.expect("stored");
        assert_eq!(stored.body["name"], json!("new"));
    }
}
